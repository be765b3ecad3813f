//! Batched cache warmup.
//!
//! Identifiers are warmed in order-preserving batches. Items within a batch
//! run concurrently, each under its own deadline, and a failed or slow item
//! never affects its neighbours. Batches are separated by a fixed pause so
//! the upstream's rate limit is respected.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, normalize_content_id, rw_read, rw_write};

use super::page::PageService;

const SOURCE: &str = "application::warmup";
const MAX_RECENT_ERRORS: usize = 50;
const MAX_ERROR_LEN: usize = 200;

pub(crate) const METRIC_WARMUP_BATCH_MS: &str = "kura_warmup_batch_ms";

/// Shape of one warmup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupPlan {
    pub batch_size: NonZeroUsize,
    pub batch_delay: Duration,
    pub item_timeout: Duration,
}

impl WarmupPlan {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            batch_size: config.warmup_batch_size_non_zero(),
            batch_delay: config.warmup_batch_delay,
            item_timeout: config.warmup_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WarmupItemOutcome {
    Warmed { fingerprint: String },
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmupItemReport {
    pub id: String,
    #[serde(flatten)]
    pub outcome: WarmupItemOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// 1-based batch number.
    pub batch: usize,
    pub items: Vec<WarmupItemReport>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub run_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// The run stopped early on cancellation.
    pub cancelled: bool,
    pub batches: Vec<BatchReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupErrorRecord {
    pub id: String,
    pub error: String,
}

/// Progress of the current or most recent run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupStatus {
    pub is_running: bool,
    pub run_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub cancelled: bool,
    /// Most recent failures, oldest dropped first.
    pub errors: Vec<WarmupErrorRecord>,
}

impl WarmupStatus {
    fn record(&mut self, item: &WarmupItemReport) {
        self.processed += 1;
        let error = match &item.outcome {
            WarmupItemOutcome::Warmed { .. } => {
                self.succeeded += 1;
                return;
            }
            WarmupItemOutcome::Failed { error } => {
                self.failed += 1;
                truncate(error)
            }
            WarmupItemOutcome::TimedOut => {
                self.timed_out += 1;
                "timed out".to_string()
            }
        };
        if self.errors.len() == MAX_RECENT_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(WarmupErrorRecord {
            id: item.id.clone(),
            error,
        });
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WarmupError {
    #[error("a warmup run is already in progress")]
    AlreadyRunning,
}

/// Clears the running flag and the active cancel token when a run ends,
/// however it ends. Dropping an unstarted [`WarmupRun`] releases the claim.
struct RunGuard {
    status: Arc<RwLock<WarmupStatus>>,
    active: Arc<RwLock<Option<CancellationToken>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        rw_write(&self.active, SOURCE, "release").take();
        let mut status = rw_write(&self.status, SOURCE, "finish");
        status.is_running = false;
        status.finished_at = Some(OffsetDateTime::now_utc());
    }
}

#[derive(Clone)]
pub struct WarmupScheduler {
    pages: PageService,
    status: Arc<RwLock<WarmupStatus>>,
    active: Arc<RwLock<Option<CancellationToken>>>,
}

impl WarmupScheduler {
    pub fn new(pages: PageService) -> Self {
        Self {
            pages,
            status: Arc::new(RwLock::new(WarmupStatus::default())),
            active: Arc::new(RwLock::new(None)),
        }
    }

    /// Snapshot of the current or last run.
    pub fn status(&self) -> WarmupStatus {
        rw_read(&self.status, SOURCE, "status").clone()
    }

    /// Claim the scheduler for a run over `ids`. The running flag is set
    /// before this returns, so a second claim fails with
    /// [`WarmupError::AlreadyRunning`] until the returned run is finished or
    /// dropped. Duplicates (after normalization) are warmed once.
    pub fn try_begin(
        &self,
        ids: &[String],
        plan: WarmupPlan,
        cancel: CancellationToken,
    ) -> Result<WarmupRun, WarmupError> {
        let ids = dedup_normalized(ids);
        let total_batches = ids.len().div_ceil(plan.batch_size.get());
        let run_id = Uuid::new_v4();

        {
            let mut status = rw_write(&self.status, SOURCE, "begin");
            if status.is_running {
                return Err(WarmupError::AlreadyRunning);
            }
            *status = WarmupStatus {
                is_running: true,
                run_id: Some(run_id),
                started_at: Some(OffsetDateTime::now_utc()),
                total: ids.len(),
                total_batches,
                ..WarmupStatus::default()
            };
        }
        *rw_write(&self.active, SOURCE, "claim") = Some(cancel.clone());

        Ok(WarmupRun {
            scheduler: self.clone(),
            ids,
            plan,
            run_id,
            total_batches,
            cancel,
            _guard: RunGuard {
                status: self.status.clone(),
                active: self.active.clone(),
            },
        })
    }

    /// Warm `ids` according to `plan`: [`Self::try_begin`] followed by
    /// [`WarmupRun::run`].
    pub async fn warm(
        &self,
        ids: &[String],
        plan: WarmupPlan,
        cancel: CancellationToken,
    ) -> Result<WarmupReport, WarmupError> {
        Ok(self.try_begin(ids, plan, cancel)?.run().await)
    }

    /// Cancel the active run, if any. Returns whether a run was signalled.
    pub fn cancel(&self) -> bool {
        match rw_read(&self.active, SOURCE, "cancel").as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn warm_item(&self, id: &str, deadline: Duration) -> WarmupItemReport {
        let outcome = match tokio::time::timeout(deadline, self.pages.warm(id)).await {
            Ok(Ok(page)) => WarmupItemOutcome::Warmed {
                fingerprint: page.fingerprint,
            },
            Ok(Err(err)) => {
                warn!(id, outcome = "failed", error = %err, "warmup item failed");
                WarmupItemOutcome::Failed {
                    error: err.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    id,
                    outcome = "timed_out",
                    timeout_ms = deadline.as_millis() as u64,
                    "warmup item timed out"
                );
                WarmupItemOutcome::TimedOut
            }
        };
        WarmupItemReport {
            id: id.to_string(),
            outcome,
        }
    }
}

/// A claimed warmup run. The scheduler reports it as running from
/// [`WarmupScheduler::try_begin`] until this value is consumed or dropped.
pub struct WarmupRun {
    scheduler: WarmupScheduler,
    ids: Vec<String>,
    plan: WarmupPlan,
    run_id: Uuid,
    total_batches: usize,
    cancel: CancellationToken,
    _guard: RunGuard,
}

impl WarmupRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Identifiers this run will warm, normalized and deduplicated.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Cancellation is observed between batches and during the pause; a
    /// batch already in flight is always awaited.
    #[instrument(skip_all, fields(run_id = %self.run_id, total = self.ids.len()))]
    pub async fn run(self) -> WarmupReport {
        let Self {
            scheduler,
            ids,
            plan,
            run_id,
            total_batches,
            cancel,
            _guard,
        } = self;
        let status = &scheduler.status;

        info!(%run_id, total = ids.len(), total_batches, "warmup started");

        let mut report = WarmupReport {
            run_id,
            total: ids.len(),
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            cancelled: false,
            batches: Vec::with_capacity(total_batches),
        };

        for (index, batch) in ids.chunks(plan.batch_size.get()).enumerate() {
            let number = index + 1;
            if index > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(plan.batch_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            rw_write(status, SOURCE, "batch_start").current_batch = number;
            let started_at = Instant::now();
            let items =
                join_all(batch.iter().map(|id| scheduler.warm_item(id, plan.item_timeout))).await;
            let elapsed = started_at.elapsed();
            histogram!(METRIC_WARMUP_BATCH_MS).record(elapsed.as_secs_f64() * 1000.0);

            {
                let mut status = rw_write(status, SOURCE, "batch_done");
                for item in &items {
                    status.record(item);
                }
            }
            for item in &items {
                match item.outcome {
                    WarmupItemOutcome::Warmed { .. } => report.succeeded += 1,
                    WarmupItemOutcome::Failed { .. } => report.failed += 1,
                    WarmupItemOutcome::TimedOut => report.timed_out += 1,
                }
            }

            info!(
                %run_id,
                batch = number,
                total_batches,
                size = items.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "warmup batch complete"
            );
            report.batches.push(BatchReport {
                batch: number,
                items,
                elapsed_ms: elapsed.as_millis(),
            });
        }

        if report.cancelled {
            rw_write(status, SOURCE, "cancel").cancelled = true;
            warn!(%run_id, completed_batches = report.batches.len(), "warmup cancelled");
        }
        info!(
            %run_id,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            "warmup finished"
        );
        report
    }
}

/// Normalize identifiers and drop repeats, keeping first-seen order.
fn dedup_normalized(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| normalize_content_id(id.trim()))
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn dedup_keeps_first_occurrence_of_each_normalized_id() {
        let deduped = dedup_normalized(&ids(&[
            "b",
            "0123abcd-4567-89ef-0123-456789abcdef",
            "a",
            "0123abcd456789ef0123456789abcdef",
            "b",
            " ",
        ]));
        assert_eq!(deduped, ids(&["b", "0123abcd456789ef0123456789abcdef", "a"]));
    }

    #[test]
    fn status_keeps_bounded_truncated_errors() {
        let mut status = WarmupStatus::default();
        for n in 0..(MAX_RECENT_ERRORS + 5) {
            status.record(&WarmupItemReport {
                id: n.to_string(),
                outcome: WarmupItemOutcome::Failed {
                    error: "x".repeat(500),
                },
            });
        }
        assert_eq!(status.failed, MAX_RECENT_ERRORS + 5);
        assert_eq!(status.errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(status.errors[0].id, "5");
        assert_eq!(status.errors[0].error.len(), MAX_ERROR_LEN);
    }

    #[test]
    fn plan_follows_configuration() {
        let plan = WarmupPlan::from_config(&CacheConfig {
            warmup_batch_size: 0,
            ..Default::default()
        });
        assert_eq!(plan.batch_size.get(), 1);
        assert_eq!(plan.batch_delay, Duration::from_millis(10_000));
        assert_eq!(plan.item_timeout, Duration::from_millis(30_000));
    }
}
