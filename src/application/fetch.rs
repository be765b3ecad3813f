//! Fetching with graceful degradation.
//!
//! Auxiliary collection data is the expensive, failure-prone part of an
//! upstream fetch. A failed attempt is repeated once without it; only when
//! that also fails does the caller see an error.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::content::{Content, ContentSource, FetchOptions, FetchRequest, SourceError};

pub(crate) const METRIC_FETCH_MS: &str = "kura_fetch_ms";

/// Process-wide fetch behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Kill switch: never request auxiliary data, not even on the first try.
    pub disable_auxiliary: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Both the full and the degraded attempt failed. `source` is the error
    /// of the degraded attempt.
    #[error("content `{id}` could not be fetched, even without auxiliary data")]
    Degraded {
        id: String,
        first_attempt: String,
        #[source]
        source: SourceError,
    },
}

impl FetchError {
    pub fn id(&self) -> &str {
        match self {
            FetchError::Degraded { id, .. } => id,
        }
    }
}

/// Wraps a [`ContentSource`] with one degraded retry.
#[derive(Clone)]
pub struct DegradingFetcher {
    source: Arc<dyn ContentSource>,
    policy: FetchPolicy,
}

impl DegradingFetcher {
    pub fn new(source: Arc<dyn ContentSource>, policy: FetchPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> FetchPolicy {
        self.policy
    }

    /// Resolve `request` and fetch.
    pub async fn fetch(&self, id: &str, request: FetchRequest) -> Result<Content, FetchError> {
        self.fetch_with(id, request.resolve()).await
    }

    /// Fetch with resolved options. Makes at most two sequential attempts.
    #[instrument(skip(self, options))]
    pub async fn fetch_with(&self, id: &str, options: FetchOptions) -> Result<Content, FetchError> {
        let started_at = Instant::now();
        let first_options = if self.policy.disable_auxiliary {
            options.without_auxiliary()
        } else {
            options
        };

        let first = match self.source.fetch_page(id, &first_options).await {
            Ok(content) => {
                record_fetch(started_at, "ok");
                return Ok(content);
            }
            Err(err) => err,
        };

        warn!(
            id,
            attempt = 1,
            error = %first,
            "content fetch failed, retrying without auxiliary data"
        );

        match self
            .source
            .fetch_page(id, &first_options.without_auxiliary())
            .await
        {
            Ok(content) => {
                info!(id, attempt = 2, outcome = "degraded", "served content without auxiliary data");
                record_fetch(started_at, "degraded");
                Ok(content)
            }
            Err(second) => {
                error!(
                    id,
                    attempt = 2,
                    first_error = %first,
                    error = %second,
                    "content fetch failed after degraded retry"
                );
                record_fetch(started_at, "failed");
                Err(FetchError::Degraded {
                    id: id.to_string(),
                    first_attempt: first.to_string(),
                    source: second,
                })
            }
        }
    }
}

fn record_fetch(started_at: Instant, outcome: &'static str) {
    histogram!(METRIC_FETCH_MS, "outcome" => outcome)
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Records every call and answers from a script, one result per call.
    struct ScriptedSource {
        script: Mutex<Vec<Result<Content, SourceError>>>,
        calls: Mutex<Vec<FetchOptions>>,
    }

    impl ScriptedSource {
        fn new(mut script: Vec<Result<Content, SourceError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<FetchOptions> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ContentSource for ScriptedSource {
        async fn fetch_page(&self, _id: &str, options: &FetchOptions) -> Result<Content, SourceError> {
            self.calls.lock().expect("calls lock").push(*options);
            self.script
                .lock()
                .expect("script lock")
                .pop()
                .unwrap_or_else(|| Err(SourceError::request("script exhausted")))
        }
    }

    fn fetcher(source: Arc<ScriptedSource>, disable_auxiliary: bool) -> DegradingFetcher {
        DegradingFetcher::new(source, FetchPolicy { disable_auxiliary })
    }

    #[tokio::test]
    async fn success_needs_one_attempt() {
        let source = ScriptedSource::new(vec![Ok(json!({"title": "full"}))]);
        let content = fetcher(source.clone(), false)
            .fetch("abc", FetchRequest::default())
            .await
            .expect("content");

        assert_eq!(content, json!({"title": "full"}));
        let calls = source.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].fetch_auxiliary);
    }

    #[tokio::test]
    async fn failure_retries_once_without_auxiliary() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::status(500, "collection exploded")),
            Ok(json!({"title": "degraded"})),
        ]);
        let request = FetchRequest {
            chunk_limit: Some(7),
            ..Default::default()
        };
        let content = fetcher(source.clone(), false)
            .fetch("abc", request)
            .await
            .expect("degraded content");

        assert_eq!(content, json!({"title": "degraded"}));
        let calls = source.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].fetch_auxiliary);
        assert!(!calls[1].fetch_auxiliary);
        // Everything except the auxiliary flag is carried over unchanged.
        assert_eq!(calls[1], calls[0].without_auxiliary());
        assert_eq!(calls[1].chunk_limit, 7);
    }

    #[tokio::test]
    async fn double_failure_surfaces_second_error() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::status(500, "first")),
            Err(SourceError::status(503, "second")),
        ]);
        let err = fetcher(source.clone(), false)
            .fetch("abc", FetchRequest::default())
            .await
            .expect_err("both attempts fail");

        assert_eq!(source.calls().len(), 2);
        assert_eq!(err.id(), "abc");
        let FetchError::Degraded { first_attempt, .. } = &err;
        assert!(first_attempt.contains("first"));
        let cause = err.source().expect("source error").to_string();
        assert!(cause.contains("503"), "unexpected cause: {cause}");
    }

    #[tokio::test]
    async fn kill_switch_disables_auxiliary_on_every_attempt() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::request("timeout")),
            Err(SourceError::request("timeout")),
        ]);
        let result = fetcher(source.clone(), true)
            .fetch("abc", FetchRequest::default())
            .await;

        assert!(result.is_err());
        let calls = source.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|options| !options.fetch_auxiliary));
    }
}
