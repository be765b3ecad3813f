//! Backend-agnostic statistics.
//!
//! Both sections are always present with the same fields, whichever backend
//! is serving, so dashboards never have to branch on configuration.

use serde::Serialize;

use super::backend::BackendStats;
use super::error::CacheError;
use super::selector::{BackendKind, CacheHandle, RemoteStatus};

const STATUS_ACTIVE: &str = "active";
const STATUS_STANDBY: &str = "standby";
const STATUS_DISABLED: &str = "disabled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySection {
    pub entry_count: u64,
    pub expired_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub memory_usage: u64,
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSection {
    pub status: &'static str,
    pub connected: bool,
    pub key_count: u64,
    pub memory_usage: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    pub memory: MemorySection,
    pub remote: RemoteSection,
}

impl MemorySection {
    fn serving(stats: BackendStats) -> Self {
        Self {
            entry_count: stats.entry_count,
            expired_count: stats.expired_count,
            hit_count: stats.hit_count,
            miss_count: stats.miss_count,
            memory_usage: stats.approximate_memory_usage,
            status: STATUS_ACTIVE,
        }
    }

    fn standby() -> Self {
        Self {
            entry_count: 0,
            expired_count: 0,
            hit_count: 0,
            miss_count: 0,
            memory_usage: 0,
            status: STATUS_STANDBY,
        }
    }
}

impl RemoteSection {
    fn serving(stats: BackendStats) -> Self {
        Self {
            status: STATUS_ACTIVE,
            connected: true,
            key_count: stats.entry_count,
            memory_usage: stats.approximate_memory_usage,
            hit_count: stats.hit_count,
            miss_count: stats.miss_count,
            message: None,
        }
    }

    fn disabled(message: String) -> Self {
        Self {
            status: STATUS_DISABLED,
            connected: false,
            key_count: 0,
            memory_usage: 0,
            hit_count: 0,
            miss_count: 0,
            message: Some(message),
        }
    }
}

/// Builds [`CacheReport`]s from a cache handle.
#[derive(Clone)]
pub struct StatsReporter {
    cache: CacheHandle,
}

impl StatsReporter {
    pub fn new(cache: CacheHandle) -> Self {
        Self { cache }
    }

    pub async fn report(&self) -> Result<CacheReport, CacheError> {
        let active = self.cache.stats().await?;
        let report = match active.kind {
            BackendKind::Remote => CacheReport {
                memory: MemorySection::standby(),
                remote: RemoteSection::serving(active.stats),
            },
            BackendKind::Memory => {
                let message = match self.cache.remote_status() {
                    RemoteStatus::FellBack { reason } => {
                        format!("fell back to memory cache: {reason}")
                    }
                    RemoteStatus::Disabled | RemoteStatus::Active => {
                        "remote cache is not configured".to_string()
                    }
                };
                CacheReport {
                    memory: MemorySection::serving(active.stats),
                    remote: RemoteSection::disabled(message),
                }
            }
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::cache::{CacheBackend, CacheConfig, CacheEntry, CacheKey};

    struct FixedRemote;

    #[async_trait]
    impl CacheBackend for FixedRemote {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            Ok(None)
        }

        async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<CacheEntry, CacheError> {
            Ok(CacheEntry::new(key, value, ttl))
        }

        async fn stats(&self) -> Result<BackendStats, CacheError> {
            Ok(BackendStats {
                entry_count: 7,
                expired_count: 0,
                hit_count: 3,
                miss_count: 4,
                approximate_memory_usage: 2048,
            })
        }

        async fn clear(&self, _key: Option<&str>) -> Result<(), CacheError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "remote"
        }
    }

    #[tokio::test]
    async fn memory_report_marks_remote_disabled() {
        let cache = CacheHandle::memory(CacheConfig::default());
        cache.set(&CacheKey::content("a"), json!("x")).await;
        cache.get(&CacheKey::content("a")).await;

        let report = StatsReporter::new(cache).report().await.expect("report");
        assert_eq!(report.memory.status, "active");
        assert_eq!(report.memory.entry_count, 1);
        assert_eq!(report.memory.hit_count, 1);
        assert_eq!(report.remote.status, "disabled");
        assert!(!report.remote.connected);
        assert_eq!(report.remote.key_count, 0);
        assert!(report.remote.message.is_some());
    }

    #[tokio::test]
    async fn remote_report_puts_memory_on_standby() {
        let cache = CacheHandle::with_remote(CacheConfig::default(), Arc::new(FixedRemote));
        let report = StatsReporter::new(cache).report().await.expect("report");

        assert_eq!(report.remote.status, "active");
        assert!(report.remote.connected);
        assert_eq!(report.remote.key_count, 7);
        assert_eq!(report.remote.memory_usage, 2048);
        assert_eq!(report.memory.status, "standby");
        assert_eq!(report.memory.entry_count, 0);
    }

    #[tokio::test]
    async fn report_shape_is_the_same_for_every_backend() {
        let memory = StatsReporter::new(CacheHandle::memory(CacheConfig::default()))
            .report()
            .await
            .expect("memory report");
        let remote = StatsReporter::new(CacheHandle::with_remote(
            CacheConfig::default(),
            Arc::new(FixedRemote),
        ))
        .report()
        .await
        .expect("remote report");

        let keys = |value: Value, section: &str| -> Vec<String> {
            value[section]
                .as_object()
                .expect("section object")
                .keys()
                .cloned()
                .collect()
        };
        let memory = serde_json::to_value(memory).expect("serialize");
        let remote = serde_json::to_value(remote).expect("serialize");
        assert_eq!(keys(memory.clone(), "memory"), keys(remote.clone(), "memory"));
        assert_eq!(keys(memory, "remote"), keys(remote, "remote"));
    }
}
