//! Backend selection and the process-wide cache handle.
//!
//! The backend is chosen once from configuration. If the remote backend turns
//! out to be unreachable, the handle swaps in a fresh memory backend exactly
//! once and keeps serving from it for the rest of the process.

use std::future::Future;
use std::sync::{Arc, RwLock};

use metrics::counter;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{BackendStats, CacheBackend, CacheEntry};
use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};
use super::memory::MemoryCacheBackend;
use super::remote::RemoteCacheBackend;

const SOURCE: &str = "cache::selector";

pub(crate) const METRIC_BACKEND_FALLBACK: &str = "kura_cache_backend_fallback_total";

/// Which backend configuration asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    Memory,
    Remote { url: String },
}

impl BackendChoice {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendChoice::Memory => BackendKind::Memory,
            BackendChoice::Remote { .. } => BackendKind::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Remote,
}

/// Pure selection: the remote backend is used only when explicitly enabled.
pub fn select_backend(config: &CacheConfig) -> BackendChoice {
    if config.use_remote_backend {
        BackendChoice::Remote {
            url: config.remote_url.clone(),
        }
    } else {
        BackendChoice::Memory
    }
}

/// Lifecycle of the remote backend as seen by the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Remote caching was not requested.
    Disabled,
    /// The remote backend is serving requests.
    Active,
    /// The remote backend failed and memory took over.
    FellBack { reason: String },
}

/// Stats of whichever backend answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveStats {
    pub kind: BackendKind,
    pub stats: BackendStats,
}

#[derive(Clone)]
enum Slot {
    Memory(Arc<MemoryCacheBackend>),
    Remote(Arc<dyn CacheBackend>),
}

impl Slot {
    fn backend(&self) -> Arc<dyn CacheBackend> {
        match self {
            Slot::Memory(memory) => memory.clone(),
            Slot::Remote(remote) => remote.clone(),
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            Slot::Memory(_) => BackendKind::Memory,
            Slot::Remote(_) => BackendKind::Remote,
        }
    }
}

struct Active {
    slot: Slot,
    remote: RemoteStatus,
}

struct Inner {
    config: CacheConfig,
    active: RwLock<Active>,
}

/// Shared entry point to the cache.
///
/// Every operation except [`CacheHandle::stats`] absorbs backend errors: a
/// failed read is a miss and a failed write leaves the value uncached.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<Inner>,
}

impl CacheHandle {
    /// Instantiate the backend chosen by [`select_backend`].
    pub fn from_config(config: CacheConfig) -> Self {
        let timeout = config.remote_timeout;
        match select_backend(&config) {
            BackendChoice::Memory => Self::memory(config),
            BackendChoice::Remote { url } => match RemoteCacheBackend::new(&url, timeout) {
                Ok(remote) => {
                    info!(backend = "remote", "remote cache selected, connecting lazily");
                    Self::with_remote(config, Arc::new(remote))
                }
                Err(err) => {
                    log_fallback(&err);
                    let memory = Arc::new(MemoryCacheBackend::new(&config));
                    Self::build(
                        config,
                        Slot::Memory(memory),
                        RemoteStatus::FellBack {
                            reason: err.to_string(),
                        },
                    )
                }
            },
        }
    }

    /// A handle backed by a fresh memory backend.
    pub fn memory(config: CacheConfig) -> Self {
        let memory = Arc::new(MemoryCacheBackend::new(&config));
        Self::build(config, Slot::Memory(memory), RemoteStatus::Disabled)
    }

    /// A handle serving from the given remote backend, falling back to memory
    /// when it reports itself unavailable.
    pub fn with_remote(config: CacheConfig, remote: Arc<dyn CacheBackend>) -> Self {
        Self::build(config, Slot::Remote(remote), RemoteStatus::Active)
    }

    fn build(config: CacheConfig, slot: Slot, remote: RemoteStatus) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                active: RwLock::new(Active { slot, remote }),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn kind(&self) -> BackendKind {
        rw_read(&self.inner.active, SOURCE, "kind").slot.kind()
    }

    pub fn remote_status(&self) -> RemoteStatus {
        rw_read(&self.inner.active, SOURCE, "remote_status")
            .remote
            .clone()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let key = key.to_string();
        let key = key.as_str();
        match self.run(|backend| async move { backend.get(key).await }).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, outcome = "miss", "cache read failed");
                None
            }
        }
    }

    /// Store `value` under `key` with the TTL of its class. The returned entry
    /// is valid even when the backend refused to store it.
    pub async fn set(&self, key: &CacheKey, value: Value) -> CacheEntry {
        let ttl = self.inner.config.ttl_for(key.class());
        let key = key.to_string();
        let key = key.as_str();
        let result = self
            .run(|backend| {
                let value = value.clone();
                async move { backend.set(key, value, ttl).await }
            })
            .await;
        match result {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, outcome = "not_stored", "cache write failed");
                CacheEntry::new(key, value, ttl)
            }
        }
    }

    pub async fn clear(&self, key: Option<&CacheKey>) {
        let key = key.map(CacheKey::to_string);
        let key = key.as_deref();
        if let Err(err) = self.run(|backend| async move { backend.clear(key).await }).await {
            warn!(key, error = %err, "cache clear failed");
        }
    }

    /// Stats of the serving backend, after any fallback it triggered.
    pub async fn stats(&self) -> Result<ActiveStats, CacheError> {
        loop {
            let slot = self.slot();
            let kind = slot.kind();
            match slot.backend().stats().await {
                Ok(stats) => return Ok(ActiveStats { kind, stats }),
                Err(err) if kind == BackendKind::Remote && err.is_unavailable() => {
                    self.fall_back(&err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop expired entries from the memory backend. A no-op while the remote
    /// backend serves, since it expires entries itself.
    pub fn purge_expired(&self) -> usize {
        match self.slot() {
            Slot::Memory(memory) => memory.purge_expired(),
            Slot::Remote(_) => 0,
        }
    }

    /// Periodically purge expired entries until `shutdown` fires. Returns
    /// `None` when the sweep interval is disabled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.inner.config.sweep_interval?;
        let handle = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = handle.purge_expired();
                        if purged > 0 {
                            debug!(purged, "expired cache entries swept");
                        }
                    }
                }
            }
        }))
    }

    fn slot(&self) -> Slot {
        rw_read(&self.inner.active, SOURCE, "slot").slot.clone()
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: Fn(Arc<dyn CacheBackend>) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let slot = self.slot();
        match op(slot.backend()).await {
            Err(err) if slot.kind() == BackendKind::Remote && err.is_unavailable() => {
                let memory = self.fall_back(&err);
                op(memory).await
            }
            other => other,
        }
    }

    /// Swap the remote backend for memory. Later callers observe the swap and
    /// reuse the same memory backend.
    fn fall_back(&self, err: &CacheError) -> Arc<dyn CacheBackend> {
        let mut active = rw_write(&self.inner.active, SOURCE, "fall_back");
        if let Slot::Remote(_) = active.slot {
            active.slot = Slot::Memory(Arc::new(MemoryCacheBackend::new(&self.inner.config)));
            active.remote = RemoteStatus::FellBack {
                reason: err.to_string(),
            };
            let memory = active.slot.backend();
            drop(active);
            log_fallback(err);
            return memory;
        }
        active.slot.backend()
    }
}

fn log_fallback(err: &CacheError) {
    warn!(
        from = "remote",
        to = "memory",
        error = %err,
        "remote cache unavailable, falling back to memory"
    );
    counter!(METRIC_BACKEND_FALLBACK).increment(1);
}

static GLOBAL: OnceCell<CacheHandle> = OnceCell::new();

/// The process-wide handle. `config` is only read by the first caller.
pub fn global(config: &CacheConfig) -> &'static CacheHandle {
    GLOBAL.get_or_init(|| CacheHandle::from_config(config.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Remote double that is always unreachable and counts calls.
    #[derive(Default)]
    struct DownRemote {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for DownRemote {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::unavailable("remote", "connection refused"))
        }

        async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<CacheEntry, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::unavailable("remote", "connection refused"))
        }

        async fn stats(&self) -> Result<BackendStats, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::unavailable("remote", "connection refused"))
        }

        async fn clear(&self, _key: Option<&str>) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::unavailable("remote", "connection refused"))
        }

        fn name(&self) -> &'static str {
            "remote"
        }
    }

    #[test]
    fn selection_follows_configuration() {
        assert_eq!(select_backend(&CacheConfig::default()), BackendChoice::Memory);

        let config = CacheConfig {
            use_remote_backend: true,
            remote_url: "redis://cache:6379".to_string(),
            ..Default::default()
        };
        assert_eq!(
            select_backend(&config),
            BackendChoice::Remote {
                url: "redis://cache:6379".to_string()
            }
        );
        assert_eq!(select_backend(&config).kind(), BackendKind::Remote);
    }

    #[tokio::test]
    async fn memory_by_default() {
        let handle = CacheHandle::from_config(CacheConfig::default());
        assert_eq!(handle.kind(), BackendKind::Memory);
        assert_eq!(handle.remote_status(), RemoteStatus::Disabled);

        let key = CacheKey::content("abc");
        let stored = handle.set(&key, json!({"title": "t"})).await;
        let cached = handle.get(&key).await.expect("cached");
        assert_eq!(cached.fingerprint, stored.fingerprint);
    }

    #[tokio::test]
    async fn unavailable_remote_falls_back_once() {
        let remote = Arc::new(DownRemote::default());
        let handle = CacheHandle::with_remote(CacheConfig::default(), remote.clone());
        let key = CacheKey::content("abc");

        handle.set(&key, json!(1)).await;
        assert_eq!(handle.kind(), BackendKind::Memory);
        assert!(matches!(handle.remote_status(), RemoteStatus::FellBack { .. }));

        // The write was retried on memory and later calls never touch remote.
        assert_eq!(handle.get(&key).await.expect("served from memory").value, json!(1));
        handle.clear(None).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_after_fallback_come_from_memory() {
        let handle = CacheHandle::with_remote(CacheConfig::default(), Arc::new(DownRemote::default()));
        let stats = handle.stats().await.expect("memory stats");
        assert_eq!(stats.kind, BackendKind::Memory);
        assert_eq!(stats.stats, BackendStats::default());
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_on_first_use() {
        let config = CacheConfig {
            use_remote_backend: true,
            remote_url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let handle = CacheHandle::from_config(config);
        assert_eq!(handle.kind(), BackendKind::Remote);

        assert!(handle.get(&CacheKey::content("abc")).await.is_none());
        assert_eq!(handle.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn sweeper_is_disabled_without_interval() {
        let handle = CacheHandle::memory(CacheConfig {
            sweep_interval: None,
            ..Default::default()
        });
        assert!(handle.spawn_sweeper(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn sweeper_purges_until_cancelled() {
        let handle = CacheHandle::memory(CacheConfig {
            default_ttl: Duration::from_millis(10),
            sweep_interval: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        handle.set(&CacheKey::content("abc"), json!(1)).await;

        let shutdown = CancellationToken::new();
        let task = handle.spawn_sweeper(shutdown.clone()).expect("sweeper spawned");
        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = handle.stats().await.expect("stats");
        assert_eq!(stats.stats.entry_count + stats.stats.expired_count, 0);

        shutdown.cancel();
        task.await.expect("sweeper stopped");
    }
}
