//! Cache configuration.
//!
//! Resolved once at startup from the environment (see `crate::config`) and
//! never mutated afterwards.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::keys::KeyClass;

pub(crate) const DEFAULT_REMOTE_URL: &str = "redis://127.0.0.1:6379";
pub(crate) const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 2_000;
pub(crate) const DEFAULT_TTL_SECS: u64 = 3600;
pub(crate) const DEFAULT_PAGE_INFO_TTL_SECS: u64 = 7200;
pub(crate) const DEFAULT_MAX_ENTRIES: usize = 500;
pub(crate) const DEFAULT_MAX_ENTRY_BYTES: usize = 1024 * 1024;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_WARMUP_BATCH_SIZE: usize = 5;
pub(crate) const DEFAULT_WARMUP_BATCH_DELAY_MS: u64 = 10_000;
pub(crate) const DEFAULT_WARMUP_TIMEOUT_MS: u64 = 30_000;

/// Process-wide cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Use the Redis backend instead of the in-process one.
    pub use_remote_backend: bool,
    /// Connection URL for the remote backend.
    pub remote_url: String,
    /// Connect and per-command deadline for the remote backend. Exceeding it
    /// counts as the backend being unavailable.
    pub remote_timeout: Duration,
    /// TTL for general content entries.
    pub default_ttl: Duration,
    /// TTL for page-metadata entries.
    pub page_info_ttl: Duration,
    /// Capacity of the in-process LRU.
    pub max_entries: usize,
    /// Serialized payloads above this size are not stored.
    pub max_entry_bytes: usize,
    /// Interval of the background expiry sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
    /// Identifiers fetched concurrently per warmup batch.
    pub warmup_batch_size: usize,
    /// Pause between warmup batches.
    pub warmup_batch_delay: Duration,
    /// Per-item warmup deadline.
    pub warmup_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_remote_backend: false,
            remote_url: DEFAULT_REMOTE_URL.to_string(),
            remote_timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            page_info_ttl: Duration::from_secs(DEFAULT_PAGE_INFO_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            sweep_interval: Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
            warmup_batch_size: DEFAULT_WARMUP_BATCH_SIZE,
            warmup_batch_delay: Duration::from_millis(DEFAULT_WARMUP_BATCH_DELAY_MS),
            warmup_timeout: Duration::from_millis(DEFAULT_WARMUP_TIMEOUT_MS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            use_remote_backend: settings.use_remote_backend,
            remote_url: settings.remote_url.clone(),
            remote_timeout: settings.remote_timeout,
            default_ttl: settings.default_ttl,
            page_info_ttl: settings.page_info_ttl,
            max_entries: settings.max_entries,
            max_entry_bytes: settings.max_entry_bytes,
            sweep_interval: settings.sweep_interval,
            warmup_batch_size: settings.warmup_batch_size,
            warmup_batch_delay: settings.warmup_batch_delay,
            warmup_timeout: settings.warmup_timeout,
        }
    }
}

impl CacheConfig {
    /// TTL applied to entries of the given class.
    pub fn ttl_for(&self, class: KeyClass) -> Duration {
        match class {
            KeyClass::Content => self.default_ttl,
            KeyClass::PageInfo => self.page_info_ttl,
        }
    }

    /// Returns the LRU capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the warmup batch size as NonZeroUsize, clamping to 1 if zero.
    pub fn warmup_batch_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.warmup_batch_size).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(!config.use_remote_backend);
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.page_info_ttl, Duration::from_secs(7200));
        assert_eq!(config.max_entries, 500);
        assert_eq!(config.warmup_batch_size, 5);
        assert_eq!(config.warmup_batch_delay, Duration::from_millis(10_000));
        assert_eq!(config.warmup_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn ttl_depends_on_key_class() {
        let config = CacheConfig {
            default_ttl: Duration::from_secs(10),
            page_info_ttl: Duration::from_secs(20),
            ..Default::default()
        };
        assert_eq!(config.ttl_for(KeyClass::Content), Duration::from_secs(10));
        assert_eq!(config.ttl_for(KeyClass::PageInfo), Duration::from_secs(20));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            warmup_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
        assert_eq!(config.warmup_batch_size_non_zero().get(), 1);
    }
}
