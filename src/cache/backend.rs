//! The cache backend contract shared by the in-process and remote stores.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::CacheError;
use super::fingerprint::fingerprint_value;

/// A cached value with its validity window and fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub fingerprint: String,
}

impl CacheEntry {
    /// Stamp a new entry valid for `ttl` starting now.
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
        Self::created_at(key, value, ttl, OffsetDateTime::now_utc())
    }

    pub(crate) fn created_at(
        key: impl Into<String>,
        value: Value,
        ttl: Duration,
        created_at: OffsetDateTime,
    ) -> Self {
        let ttl = time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX);
        let fingerprint = fingerprint_value(&value);
        Self {
            key: key.into(),
            value,
            created_at,
            expires_at: created_at.saturating_add(ttl),
            fingerprint,
        }
    }

    /// Entries are valid strictly before `expires_at`.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        !self.is_valid_at(OffsetDateTime::now_utc())
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        let remaining = self.expires_at - OffsetDateTime::now_utc();
        Duration::try_from(remaining).unwrap_or(Duration::ZERO)
    }
}

/// Counters reported by every backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    /// Entries that are still valid.
    pub entry_count: u64,
    /// Entries physically present but past their expiry.
    pub expired_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Approximate bytes held by keys and serialized values.
    pub approximate_memory_usage: u64,
}

/// Storage contract for cached content. Every method may be called
/// concurrently.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Return the entry if present and not expired, refreshing its recency.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or wholesale-replace an entry valid for `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<CacheEntry, CacheError>;

    async fn stats(&self) -> Result<BackendStats, CacheError>;

    /// Remove one entry, or every entry when `key` is `None`.
    async fn clear(&self, key: Option<&str>) -> Result<(), CacheError>;

    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;
}
