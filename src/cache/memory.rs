//! In-process LRU + TTL cache backend.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::backend::{BackendStats, CacheBackend, CacheEntry};
use super::config::CacheConfig;
use super::error::CacheError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::memory";
const BACKEND: &str = "memory";

pub(crate) const METRIC_CACHE_HIT: &str = "kura_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "kura_cache_miss_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "kura_cache_evict_total";

struct Stored {
    entry: CacheEntry,
    size: usize,
}

struct State {
    entries: LruCache<String, Stored>,
    bytes: usize,
}

impl State {
    fn remove(&mut self, key: &str) -> Option<Stored> {
        let removed = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(removed.size);
        Some(removed)
    }
}

/// Bounded in-memory store.
///
/// Recency is refreshed on every `get` and `set`; inserting past
/// `max_entries` evicts the least recently used entry first. Expired entries
/// are dropped when read, or in bulk by [`MemoryCacheBackend::purge_expired`].
pub struct MemoryCacheBackend {
    state: RwLock<State>,
    max_entry_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCacheBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: RwLock::new(State {
                entries: LruCache::new(config.max_entries_non_zero()),
                bytes: 0,
            }),
            max_entry_bytes: config.max_entry_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut state = rw_write(&self.state, SOURCE, "purge_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, stored)| !stored.entry.is_valid_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Number of entries physically held, expired or not.
    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_MISS, "backend" => BACKEND).increment(1);
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut state = rw_write(&self.state, SOURCE, "get");
        let found = state.entries.get(key).map(|stored| stored.entry.clone());

        match found {
            Some(entry) if !entry.is_expired() => {
                drop(state);
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT, "backend" => BACKEND).increment(1);
                Ok(Some(entry))
            }
            Some(_) => {
                state.remove(key);
                drop(state);
                debug!(key, outcome = "expired", "dropping expired entry");
                self.record_miss();
                Ok(None)
            }
            None => {
                drop(state);
                self.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<CacheEntry, CacheError> {
        let size = key.len() + serde_json::to_vec(&value)?.len();
        let entry = CacheEntry::new(key, value, ttl);

        if size > self.max_entry_bytes {
            warn!(
                key,
                size,
                limit = self.max_entry_bytes,
                "payload too large for memory cache, not stored"
            );
            // A stale copy must not outlive the refused replacement.
            rw_write(&self.state, SOURCE, "set.oversize").remove(key);
            return Ok(entry);
        }

        let mut state = rw_write(&self.state, SOURCE, "set");
        let displaced = state.entries.push(
            key.to_string(),
            Stored {
                entry: entry.clone(),
                size,
            },
        );
        state.bytes += size;

        if let Some((displaced_key, displaced)) = displaced {
            state.bytes = state.bytes.saturating_sub(displaced.size);
            if displaced_key != key {
                drop(state);
                debug!(key = %displaced_key, "evicted least recently used entry");
                counter!(METRIC_CACHE_EVICT, "backend" => BACKEND).increment(1);
            }
        }

        Ok(entry)
    }

    async fn stats(&self) -> Result<BackendStats, CacheError> {
        let now = OffsetDateTime::now_utc();
        let state = rw_read(&self.state, SOURCE, "stats");
        let live = state
            .entries
            .iter()
            .filter(|(_, stored)| stored.entry.is_valid_at(now))
            .count() as u64;
        let physical = state.entries.len() as u64;

        Ok(BackendStats {
            entry_count: live,
            expired_count: physical - live,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            approximate_memory_usage: state.bytes as u64,
        })
    }

    async fn clear(&self, key: Option<&str>) -> Result<(), CacheError> {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        match key {
            Some(key) => {
                state.remove(key);
            }
            None => {
                let dropped = state.entries.len();
                state.entries.clear();
                state.bytes = 0;
                drop(state);
                self.hits.store(0, Ordering::Relaxed);
                self.misses.store(0, Ordering::Relaxed);
                debug!(dropped, "memory cache cleared");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}
