//! Redis-backed cache backend.
//!
//! Selecting this backend only parses the connection URL. The connection is
//! opened on first use, so an unreachable server surfaces as
//! [`CacheError::Unavailable`] from the first real operation. Connecting and
//! every command share one deadline; a server that stops answering is
//! treated the same as one that refuses connections.
//!
//! Only keys under [`KEY_PREFIX`] belong to this backend. Counting and
//! clearing walk them with `SCAN`, leaving other keys in a shared database
//! alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, AsyncConnectionConfig};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{BackendStats, CacheBackend, CacheEntry};
use super::error::CacheError;
use super::memory::{METRIC_CACHE_HIT, METRIC_CACHE_MISS};

const BACKEND: &str = "remote";
const KEY_PREFIX: &str = "kura:";
const KEY_PATTERN: &str = "kura:*";
const SCAN_COUNT: usize = 100;

pub struct RemoteCacheBackend {
    client: redis::Client,
    timeout: Duration,
    connection: OnceCell<MultiplexedConnection>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RemoteCacheBackend {
    /// Prepare a client for `url` without connecting. `timeout` bounds the
    /// connect and each command.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|err| CacheError::unavailable(BACKEND, format!("invalid url: {err}")))?;
        Ok(Self {
            client,
            timeout,
            connection: OnceCell::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        self.connection
            .get_or_try_init(|| async {
                let config = AsyncConnectionConfig::new()
                    .set_connection_timeout(self.timeout)
                    .set_response_timeout(self.timeout);
                let connection = self
                    .client
                    .get_multiplexed_async_connection_with_config(&config)
                    .await
                    .map_err(|err| CacheError::unavailable(BACKEND, err.to_string()))?;
                info!(
                    backend = BACKEND,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "remote cache connected"
                );
                Ok(connection)
            })
            .await
            .cloned()
    }

    fn full_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

/// Every key owned by this backend, gathered with a `SCAN` cursor walk.
async fn scan_owned_keys(
    connection: &mut MultiplexedConnection,
) -> Result<Vec<String>, CacheError> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(KEY_PATTERN)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(connection)
            .await
            .map_err(|err| map_redis_error("SCAN", err))?;
        keys.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    // SCAN may return a key more than once.
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}

fn map_redis_error(command: &'static str, err: redis::RedisError) -> CacheError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        CacheError::unavailable(BACKEND, err.to_string())
    } else {
        CacheError::command(BACKEND, command, err.to_string())
    }
}

/// Redis expiry in whole seconds, rounded up so entries never vanish early.
fn expiry_seconds(ttl: Duration) -> u64 {
    let rounded = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    rounded.max(1)
}

/// Extract `used_memory` from the output of `INFO memory`.
fn parse_used_memory(info: &str) -> u64 {
    info.lines()
        .find_map(|line| line.strip_prefix("used_memory:"))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl CacheBackend for RemoteCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut connection = self.connection().await?;
        let raw: Option<String> = connection
            .get(Self::full_key(key))
            .await
            .map_err(|err| map_redis_error("GET", err))?;

        let entry = match raw {
            Some(raw) => Some(serde_json::from_str::<CacheEntry>(&raw)?),
            None => None,
        };

        match entry {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT, "backend" => BACKEND).increment(1);
                Ok(Some(entry))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_MISS, "backend" => BACKEND).increment(1);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry::new(key, value, ttl);
        let payload = serde_json::to_string(&entry)?;
        let mut connection = self.connection().await?;
        connection
            .set_ex::<_, _, ()>(Self::full_key(key), payload, expiry_seconds(ttl))
            .await
            .map_err(|err| map_redis_error("SETEX", err))?;
        Ok(entry)
    }

    async fn stats(&self) -> Result<BackendStats, CacheError> {
        let mut connection = self.connection().await?;
        let key_count = scan_owned_keys(&mut connection).await?.len() as u64;
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut connection)
            .await
            .map_err(|err| map_redis_error("INFO", err))?;

        Ok(BackendStats {
            entry_count: key_count,
            expired_count: 0,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            approximate_memory_usage: parse_used_memory(&info),
        })
    }

    async fn clear(&self, key: Option<&str>) -> Result<(), CacheError> {
        let mut connection = self.connection().await?;
        match key {
            Some(key) => connection
                .del::<_, ()>(Self::full_key(key))
                .await
                .map_err(|err| map_redis_error("DEL", err)),
            None => {
                let keys = scan_owned_keys(&mut connection).await?;
                debug!(count = keys.len(), "clearing remote cache keys");
                for chunk in keys.chunks(SCAN_COUNT) {
                    connection
                        .del::<_, ()>(chunk)
                        .await
                        .map_err(|err| map_redis_error("DEL", err))?;
                }
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}
