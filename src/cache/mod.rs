//! Kura cache layer
//!
//! Fronts a slow content source with one of two interchangeable backends:
//!
//! - **Memory**: bounded LRU with per-entry TTL, held in process
//! - **Remote**: Redis, shared between processes
//!
//! The backend is selected once from [`CacheConfig`]. Callers talk to a
//! [`CacheHandle`], which hides backend failures and falls back to memory if
//! the remote store cannot be reached.
//!
//! ## Configuration
//!
//! In `kura.toml` (environment variables such as `CACHE_TTL_DEFAULT` take
//! precedence):
//!
//! ```toml
//! [cache]
//! use_remote = "false"
//! redis_timeout_ms = "2000"
//! ttl_default_secs = "3600"
//! ttl_page_info_secs = "7200"
//! max_entries = "500"
//! ```

mod backend;
mod config;
mod error;
mod fingerprint;
mod keys;
mod lock;
mod memory;
mod remote;
mod selector;
mod stats;

pub use backend::{BackendStats, CacheBackend, CacheEntry};
pub use config::CacheConfig;
pub(crate) use config::{
    DEFAULT_MAX_ENTRIES, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_PAGE_INFO_TTL_SECS,
    DEFAULT_REMOTE_TIMEOUT_MS, DEFAULT_REMOTE_URL, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS,
    DEFAULT_WARMUP_BATCH_DELAY_MS, DEFAULT_WARMUP_BATCH_SIZE, DEFAULT_WARMUP_TIMEOUT_MS,
};
pub use error::CacheError;
pub use fingerprint::{fingerprint, fingerprint_value, if_none_match};
pub use keys::{CacheKey, KeyClass, normalize_content_id};
pub(crate) use lock::{rw_read, rw_write};
pub use memory::MemoryCacheBackend;
pub(crate) use memory::{METRIC_CACHE_EVICT, METRIC_CACHE_HIT, METRIC_CACHE_MISS};
pub use remote::RemoteCacheBackend;
pub(crate) use selector::METRIC_BACKEND_FALLBACK;
pub use selector::{
    ActiveStats, BackendChoice, BackendKind, CacheHandle, RemoteStatus, global, select_backend,
};
pub use stats::{CacheReport, MemorySection, RemoteSection, StatsReporter};
