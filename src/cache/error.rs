use thiserror::Error;

/// Failures raised by a cache backend.
///
/// These never reach callers of [`super::CacheHandle`]; the handle degrades
/// them to misses or to a memory fallback.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{backend} cache backend unavailable: {message}")]
    Unavailable {
        backend: &'static str,
        message: String,
    },
    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{backend} cache command `{command}` failed: {message}")]
    Command {
        backend: &'static str,
        command: &'static str,
        message: String,
    },
}

impl CacheError {
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            message: message.into(),
        }
    }

    pub fn command(backend: &'static str, command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            backend,
            command,
            message: message.into(),
        }
    }

    /// Whether the error means the backend cannot be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
