//! The upstream content source and the options passed to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque page payload produced by the source.
pub type Content = Value;

const DEFAULT_CONCURRENCY: u32 = 3;
const DEFAULT_CHUNK_LIMIT: u32 = 100;
const DEFAULT_CHUNK_NUMBER: u32 = 0;

/// Fully resolved fetch options. Every field is concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchOptions {
    /// Also load auxiliary collection data. Expensive and the usual cause of
    /// upstream failures.
    pub fetch_auxiliary: bool,
    pub concurrency: u32,
    pub chunk_limit: u32,
    pub chunk_number: u32,
    pub fetch_missing_blocks: bool,
    pub sign_file_urls: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            fetch_auxiliary: true,
            concurrency: DEFAULT_CONCURRENCY,
            chunk_limit: DEFAULT_CHUNK_LIMIT,
            chunk_number: DEFAULT_CHUNK_NUMBER,
            fetch_missing_blocks: true,
            sign_file_urls: true,
        }
    }
}

impl FetchOptions {
    /// Options used for page-metadata lookups: a single chunk, no auxiliary
    /// data.
    pub fn page_info() -> Self {
        Self {
            fetch_auxiliary: false,
            chunk_limit: 1,
            ..Self::default()
        }
    }

    /// The same options with auxiliary data turned off.
    pub fn without_auxiliary(self) -> Self {
        Self {
            fetch_auxiliary: false,
            ..self
        }
    }
}

/// Caller-facing request; unset fields take the defaults of [`FetchOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchRequest {
    pub fetch_auxiliary: Option<bool>,
    pub concurrency: Option<u32>,
    pub chunk_limit: Option<u32>,
    pub chunk_number: Option<u32>,
    pub fetch_missing_blocks: Option<bool>,
    pub sign_file_urls: Option<bool>,
}

impl FetchRequest {
    pub fn resolve(self) -> FetchOptions {
        let defaults = FetchOptions::default();
        FetchOptions {
            fetch_auxiliary: self.fetch_auxiliary.unwrap_or(defaults.fetch_auxiliary),
            concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            chunk_limit: self.chunk_limit.unwrap_or(defaults.chunk_limit),
            chunk_number: self.chunk_number.unwrap_or(defaults.chunk_number),
            fetch_missing_blocks: self
                .fetch_missing_blocks
                .unwrap_or(defaults.fetch_missing_blocks),
            sign_file_urls: self.sign_file_urls.unwrap_or(defaults.sign_file_urls),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("content request failed: {message}")]
    Request { message: String },
    #[error("content source answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("content source returned an unreadable payload: {message}")]
    Decode { message: String },
    #[error("content source is not configured")]
    NotConfigured,
}

impl SourceError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// The slow, rate-limited upstream.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_page(&self, id: &str, options: &FetchOptions) -> Result<Content, SourceError>;
}
