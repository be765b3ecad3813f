//! Infrastructure adapters and runtime bootstrap.

pub mod content_client;
pub mod error;
pub mod http;
pub mod regenerate;
pub mod telemetry;
