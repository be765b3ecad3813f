//! On-demand regeneration of statically rendered paths.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Whatever regenerates a rendered path.
#[async_trait]
pub trait RegenerationHook: Send + Sync {
    async fn regenerate(&self, path: &str) -> Result<(), HookError>;
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RevalidateError {
    #[error("invalid revalidation token")]
    Unauthorized,
    #[error("path is required")]
    MissingPath,
    #[error("regeneration failed: {0}")]
    Hook(#[from] HookError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revalidated {
    pub revalidated: bool,
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone)]
pub struct RevalidationService {
    secret_digest: Option<[u8; 32]>,
    hook: Arc<dyn RegenerationHook>,
}

impl RevalidationService {
    /// Without a configured secret every request is rejected.
    pub fn new(secret: Option<&str>, hook: Arc<dyn RegenerationHook>) -> Self {
        Self {
            secret_digest: secret.filter(|secret| !secret.is_empty()).map(digest),
            hook,
        }
    }

    pub async fn revalidate(
        &self,
        secret: Option<&str>,
        path: Option<&str>,
    ) -> Result<Revalidated, RevalidateError> {
        if !self.authorized(secret) {
            warn!(outcome = "unauthorized", "revalidation rejected");
            return Err(RevalidateError::Unauthorized);
        }

        let path = path
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .ok_or(RevalidateError::MissingPath)?;

        self.hook.regenerate(path).await?;
        info!(path, "path revalidated");

        Ok(Revalidated {
            revalidated: true,
            path: path.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    fn authorized(&self, supplied: Option<&str>) -> bool {
        match (&self.secret_digest, supplied) {
            (Some(expected), Some(supplied)) => {
                expected.as_slice().ct_eq(digest(supplied).as_slice()).unwrap_u8() == 1
            }
            _ => false,
        }
    }
}

fn digest(secret: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingHook {
        paths: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl RegenerationHook for RecordingHook {
        async fn regenerate(&self, path: &str) -> Result<(), HookError> {
            self.paths.lock().expect("paths lock").push(path.to_string());
            if self.fail {
                return Err(HookError::new("renderer offline"));
            }
            Ok(())
        }
    }

    fn service(secret: Option<&str>, hook: Arc<RecordingHook>) -> RevalidationService {
        RevalidationService::new(secret, hook)
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_without_side_effects() {
        let hook = Arc::new(RecordingHook::default());
        let revalidation = service(Some("s3cret"), hook.clone());

        let err = revalidation
            .revalidate(Some("guess"), Some("/about"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, RevalidateError::Unauthorized));

        let err = revalidation
            .revalidate(None, Some("/about"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, RevalidateError::Unauthorized));
        assert!(hook.paths.lock().expect("paths lock").is_empty());
    }

    #[tokio::test]
    async fn unconfigured_secret_rejects_everything() {
        let hook = Arc::new(RecordingHook::default());
        let err = service(None, hook.clone())
            .revalidate(Some(""), Some("/about"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, RevalidateError::Unauthorized));
    }

    #[tokio::test]
    async fn missing_path_is_rejected_after_auth() {
        let hook = Arc::new(RecordingHook::default());
        let revalidation = service(Some("s3cret"), hook.clone());

        for path in [None, Some(""), Some("   ")] {
            let err = revalidation
                .revalidate(Some("s3cret"), path)
                .await
                .expect_err("rejected");
            assert!(matches!(err, RevalidateError::MissingPath));
        }
    }

    #[tokio::test]
    async fn valid_request_invokes_hook() {
        let hook = Arc::new(RecordingHook::default());
        let result = service(Some("s3cret"), hook.clone())
            .revalidate(Some("s3cret"), Some("/blog/post"))
            .await
            .expect("revalidated");

        assert!(result.revalidated);
        assert_eq!(result.path, "/blog/post");
        assert_eq!(*hook.paths.lock().expect("paths lock"), vec!["/blog/post".to_string()]);
    }

    #[tokio::test]
    async fn hook_failure_is_reported() {
        let hook = Arc::new(RecordingHook {
            fail: true,
            ..Default::default()
        });
        let err = service(Some("s3cret"), hook)
            .revalidate(Some("s3cret"), Some("/x"))
            .await
            .expect_err("hook failed");
        assert_eq!(err.to_string(), "regeneration failed: renderer offline");
    }
}
