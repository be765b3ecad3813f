use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::{debug, warn};

use crate::application::revalidate::{HookError, RegenerationHook};

use super::error::InfraError;

const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Asks an external renderer to rebuild a path with `POST {url}` and a
/// `{"path": ...}` body.
#[derive(Clone, Debug)]
pub struct WebhookRegenerationHook {
    client: Client,
    url: Url,
}

impl WebhookRegenerationHook {
    pub fn new(url: Url) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(HOOK_TIMEOUT)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RegenerationHook for WebhookRegenerationHook {
    async fn regenerate(&self, path: &str) -> Result<(), HookError> {
        let resp = self
            .client
            .post(self.url.clone())
            .json(&json!({ "path": path }))
            .send()
            .await
            .map_err(|err| HookError::new(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(HookError::new(format!("status {status} body {text}")));
        }
        debug!(path, "regeneration hook accepted path");
        Ok(())
    }
}

/// Used when no hook URL is configured: paths are accepted and only logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingRegenerationHook;

#[async_trait]
impl RegenerationHook for LoggingRegenerationHook {
    async fn regenerate(&self, path: &str) -> Result<(), HookError> {
        warn!(path, "no regeneration hook configured; nothing rebuilt");
        Ok(())
    }
}
