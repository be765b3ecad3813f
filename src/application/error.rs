use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::error::Error as StdError;
use thiserror::Error;

use crate::{
    application::{fetch::FetchError, warmup::WarmupError},
    cache::CacheError,
    infra::error::InfraError,
};

/// Diagnostic chain attached to failed responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Warmup(#[from] WarmupError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn source_name(&self) -> &'static str {
        match self {
            AppError::Infra(_) => "infra",
            AppError::Cache(_) => "cache",
            AppError::Fetch(_) => "application::fetch",
            AppError::Warmup(_) => "application::warmup",
            AppError::Validation(_) => "application::validation",
            AppError::Unexpected(_) => "application",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Fetch(_) => StatusCode::BAD_GATEWAY,
            AppError::Warmup(WarmupError::AlreadyRunning) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Infra(_) | AppError::Cache(_) | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let report = ErrorReport::from_error(self.source_name(), status, &self);
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        let mut response = (status, body).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::content::SourceError;

    #[test]
    fn fetch_failures_map_to_bad_gateway() {
        let err = AppError::from(FetchError::Degraded {
            id: "abc".to_string(),
            first_attempt: "boom".to_string(),
            source: SourceError::request("boom again"),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn cache_failures_map_to_internal_error() {
        let err = AppError::from(CacheError::command("remote", "INFO", "wrong type"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.source, "cache");
        assert!(!report.messages.is_empty());
    }

    #[test]
    fn concurrent_warmup_maps_to_conflict() {
        assert_eq!(
            AppError::from(WarmupError::AlreadyRunning).status_code(),
            StatusCode::CONFLICT
        );
    }
}
