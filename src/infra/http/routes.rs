use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    application::{
        content::FetchRequest,
        error::{AppError, ErrorReport},
        page::{CachedPage, PageService},
        revalidate::{RevalidateError, RevalidationService},
        warmup::{WarmupPlan, WarmupScheduler},
    },
    cache::{CacheKey, StatsReporter, if_none_match},
};

use super::middleware::{log_responses, set_request_context};

pub const X_CACHE: &str = "x-cache";

#[derive(Clone)]
pub struct HttpState {
    pub pages: PageService,
    pub stats: StatsReporter,
    pub warmup: WarmupScheduler,
    pub revalidation: RevalidationService,
    pub warmup_plan: WarmupPlan,
    /// Ids warmed when a trigger names none.
    pub warmup_ids: Arc<Vec<String>>,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(clear_cache))
        .route(
            "/api/cache/warmup",
            get(warmup_status)
                .post(trigger_warmup)
                .delete(cancel_warmup),
        )
        .route("/api/revalidate", get(revalidate))
        .route("/api/pages/{id}", get(page))
        .route("/api/pages/{id}/info", get(page_info))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn cache_stats(State(state): State<HttpState>) -> Result<Response, AppError> {
    let report = state.stats.report().await?;
    Ok(Json(json!({
        "success": true,
        "memory": report.memory,
        "remote": report.remote,
    }))
    .into_response())
}

async fn warmup_status(State(state): State<HttpState>) -> Response {
    Json(state.warmup.status()).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WarmupQuery {
    /// Comma-separated page ids.
    ids: Option<String>,
}

async fn trigger_warmup(
    State(state): State<HttpState>,
    Query(query): Query<WarmupQuery>,
) -> Result<Response, AppError> {
    let ids: Vec<String> = match query.ids.as_deref() {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        None => state.warmup_ids.as_ref().clone(),
    };
    if ids.is_empty() {
        return Err(AppError::validation("no page ids to warm"));
    }

    let run = state
        .warmup
        .try_begin(&ids, state.warmup_plan, state.shutdown.child_token())?;
    let run_id = run.run_id();
    let total = run.ids().len();
    tokio::spawn(run.run());
    info!(%run_id, total, "warmup triggered");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "runId": run_id, "requested": total })),
    )
        .into_response())
}

async fn cancel_warmup(State(state): State<HttpState>) -> Response {
    let cancelled = state.warmup.cancel();
    let message = if cancelled {
        info!("warmup cancellation requested");
        "Warmup cancellation requested"
    } else {
        "No warmup is running"
    };
    Json(json!({ "success": true, "cancelled": cancelled, "message": message })).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClearQuery {
    /// A page id, or a full `page:<id>` / `page-info:<id>` key.
    key: Option<String>,
    id: Option<String>,
}

async fn clear_cache(
    State(state): State<HttpState>,
    Query(query): Query<ClearQuery>,
) -> Result<Response, AppError> {
    let target = query
        .key
        .or(query.id)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty());
    let cache = state.pages.cache();

    let message = match target.as_deref() {
        Some(raw) => {
            let keys = match CacheKey::parse(raw) {
                Some(key) => vec![key],
                None => vec![CacheKey::content(raw), CacheKey::page_info(raw)],
            };
            for key in &keys {
                cache.clear(Some(key)).await;
            }
            info!(key = raw, cleared = keys.len(), "cache entries cleared");
            format!("Cache cleared for {raw}")
        }
        None => {
            cache.clear(None).await;
            info!("cache cleared");
            "Cache cleared successfully".to_string()
        }
    };

    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| AppError::unexpected(format!("failed to format timestamp: {err}")))?;
    Ok(Json(json!({ "success": true, "message": message, "timestamp": timestamp })).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RevalidateQuery {
    secret: Option<String>,
    path: Option<String>,
}

async fn revalidate(
    State(state): State<HttpState>,
    Query(query): Query<RevalidateQuery>,
) -> Response {
    match state
        .revalidation
        .revalidate(query.secret.as_deref(), query.path.as_deref())
        .await
    {
        Ok(done) => Json(done).into_response(),
        Err(RevalidateError::Unauthorized) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Invalid token" })),
        )
            .into_response(),
        Err(RevalidateError::MissingPath) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Path is required" })),
        )
            .into_response(),
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            let report = ErrorReport::from_error("application::revalidate", status, &err);
            let mut response = (
                status,
                Json(json!({ "message": "Error revalidating", "error": err.to_string() })),
            )
                .into_response();
            report.attach(&mut response);
            response
        }
    }
}

async fn page(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Query(request): Query<FetchRequest>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let page = state.pages.page(&id, request).await?;
    Ok(page_response(&state, page, &headers))
}

async fn page_info(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let page = state.pages.page_info(&id).await?;
    Ok(page_response(&state, page, &headers))
}

fn page_response(state: &HttpState, page: CachedPage, headers: &HeaderMap) -> Response {
    let not_modified = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| if_none_match(value, &page.fingerprint));

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        Json(page.content).into_response()
    };

    let max_age = state.pages.cache().config().ttl_for(page.key.class()).as_secs();
    let headers = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(&page.fingerprint) {
        headers.insert(ETAG, etag);
    }
    if let Ok(cache_control) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
        headers.insert(CACHE_CONTROL, cache_control);
    }
    headers.insert(
        X_CACHE,
        HeaderValue::from_static(if page.from_cache { "HIT" } else { "MISS" }),
    );
    response
}
