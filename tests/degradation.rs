use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kura::application::{
    content::{Content, ContentSource, FetchOptions, FetchRequest, SourceError},
    fetch::{DegradingFetcher, FetchError, FetchPolicy},
    page::PageService,
};
use kura::cache::{CacheConfig, CacheHandle};
use serde_json::json;

/// Fails whenever auxiliary data is requested, like an upstream whose
/// collection endpoint is down.
#[derive(Default)]
struct BrokenCollections {
    calls: Mutex<Vec<FetchOptions>>,
    always_fail: bool,
}

#[async_trait]
impl ContentSource for BrokenCollections {
    async fn fetch_page(&self, id: &str, options: &FetchOptions) -> Result<Content, SourceError> {
        self.calls.lock().expect("calls lock").push(*options);
        if self.always_fail {
            return Err(SourceError::request("connection reset"));
        }
        if options.fetch_auxiliary {
            return Err(SourceError::status(502, "collection timed out"));
        }
        Ok(json!({ "id": id, "collections": null }))
    }
}

fn pages(source: Arc<BrokenCollections>, policy: FetchPolicy) -> PageService {
    PageService::new(
        CacheHandle::memory(CacheConfig::default()),
        DegradingFetcher::new(source, policy),
    )
}

#[tokio::test]
async fn degraded_content_is_served_and_cached() {
    let source = Arc::new(BrokenCollections::default());
    let pages = pages(source.clone(), FetchPolicy::default());

    let first = pages
        .page("docs", FetchRequest::default())
        .await
        .expect("degraded page");
    assert!(!first.from_cache);
    assert_eq!(first.content["id"], "docs");

    let second = pages
        .page("docs", FetchRequest::default())
        .await
        .expect("cached page");
    assert!(second.from_cache);
    assert_eq!(second.fingerprint, first.fingerprint);

    let calls = source.calls.lock().expect("calls lock").clone();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].fetch_auxiliary);
    assert_eq!(calls[1], calls[0].without_auxiliary());
}

#[tokio::test]
async fn kill_switch_never_asks_for_auxiliary_data() {
    let source = Arc::new(BrokenCollections::default());
    let pages = pages(
        source.clone(),
        FetchPolicy {
            disable_auxiliary: true,
        },
    );

    pages
        .page("docs", FetchRequest::default())
        .await
        .expect("page");
    let calls = source.calls.lock().expect("calls lock").clone();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].fetch_auxiliary);
}

#[tokio::test]
async fn terminal_failure_is_not_cached() {
    let source = Arc::new(BrokenCollections {
        always_fail: true,
        ..Default::default()
    });
    let pages = pages(source.clone(), FetchPolicy::default());

    let err = pages
        .page("docs", FetchRequest::default())
        .await
        .expect_err("both attempts fail");
    let FetchError::Degraded { id, first_attempt, .. } = &err;
    assert_eq!(id, "docs");
    assert!(first_attempt.contains("connection reset"));

    pages
        .page("docs", FetchRequest::default())
        .await
        .expect_err("still failing");
    assert_eq!(source.calls.lock().expect("calls lock").len(), 4);
}
