use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kura::application::{
    content::{Content, ContentSource, FetchOptions, SourceError},
    fetch::{DegradingFetcher, FetchPolicy},
    page::PageService,
    warmup::{WarmupPlan, WarmupScheduler},
};
use kura::cache::{CacheConfig, CacheHandle, CacheKey};
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct AuxiliaryDown;

#[async_trait]
impl ContentSource for AuxiliaryDown {
    async fn fetch_page(&self, id: &str, options: &FetchOptions) -> Result<Content, SourceError> {
        if options.fetch_auxiliary {
            return Err(SourceError::status(503, "collections unavailable"));
        }
        Ok(json!({ "id": id }))
    }
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Memory hit/miss/evict
    let small = CacheHandle::memory(CacheConfig {
        max_entries: 1,
        ..Default::default()
    });
    let first = CacheKey::content("first");
    assert!(small.get(&first).await.is_none());
    small.set(&first, json!(1)).await;
    assert!(small.get(&first).await.is_some());
    small.set(&CacheKey::content("second"), json!(2)).await;

    // Remote fallback
    let unreachable = CacheHandle::from_config(CacheConfig {
        use_remote_backend: true,
        remote_url: "redis://127.0.0.1:1".to_string(),
        ..Default::default()
    });
    assert!(unreachable.get(&first).await.is_none());

    // Degraded fetch + warmup batch latency
    let pages = PageService::new(
        CacheHandle::memory(CacheConfig::default()),
        DegradingFetcher::new(Arc::new(AuxiliaryDown), FetchPolicy::default()),
    );
    let report = WarmupScheduler::new(pages)
        .warm(
            &["a".to_string(), "b".to_string()],
            WarmupPlan {
                batch_size: NonZeroUsize::MIN,
                batch_delay: Duration::ZERO,
                item_timeout: Duration::from_secs(5),
            },
            CancellationToken::new(),
        )
        .await
        .expect("warmup runs");
    assert_eq!(report.succeeded, 2);

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        "kura_cache_hit_total",
        "kura_cache_miss_total",
        "kura_cache_evict_total",
        "kura_cache_backend_fallback_total",
        "kura_fetch_ms",
        "kura_warmup_batch_ms",
    ] {
        assert!(names.contains(expected), "missing metric {expected}: {names:?}");
    }

    let fetch_outcomes: HashSet<String> = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| composite_key.key().name() == "kura_fetch_ms")
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(fetch_outcomes.contains("degraded"), "{fetch_outcomes:?}");
}
