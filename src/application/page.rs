use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::cache::{CacheEntry, CacheHandle, CacheKey};

use super::content::{FetchOptions, FetchRequest};
use super::fetch::{DegradingFetcher, FetchError};

/// A page as served to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub key: CacheKey,
    pub content: Value,
    pub fingerprint: String,
    pub created_at: OffsetDateTime,
    pub from_cache: bool,
}

impl CachedPage {
    fn from_entry(key: CacheKey, entry: CacheEntry, from_cache: bool) -> Self {
        Self {
            key,
            content: entry.value,
            fingerprint: entry.fingerprint,
            created_at: entry.created_at,
            from_cache,
        }
    }
}

/// Read-through access to pages: cache first, then the degrading fetcher.
#[derive(Clone)]
pub struct PageService {
    cache: CacheHandle,
    fetcher: DegradingFetcher,
}

impl PageService {
    pub fn new(cache: CacheHandle, fetcher: DegradingFetcher) -> Self {
        Self { cache, fetcher }
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    #[instrument(skip(self, request))]
    pub async fn page(&self, id: &str, request: FetchRequest) -> Result<CachedPage, FetchError> {
        self.read_through(CacheKey::content(id), request.resolve())
            .await
    }

    #[instrument(skip(self))]
    pub async fn page_info(&self, id: &str) -> Result<CachedPage, FetchError> {
        self.read_through(CacheKey::page_info(id), FetchOptions::page_info())
            .await
    }

    /// Fetch and store unconditionally, replacing any cached copy.
    pub async fn warm(&self, id: &str) -> Result<CachedPage, FetchError> {
        let key = CacheKey::content(id);
        self.fetch_and_store(key, FetchRequest::default().resolve())
            .await
    }

    async fn read_through(&self, key: CacheKey, options: FetchOptions) -> Result<CachedPage, FetchError> {
        if let Some(entry) = self.cache.get(&key).await {
            debug!(key = %key, outcome = "hit", "serving cached page");
            return Ok(CachedPage::from_entry(key, entry, true));
        }
        debug!(key = %key, outcome = "miss", "fetching page from source");
        self.fetch_and_store(key, options).await
    }

    async fn fetch_and_store(&self, key: CacheKey, options: FetchOptions) -> Result<CachedPage, FetchError> {
        let content = self.fetcher.fetch_with(key.id(), options).await?;
        let entry = self.cache.set(&key, content).await;
        Ok(CachedPage::from_entry(key, entry, false))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::application::content::{Content, ContentSource, SourceError};
    use crate::application::fetch::FetchPolicy;
    use crate::cache::CacheConfig;

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
        seen_ids: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContentSource for CountingSource {
        async fn fetch_page(&self, id: &str, options: &FetchOptions) -> Result<Content, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_ids.lock().expect("ids lock").push(id.to_string());
            Ok(json!({"id": id, "call": call, "chunk_limit": options.chunk_limit}))
        }
    }

    fn service(source: Arc<CountingSource>) -> PageService {
        PageService::new(
            CacheHandle::memory(CacheConfig::default()),
            DegradingFetcher::new(source, FetchPolicy::default()),
        )
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let source = Arc::new(CountingSource::default());
        let pages = service(source.clone());

        let first = pages.page("abc", FetchRequest::default()).await.expect("page");
        let second = pages.page("abc", FetchRequest::default()).await.expect("page");

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spellings_of_one_id_share_an_entry() {
        let source = Arc::new(CountingSource::default());
        let pages = service(source.clone());

        pages
            .page("0123abcd-4567-89ef-0123-456789abcdef", FetchRequest::default())
            .await
            .expect("page");
        let cached = pages
            .page("0123abcd456789ef0123456789abcdef", FetchRequest::default())
            .await
            .expect("page");

        assert!(cached.from_cache);
        assert_eq!(
            source.seen_ids.lock().expect("ids lock").as_slice(),
            ["0123abcd456789ef0123456789abcdef"]
        );
    }

    #[tokio::test]
    async fn page_info_uses_its_own_key_and_options() {
        let source = Arc::new(CountingSource::default());
        let pages = service(source.clone());

        let info = pages.page_info("abc").await.expect("info");
        let page = pages.page("abc", FetchRequest::default()).await.expect("page");

        assert_ne!(info.key, page.key);
        assert_eq!(info.content["chunk_limit"], json!(1));
        assert_eq!(page.content["chunk_limit"], json!(100));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_replaces_cached_copy() {
        let source = Arc::new(CountingSource::default());
        let pages = service(source.clone());

        let first = pages.page("abc", FetchRequest::default()).await.expect("page");
        let warmed = pages.warm("abc").await.expect("warm");
        let served = pages.page("abc", FetchRequest::default()).await.expect("page");

        assert_ne!(first.fingerprint, warmed.fingerprint);
        assert_eq!(served.fingerprint, warmed.fingerprint);
        assert!(served.from_cache);
    }
}
