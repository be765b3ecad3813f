//! HTTP adapter for the upstream content API.

use async_trait::async_trait;
use reqwest::{Client, Response, Url, header::AUTHORIZATION};
use tracing::debug;

use crate::{
    application::content::{Content, ContentSource, FetchOptions, SourceError},
    config::ContentSettings,
};

use super::error::InfraError;

/// Fetches pages with `GET {base}/pages/{id}`, passing fetch options as query
/// parameters.
#[derive(Clone, Debug)]
pub struct HttpContentSource {
    client: Client,
    base: Option<Url>,
    token: Option<String>,
}

impl HttpContentSource {
    pub fn new(settings: &ContentSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            base: settings.base_url.clone(),
            token: settings.token.clone(),
        })
    }

    fn page_url(&self, id: &str, options: &FetchOptions) -> Result<Url, SourceError> {
        let mut url = self.base.clone().ok_or(SourceError::NotConfigured)?;
        url.path_segments_mut()
            .map_err(|_| SourceError::request("content API base URL cannot hold a path"))?
            .pop_if_empty()
            .push("pages")
            .push(id);

        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("fetchCollections", bool_param(options.fetch_auxiliary))
            .append_pair("concurrency", &options.concurrency.to_string())
            .append_pair("chunkLimit", &options.chunk_limit.to_string())
            .append_pair("chunkNumber", &options.chunk_number.to_string())
            .append_pair("fetchMissingBlocks", bool_param(options.fetch_missing_blocks))
            .append_pair("signFileUrls", bool_param(options.sign_file_urls));
        Ok(url)
    }

    async fn handle(resp: Response) -> Result<Content, SourceError> {
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| SourceError::request(err.to_string()))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            return Err(SourceError::status(status.as_u16(), text));
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| SourceError::decode(format!("failed to parse body: {err}")))
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch_page(&self, id: &str, options: &FetchOptions) -> Result<Content, SourceError> {
        let url = self.page_url(id, options)?;
        debug!(%url, "requesting page from content API");

        let mut req = self.client.get(url);
        if let Some(token) = self.token.as_deref() {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|err| SourceError::request(err.to_string()))?;
        Self::handle(resp).await
    }
}

fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn user_agent() -> &'static str {
    concat!("kura/", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(base: Option<&str>) -> ContentSettings {
        ContentSettings {
            base_url: base.map(|base| Url::parse(base).expect("valid url")),
            token: None,
            timeout: Duration::from_secs(1),
            disable_auxiliary: false,
        }
    }

    #[test]
    fn page_url_appends_id_and_options() {
        let source = HttpContentSource::new(&settings(Some("https://content.example.com/v1")))
            .expect("client builds");
        let url = source
            .page_url("abc def", &FetchOptions::default().without_auxiliary())
            .expect("url");

        assert_eq!(url.path(), "/v1/pages/abc%20def");
        let query: Vec<_> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("fetchCollections".to_string(), "false".to_string())));
        assert!(query.contains(&("chunkLimit".to_string(), "100".to_string())));
    }

    #[test]
    fn trailing_slash_in_base_is_not_doubled() {
        let source = HttpContentSource::new(&settings(Some("https://content.example.com/v1/")))
            .expect("client builds");
        let url = source
            .page_url("home", &FetchOptions::default())
            .expect("url");
        assert_eq!(url.path(), "/v1/pages/home");
    }

    #[tokio::test]
    async fn missing_base_url_reports_not_configured() {
        let source = HttpContentSource::new(&settings(None)).expect("client builds");
        let err = source
            .fetch_page("home", &FetchOptions::default())
            .await
            .expect_err("not configured");
        assert!(matches!(err, SourceError::NotConfigured));
    }
}
