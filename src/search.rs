//! Metasearch backend interface: query in, link list out.
//!
//! The engine only depends on the [`SearchBackend`] trait; [`SearxClient`]
//! implements it against a SearXNG-style JSON endpoint and is the default
//! collaborator in production configurations.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

/// One search result link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: Option<String>,
}

/// Errors from the metasearch backend.
#[derive(Debug, Error, Diagnostic)]
pub enum SearchError {
    #[error("search transport error: {source}")]
    #[diagnostic(code(delver::search::transport))]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("search backend returned status {status}")]
    #[diagnostic(
        code(delver::search::status),
        help("Verify the metasearch base URL and that JSON output is enabled.")
    )]
    Status { status: u16 },
}

/// A metasearch backend: query in, bounded link list out.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
}

/// SearXNG-style JSON search client.
pub struct SearxClient {
    http: reqwest::Client,
    base_url: String,
}

impl SearxClient {
    pub fn new(base_url: &str) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SearchBackend for SearxClient {
    #[instrument(skip(self), fields(query = %query))]
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
            });
        }

        let decoded: SearxResponse = response.json().await?;
        Ok(decoded
            .results
            .into_iter()
            .take(max_results)
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                snippet: r.content,
            })
            .collect())
    }
}

/// Deduplicate hits by URL, preserving first-seen order.
#[must_use]
pub fn dedup_by_url(hits: impl IntoIterator<Item = SearchHit>) -> Vec<SearchHit> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    hits.into_iter()
        .filter(|hit| seen.insert(hit.url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: String::new(),
            snippet: None,
        }
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let hits = vec![hit("a"), hit("b"), hit("a"), hit("c"), hit("b")];
        let deduped = dedup_by_url(hits);
        let urls: Vec<&str> = deduped.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn search_caps_results_and_decodes_json() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/search")
                    .query_param("q", "rust async")
                    .query_param("format", "json");
                then.status(200).json_body(serde_json::json!({
                    "results": [
                        {"url": "https://a.test/1", "title": "one", "content": "snippet"},
                        {"url": "https://a.test/2", "title": "two"},
                        {"url": "https://a.test/3", "title": "three"}
                    ]
                }));
            })
            .await;

        let client = SearxClient::new(&server.base_url()).unwrap();
        let hits = client.search("rust async", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://a.test/1");
        assert_eq!(hits[0].snippet.as_deref(), Some("snippet"));
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/search");
                then.status(503);
            })
            .await;

        let client = SearxClient::new(&server.base_url()).unwrap();
        let err = client.search("q", 3).await.unwrap_err();
        assert!(matches!(err, SearchError::Status { status: 503 }));
    }
}
