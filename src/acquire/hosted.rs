//! Hosted extraction service client.
//!
//! POSTs the target URL to a hosted reader endpoint and receives cleaned
//! text back. The service applies its own rate limiting, so requests are
//! paced through the shared governor under a dedicated service key.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::instrument;
use url::Url;

use crate::governor::RateGovernor;

use super::{AcquireConfig, AcquireError, PageKind, classify, html_to_text, truncate_text};

/// Governor pacing key for the hosted extraction service.
pub const HOSTED_PARSER_SERVICE: &str = "hosted-parser";

/// Client for a hosted page-extraction service.
pub struct HostedParserClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    governor: Arc<RateGovernor>,
    config: AcquireConfig,
}

impl HostedParserClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<&str>,
        governor: Arc<RateGovernor>,
        config: AcquireConfig,
    ) -> Result<Self, AcquireError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AcquireError::FetchFailed {
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_key: api_key.map(str::to_string),
            governor,
            config,
        })
    }

    #[instrument(skip(self), fields(url = %url))]
    pub async fn acquire(&self, url: &Url) -> Result<String, AcquireError> {
        let permit = self
            .governor
            .admit(HOSTED_PARSER_SERVICE)
            .await
            .map_err(|err| AcquireError::FetchFailed {
                message: err.to_string(),
            })?;

        let outcome = tokio::time::timeout(self.config.task_timeout, self.post(url)).await;
        drop(permit);

        let text = outcome.map_err(|_| AcquireError::Timeout {
            after: self.config.task_timeout,
        })??;
        Ok(truncate_text(text, self.config.max_text_length))
    }

    async fn post(&self, url: &Url) -> Result<String, AcquireError> {
        let mut builder = self.http.post(&self.endpoint).json(&json!({
            "url": url.as_str(),
        }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            413 => {
                return Err(AcquireError::TooLarge {
                    limit: self.config.pdf_max_filesize,
                });
            }
            415 => {
                return Err(AcquireError::UnsupportedType {
                    content_type: response
                        .headers()
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            code => {
                return Err(AcquireError::FetchFailed {
                    message: format!("extraction service returned status {code}"),
                });
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(map_reqwest_error)?;

        // Some services echo HTML back for HTML pages; strip it to text.
        match classify(url, content_type.as_deref()) {
            PageKind::Html if body.trim_start().starts_with('<') => Ok(html_to_text(&body)),
            _ => Ok(super::normalize_whitespace(&body)),
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> AcquireError {
    if err.is_timeout() {
        AcquireError::Timeout {
            after: Duration::ZERO,
        }
    } else {
        AcquireError::FetchFailed {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::GovernorConfig;
    use httpmock::prelude::*;

    fn client(endpoint: String) -> HostedParserClient {
        HostedParserClient::new(
            &endpoint,
            None,
            Arc::new(RateGovernor::new(GovernorConfig {
                requests_per_minute: 0,
                max_concurrent: 2,
                failure_threshold: 3,
                fallback_model: None,
            })),
            AcquireConfig {
                max_text_length: Some(50),
                ..AcquireConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn posts_url_and_returns_cleaned_text() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/extract")
                    .json_body_partial(r#"{"url": "https://a.test/page"}"#);
                then.status(200).body("Cleaned   article text.\n\n\nMore.");
            })
            .await;

        let client = client(format!("{}/extract", server.base_url()));
        let text = client
            .acquire(&Url::parse("https://a.test/page").unwrap())
            .await
            .unwrap();
        assert_eq!(text, "Cleaned article text.\n\nMore.");
    }

    #[tokio::test]
    async fn truncates_to_configured_length() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/extract");
                then.status(200).body("x".repeat(500));
            })
            .await;

        let client = client(format!("{}/extract", server.base_url()));
        let text = client
            .acquire(&Url::parse("https://a.test/long").unwrap())
            .await
            .unwrap();
        assert_eq!(text.chars().count(), 50);
    }

    #[tokio::test]
    async fn payload_too_large_maps_to_too_large() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/extract");
                then.status(413);
            })
            .await;

        let client = client(format!("{}/extract", server.base_url()));
        let err = client
            .acquire(&Url::parse("https://a.test/big.pdf").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn service_error_maps_to_fetch_failed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/extract");
                then.status(500);
            })
            .await;

        let client = client(format!("{}/extract", server.base_url()));
        let err = client
            .acquire(&Url::parse("https://a.test/page").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::FetchFailed { .. }));
    }
}
