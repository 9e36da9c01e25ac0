//! Page acquisition pipeline: URL in, cleaned text out.
//!
//! A URL is classified as HTML or PDF (unknown defaults to HTML) and then
//! acquired through one of two strategies: the hosted extraction service, or
//! a local headless-browser path (behind the `browser` feature). Every
//! failure surfaces as one of four modes the orchestrator treats as a skip:
//! `timeout`, `too-large`, `unsupported-type`, `fetch-failed`.

pub mod hosted;

#[cfg(feature = "browser")]
pub mod browser;

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::config::AppConfig;
use crate::governor::RateGovernor;

pub use hosted::HostedParserClient;

/// Content class of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    Html,
    Pdf,
}

/// Failure modes of page acquisition. The orchestrator treats each as a
/// skip for the URL in question.
#[derive(Debug, Error, Diagnostic)]
pub enum AcquireError {
    #[error("page fetch timed out after {after:?}")]
    #[diagnostic(code(delver::acquire::timeout))]
    Timeout { after: Duration },

    #[error("page exceeds size limit of {limit} bytes")]
    #[diagnostic(code(delver::acquire::too_large))]
    TooLarge { limit: u64 },

    #[error("unsupported content type: {content_type}")]
    #[diagnostic(code(delver::acquire::unsupported_type))]
    UnsupportedType { content_type: String },

    #[error("page fetch failed: {message}")]
    #[diagnostic(code(delver::acquire::fetch_failed))]
    FetchFailed { message: String },
}

/// Size and timeout bounds for acquisition.
#[derive(Clone, Debug)]
pub struct AcquireConfig {
    /// Truncation bound for extracted text; `None` disables truncation.
    pub max_text_length: Option<usize>,
    /// Largest PDF downloaded, in bytes.
    pub pdf_max_filesize: u64,
    /// Largest number of PDF pages rendered for extraction.
    pub pdf_max_pages: usize,
    /// Per-task acquisition timeout.
    pub task_timeout: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            max_text_length: Some(20_000),
            pdf_max_filesize: 10 * 1024 * 1024,
            pdf_max_pages: 30,
            task_timeout: Duration::from_secs(30),
        }
    }
}

impl AcquireConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_text_length: match config.parsing.max_html_length {
                0 => None,
                n => Some(n),
            },
            pdf_max_filesize: config.parsing.pdf_max_filesize,
            pdf_max_pages: config.parsing.pdf_max_pages,
            task_timeout: Duration::from_secs(config.concurrency.fetch_timeout_secs.max(1)),
        }
    }
}

/// Classify a URL by extension or, when available, by content type.
/// Unknown inputs default to HTML.
#[must_use]
pub fn classify(url: &Url, content_type: Option<&str>) -> PageKind {
    if let Some(content_type) = content_type {
        if content_type.contains("application/pdf") {
            return PageKind::Pdf;
        }
        if content_type.contains("text/html") || content_type.contains("application/xhtml") {
            return PageKind::Html;
        }
    }
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".pdf") {
        PageKind::Pdf
    } else {
        PageKind::Html
    }
}

/// The configured acquisition strategy.
pub enum PageAcquirer {
    Hosted(HostedParserClient),
    #[cfg(feature = "browser")]
    Browser(browser::BrowserFetcher),
}

impl PageAcquirer {
    /// Build the acquirer the configuration's feature flags select.
    pub fn from_config(
        config: &AppConfig,
        governor: Arc<RateGovernor>,
    ) -> Result<Self, AcquireError> {
        let acquire_config = AcquireConfig::from_app_config(config);
        #[cfg(feature = "browser")]
        if !config.settings.use_hosted_parser {
            return Ok(Self::Browser(browser::BrowserFetcher::new(acquire_config)?));
        }
        #[cfg(not(feature = "browser"))]
        if !config.settings.use_hosted_parser {
            tracing::warn!("local browser path not compiled in; falling back to hosted parser");
        }
        Ok(Self::Hosted(HostedParserClient::new(
            &config.api.hosted_parser_url,
            config.api.hosted_parser_api_key.as_deref(),
            governor,
            acquire_config,
        )?))
    }

    /// Fetch and parse the page at `url` into cleaned text.
    pub async fn acquire(&self, url: &Url) -> Result<String, AcquireError> {
        match self {
            Self::Hosted(client) => client.acquire(url).await,
            #[cfg(feature = "browser")]
            Self::Browser(fetcher) => fetcher.acquire(url).await,
        }
    }
}

/// Convert an HTML document to readable text: body text with tags stripped
/// and whitespace normalized.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = Selector::parse("body").ok();

    let raw: String = match selector.as_ref().and_then(|s| document.select(s).next()) {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };
    normalize_whitespace(&raw)
}

/// Collapse whitespace runs and trim.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_lines = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_lines += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_lines > 0 { "\n\n" } else { "\n" });
        }
        let mut last_was_space = false;
        for ch in line.chars() {
            if ch.is_whitespace() {
                if !last_was_space {
                    out.push(' ');
                }
                last_was_space = true;
            } else {
                out.push(ch);
                last_was_space = false;
            }
        }
        blank_lines = 0;
    }
    out
}

/// Truncate text to at most `max` characters on a char boundary.
#[must_use]
pub fn truncate_text(text: String, max: Option<usize>) -> String {
    let Some(max) = max else {
        return text;
    };
    if text.chars().count() <= max {
        return text;
    }
    text.chars().take(max).collect()
}
