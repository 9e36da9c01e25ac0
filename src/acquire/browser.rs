//! Local acquisition path: headless browser for HTML, bounded download plus
//! text extraction for PDF.
//!
//! The browser is launched lazily on first use and shared across fetches;
//! each fetch runs in its own page under the per-task timeout. PDFs are
//! downloaded to a temporary file that is removed on every exit path, pruned
//! to the configured page bound, and extracted to text.

use std::io::Write;
use std::path::Path;

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use url::Url;

use super::{AcquireConfig, AcquireError, PageKind, classify, html_to_text, truncate_text};

/// Local headless-browser fetcher with a PDF sidecar path.
pub struct BrowserFetcher {
    config: AcquireConfig,
    http: reqwest::Client,
    browser: OnceCell<Browser>,
}

fn fetch_failed<E: std::fmt::Display>(err: E) -> AcquireError {
    AcquireError::FetchFailed {
        message: err.to_string(),
    }
}

impl BrowserFetcher {
    pub fn new(config: AcquireConfig) -> Result<Self, AcquireError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(fetch_failed)?;
        Ok(Self {
            config,
            http,
            browser: OnceCell::new(),
        })
    }

    #[instrument(skip(self), fields(url = %url))]
    pub async fn acquire(&self, url: &Url) -> Result<String, AcquireError> {
        let outcome = tokio::time::timeout(self.config.task_timeout, async {
            match classify(url, None) {
                PageKind::Html => self.fetch_html(url).await,
                PageKind::Pdf => self.fetch_pdf(url).await,
            }
        })
        .await
        .map_err(|_| AcquireError::Timeout {
            after: self.config.task_timeout,
        })??;
        Ok(truncate_text(outcome, self.config.max_text_length))
    }

    async fn browser(&self) -> Result<&Browser, AcquireError> {
        self.browser
            .get_or_try_init(|| async {
                let browser_config = BrowserConfig::builder()
                    .build()
                    .map_err(fetch_failed)?;
                let (browser, mut handler) =
                    Browser::launch(browser_config).await.map_err(fetch_failed)?;
                tokio::spawn(async move { while handler.next().await.is_some() {} });
                debug!("headless browser launched");
                Ok(browser)
            })
            .await
    }

    async fn fetch_html(&self, url: &Url) -> Result<String, AcquireError> {
        let browser = self.browser().await?;
        let page = browser.new_page(url.as_str()).await.map_err(fetch_failed)?;
        page.wait_for_navigation().await.map_err(fetch_failed)?;

        let text = match page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .ok()
            .and_then(|eval| eval.into_value::<String>().ok())
        {
            Some(text) if !text.trim().is_empty() => super::normalize_whitespace(&text),
            _ => {
                let html = page.content().await.map_err(fetch_failed)?;
                html_to_text(&html)
            }
        };

        page.close().await.ok();
        Ok(text)
    }

    async fn fetch_pdf(&self, url: &Url) -> Result<String, AcquireError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(fetch_failed)?;
        if !response.status().is_success() {
            return Err(AcquireError::FetchFailed {
                message: format!("pdf download returned status {}", response.status()),
            });
        }
        if let Some(length) = response.content_length() {
            if length > self.config.pdf_max_filesize {
                return Err(AcquireError::TooLarge {
                    limit: self.config.pdf_max_filesize,
                });
            }
        }

        // The temp file is removed when `file` drops, on every exit path.
        let mut file = tempfile::NamedTempFile::new().map_err(fetch_failed)?;
        let mut downloaded: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(fetch_failed)?;
            downloaded += chunk.len() as u64;
            if downloaded > self.config.pdf_max_filesize {
                return Err(AcquireError::TooLarge {
                    limit: self.config.pdf_max_filesize,
                });
            }
            file.write_all(&chunk).map_err(fetch_failed)?;
        }
        file.flush().map_err(fetch_failed)?;

        let path = file.path().to_path_buf();
        let max_pages = self.config.pdf_max_pages;
        let text = tokio::task::spawn_blocking(move || extract_pdf_text(&path, max_pages))
            .await
            .map_err(fetch_failed)??;
        drop(file);
        Ok(super::normalize_whitespace(&text))
    }
}

fn extract_pdf_text(path: &Path, max_pages: usize) -> Result<String, AcquireError> {
    let mut document = lopdf::Document::load(path).map_err(|err| AcquireError::UnsupportedType {
        content_type: format!("application/pdf (unparseable: {err})"),
    })?;

    let page_count = document.get_pages().len();
    if max_pages > 0 && page_count > max_pages {
        let beyond: Vec<u32> = document
            .get_pages()
            .keys()
            .copied()
            .filter(|number| *number as usize > max_pages)
            .collect();
        document.delete_pages(&beyond);
        let mut pruned = Vec::new();
        document.save_to(&mut pruned).map_err(fetch_failed)?;
        pdf_extract::extract_text_from_mem(&pruned).map_err(fetch_failed)
    } else {
        pdf_extract::extract_text(path).map_err(fetch_failed)
    }
}
