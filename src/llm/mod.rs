//! LLM capability: a typed wrapper over interchangeable chat-completion
//! backends.
//!
//! Callers see two operations, [`LlmCapability::complete`] and
//! [`LlmCapability::stream`]; which provider serves them (hosted
//! OpenAI-compatible endpoint, local OpenAI-compatible server, or Ollama) is
//! decided by configuration and invisible past this module. Every call is
//! routed through the [`RateGovernor`](crate::governor::RateGovernor):
//! retryable errors re-queue with backoff, and a configurable streak of
//! consecutive failures switches a model to its declared fallback.

pub mod ollama;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::AppConfig;
use crate::governor::{GovernorError, RateGovernor};
use crate::message::Message;

pub use ollama::OllamaClient;
pub use openai::OpenAiCompatClient;

/// Sampling options for a completion call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    /// Ask the backend for extended reasoning where it supports it.
    pub reasoning: bool,
}

impl CompletionOptions {
    /// Deterministic options used by planning and judging calls.
    #[must_use]
    pub fn deterministic(seed: Option<u64>) -> Self {
        Self {
            temperature: Some(0.0),
            top_p: None,
            seed,
            reasoning: false,
        }
    }
}

/// Errors from LLM backends.
///
/// A response is either the complete text or an error; partial successful
/// streams never yield an error afterwards except an I/O error, which
/// terminates the stream.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("llm transport error: {source}")]
    #[diagnostic(code(delver::llm::transport))]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("llm rate limited (retry after {retry_after:?})")]
    #[diagnostic(code(delver::llm::rate_limited))]
    RateLimited { retry_after: Option<Duration> },

    #[error("llm endpoint refused request with status {status}: {message}")]
    #[diagnostic(code(delver::llm::refused))]
    Refused { status: u16, message: String },

    #[error("llm response could not be decoded: {message}")]
    #[diagnostic(code(delver::llm::decode))]
    Decode { message: String },

    #[error("llm stream failed: {message}")]
    #[diagnostic(code(delver::llm::stream))]
    Stream { message: String },

    #[error("llm call timed out after {after:?}")]
    #[diagnostic(code(delver::llm::timeout))]
    Timeout { after: Duration },

    #[error(transparent)]
    #[diagnostic(code(delver::llm::governor))]
    Governor(#[from] GovernorError),
}

impl LlmError {
    /// Whether the governor should re-queue the call after a backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Refused { status, .. } => *status >= 500,
            Self::Decode { .. } | Self::Stream { .. } | Self::Governor(_) => false,
        }
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Lazy sequence of text fragments from a streaming completion.
pub struct TextStream {
    rx: flume::Receiver<Result<String, LlmError>>,
}

impl TextStream {
    #[must_use]
    pub fn new(rx: flume::Receiver<Result<String, LlmError>>) -> Self {
        Self { rx }
    }

    /// Next fragment, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<String, LlmError>> {
        self.rx.recv_async().await.ok()
    }

    /// Drain the stream into the full response text.
    pub async fn collect_text(mut self) -> Result<String, LlmError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

/// A raw chat-completion provider.
///
/// Implementations translate between [`Message`] values and their wire
/// format. `ctx` is the requested context window; backends without a
/// corresponding knob ignore it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;

    async fn stream(
        &self,
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError>;
}

/// Governor-routed, retrying facade over the configured provider.
pub struct LlmCapability {
    client: Arc<dyn LlmClient>,
    governor: Arc<RateGovernor>,
    op_timeout: Duration,
    max_retries: u32,
}

impl LlmCapability {
    #[must_use]
    pub fn new(
        client: Arc<dyn LlmClient>,
        governor: Arc<RateGovernor>,
        op_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            governor,
            op_timeout,
            max_retries,
        }
    }

    /// Select and build the provider the configuration names.
    pub fn from_config(
        config: &AppConfig,
        governor: Arc<RateGovernor>,
    ) -> Result<Self, LlmError> {
        let client: Arc<dyn LlmClient> = if config.settings.use_local_llm {
            if config.local_ai.provider.eq_ignore_ascii_case("ollama") {
                Arc::new(OllamaClient::new(&config.local_ai.base_url)?)
            } else {
                Arc::new(OpenAiCompatClient::new(&config.local_ai.base_url, None)?)
            }
        } else {
            Arc::new(OpenAiCompatClient::new(
                &config.api.openai_base_url,
                config.api.openai_api_key.as_deref(),
            )?)
        };
        Ok(Self::new(
            client,
            governor,
            Duration::from_secs(config.rate_limits.operation_wait_secs.max(1)),
            config.rate_limits.max_retries,
        ))
    }

    /// Non-streaming completion with pacing, retries, and model fallback.
    #[instrument(skip(self, messages, options), fields(model = %model))]
    pub async fn complete(
        &self,
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let mut attempt: u32 = 0;
        let mut fallback_override: Option<String> = None;
        loop {
            let effective = fallback_override
                .clone()
                .unwrap_or_else(|| self.governor.resolve_model(model));
            let permit = self.governor.admit(&effective).await?;
            let outcome = tokio::time::timeout(
                self.op_timeout,
                self.client.complete(messages, &effective, ctx, options),
            )
            .await
            .unwrap_or(Err(LlmError::Timeout {
                after: self.op_timeout,
            }));
            drop(permit);

            match outcome {
                Ok(text) => {
                    self.governor.record_success(&effective);
                    return Ok(text);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let streak = self.governor.record_failure(&effective);
                    warn!(
                        model = %effective,
                        attempt,
                        streak,
                        error = %err,
                        "retryable llm failure, backing off"
                    );
                    tokio::time::sleep(RateGovernor::backoff_delay(
                        attempt,
                        err.is_rate_limited(),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(err @ LlmError::Refused { status, .. })
                    if status < 500 && status != 429 && fallback_override.is_none() =>
                {
                    // Upstream refused outright: one attempt on the fallback
                    // model, then give up.
                    self.governor.record_failure(&effective);
                    match self.governor.fallback_for(&effective) {
                        Some(fallback) => {
                            debug!(model = %effective, fallback = %fallback, "refused; trying fallback model once");
                            fallback_override = Some(fallback);
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => {
                    self.governor.record_failure(&effective);
                    return Err(err);
                }
            }
        }
    }

    /// Streaming completion. Pacing applies to stream start; the concurrency
    /// slot is held until the stream finishes draining.
    #[instrument(skip(self, messages, options), fields(model = %model))]
    pub async fn stream(
        &self,
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            let effective = self.governor.resolve_model(model);
            let permit = self.governor.admit(&effective).await?;
            match self.client.stream(messages, &effective, ctx, options).await {
                Ok(mut upstream) => {
                    let (tx, rx) = flume::bounded(32);
                    let governor = Arc::clone(&self.governor);
                    let model_name = effective.clone();
                    tokio::spawn(async move {
                        let mut failed = false;
                        while let Some(fragment) = upstream.next().await {
                            failed = fragment.is_err();
                            if tx.send_async(fragment).await.is_err() {
                                break;
                            }
                            if failed {
                                break;
                            }
                        }
                        if failed {
                            governor.record_failure(&model_name);
                        } else {
                            governor.record_success(&model_name);
                        }
                        drop(permit);
                    });
                    return Ok(TextStream::new(rx));
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    drop(permit);
                    self.governor.record_failure(&effective);
                    tokio::time::sleep(RateGovernor::backoff_delay(
                        attempt,
                        err.is_rate_limited(),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(err) => {
                    drop(permit);
                    self.governor.record_failure(&effective);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::GovernorConfig;
    use parking_lot::Mutex;

    struct ScriptedClient {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            _messages: &[Message],
            model: &str,
            _ctx: Option<u32>,
            _options: &CompletionOptions,
        ) -> Result<String, LlmError> {
            self.calls.lock().push(model.to_string());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                Ok("default".to_string())
            } else {
                replies.remove(0)
            }
        }

        async fn stream(
            &self,
            messages: &[Message],
            model: &str,
            ctx: Option<u32>,
            options: &CompletionOptions,
        ) -> Result<TextStream, LlmError> {
            let text = self.complete(messages, model, ctx, options).await?;
            let (tx, rx) = flume::bounded(4);
            tx.send(Ok(text)).ok();
            Ok(TextStream::new(rx))
        }
    }

    fn capability(client: Arc<ScriptedClient>, fallback: Option<&str>) -> LlmCapability {
        let governor = Arc::new(RateGovernor::new(GovernorConfig {
            requests_per_minute: 0,
            max_concurrent: 2,
            failure_threshold: 2,
            fallback_model: fallback.map(str::to_string),
        }));
        LlmCapability::new(client, governor, Duration::from_secs(5), 3)
    }

    fn stream_error() -> LlmError {
        LlmError::Stream {
            message: "x".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(LlmError::Timeout {
                after: Duration::from_secs(1),
            }),
            Err(LlmError::RateLimited { retry_after: None }),
            Ok("answer".to_string()),
        ]));
        let cap = capability(Arc::clone(&client), None);
        let text = cap
            .complete(&[Message::user("q")], "m", None, &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "answer");
        assert_eq!(client.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn refused_request_tries_fallback_once() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(LlmError::Refused {
                status: 400,
                message: "bad".into(),
            }),
            Err(LlmError::Refused {
                status: 400,
                message: "bad again".into(),
            }),
        ]));
        let cap = capability(Arc::clone(&client), Some("fallback"));
        let err = cap
            .complete(&[Message::user("q")], "m", None, &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Refused { status: 400, .. }));
        let calls = client.calls.lock().clone();
        assert_eq!(calls, vec!["m".to_string(), "fallback".to_string()]);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let client = Arc::new(ScriptedClient::new(vec![Err(stream_error())]));
        let cap = capability(Arc::clone(&client), None);
        let err = cap
            .complete(&[Message::user("q")], "m", None, &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Stream { .. }));
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn stream_collects_fragments() {
        let client = Arc::new(ScriptedClient::new(vec![Ok("hello world".to_string())]));
        let cap = capability(client, None);
        let stream = cap
            .stream(&[Message::user("q")], "m", None, &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.collect_text().await.unwrap(), "hello world");
    }
}
