//! OpenAI-compatible chat-completions client.
//!
//! Serves both the hosted endpoint and local servers that speak the same
//! contract. Streaming uses server-sent events with the `[DONE]` data
//! sentinel terminating the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::message::Message;

use super::{CompletionOptions, LlmClient, LlmError, TextStream};

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any endpoint speaking the OpenAI chat-completions contract.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request_body<'a>(
        messages: &'a [Message],
        model: &'a str,
        options: &CompletionOptions,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            stream,
            temperature: options.temperature,
            top_p: options.top_p,
            seed: options.seed,
        }
    }

    fn builder(&self, body: &impl Serialize) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    #[instrument(skip(self, messages, options), fields(model = %model))]
    async fn complete(
        &self,
        messages: &[Message],
        model: &str,
        _ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let body = Self::request_body(messages, model, options, false);
        let response = self.builder(&body).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                retry_after: retry_after(&response),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Refused {
                status: status.as_u16(),
                message,
            });
        }

        let decoded: ChatResponse = response.json().await?;
        decoded
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Decode {
                message: "response carried no choices".to_string(),
            })
    }

    #[instrument(skip(self, messages, options), fields(model = %model))]
    async fn stream(
        &self,
        messages: &[Message],
        model: &str,
        _ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError> {
        let body = Self::request_body(messages, model, options, true);
        let mut source =
            EventSource::new(self.builder(&body)).map_err(|err| LlmError::Stream {
                message: format!("event source setup: {err}"),
            })?;

        let (tx, rx) = flume::bounded(32);
        tokio::spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => {
                        if message.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<StreamChunk>(&message.data) {
                            Ok(chunk) => {
                                let delta = chunk
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|c| c.delta.content)
                                    .unwrap_or_default();
                                if !delta.is_empty() && tx.send_async(Ok(delta)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                let _ = tx
                                    .send_async(Err(LlmError::Decode {
                                        message: format!("stream chunk: {err}"),
                                    }))
                                    .await;
                                break;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let error = if status.as_u16() == 429 {
                            LlmError::RateLimited {
                                retry_after: retry_after(&response),
                            }
                        } else {
                            LlmError::Refused {
                                status: status.as_u16(),
                                message: response.text().await.unwrap_or_default(),
                            }
                        };
                        let _ = tx.send_async(Err(error)).await;
                        break;
                    }
                    Err(err) => {
                        let _ = tx
                            .send_async(Err(LlmError::Stream {
                                message: err.to_string(),
                            }))
                            .await;
                        break;
                    }
                }
            }
            source.close();
        });

        Ok(TextStream::new(rx))
    }
}
