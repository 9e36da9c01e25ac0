//! Ollama native chat client.
//!
//! Ollama exposes `/api/chat` with newline-delimited JSON streaming instead
//! of server-sent events; this client adapts that contract to the common
//! [`LlmClient`] seam. The context window maps onto `options.num_ctx`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::message::Message;

use super::{CompletionOptions, LlmClient, LlmError, TextStream};

#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

/// Client for the native Ollama chat endpoint.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request_body(
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
        stream: bool,
    ) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut model_options = serde_json::Map::new();
        if let Some(num_ctx) = ctx {
            model_options.insert("num_ctx".to_string(), json!(num_ctx));
        }
        if let Some(temperature) = options.temperature {
            model_options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = options.top_p {
            model_options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(seed) = options.seed {
            model_options.insert("seed".to_string(), json!(seed));
        }

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("messages".to_string(), json!(wire_messages));
        body.insert("stream".to_string(), json!(stream));
        if options.reasoning {
            body.insert("think".to_string(), json!(true));
        }
        if !model_options.is_empty() {
            body.insert("options".to_string(), serde_json::Value::Object(model_options));
        }
        serde_json::Value::Object(body)
    }

    async fn send(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Refused {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

fn parse_line(line: &str) -> Option<Result<(String, bool), LlmError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ChatLine>(line) {
        Ok(ChatLine {
            error: Some(message),
            ..
        }) => Some(Err(LlmError::Stream { message })),
        Ok(parsed) => {
            let content = parsed.message.map(|m| m.content).unwrap_or_default();
            Some(Ok((content, parsed.done)))
        }
        Err(err) => Some(Err(LlmError::Decode {
            message: format!("ollama line: {err}"),
        })),
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    #[instrument(skip(self, messages, options), fields(model = %model))]
    async fn complete(
        &self,
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let body = Self::request_body(messages, model, ctx, options, false);
        let response = self.send(&body).await?;
        let line: ChatLine = response.json().await?;
        if let Some(message) = line.error {
            return Err(LlmError::Stream { message });
        }
        line.message
            .map(|m| m.content)
            .ok_or_else(|| LlmError::Decode {
                message: "response carried no message".to_string(),
            })
    }

    #[instrument(skip(self, messages, options), fields(model = %model))]
    async fn stream(
        &self,
        messages: &[Message],
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError> {
        let body = Self::request_body(messages, model, ctx, options, true);
        let response = self.send(&body).await?;

        let (tx, rx) = flume::bounded(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            'outer: while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(data) => {
                        buffer.extend_from_slice(&data);
                        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=newline).collect();
                            let line = String::from_utf8_lossy(&line);
                            match parse_line(&line) {
                                None => {}
                                Some(Ok((content, done))) => {
                                    if !content.is_empty()
                                        && tx.send_async(Ok(content)).await.is_err()
                                    {
                                        break 'outer;
                                    }
                                    if done {
                                        break 'outer;
                                    }
                                }
                                Some(Err(err)) => {
                                    let _ = tx.send_async(Err(err)).await;
                                    break 'outer;
                                }
                            }
                        }
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
        });

        Ok(TextStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn complete_decodes_message_content() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).json_body(serde_json::json!({
                    "message": {"role": "assistant", "content": "pong"},
                    "done": true
                }));
            })
            .await;

        let client = OllamaClient::new(&server.base_url()).unwrap();
        let text = client
            .complete(
                &[Message::user("ping")],
                "llama3",
                Some(8192),
                &CompletionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(text, "pong");
    }

    #[tokio::test]
    async fn stream_concatenates_ndjson_lines() {
        let server = MockServer::start_async().await;
        let ndjson = concat!(
            "{\"message\":{\"content\":\"po\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"ng\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200)
                    .header("content-type", "application/x-ndjson")
                    .body(ndjson);
            })
            .await;

        let client = OllamaClient::new(&server.base_url()).unwrap();
        let stream = client
            .stream(
                &[Message::user("ping")],
                "llama3",
                None,
                &CompletionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(stream.collect_text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn upstream_error_field_becomes_stream_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200)
                    .json_body(serde_json::json!({"error": "model not found"}));
            })
            .await;

        let client = OllamaClient::new(&server.base_url()).unwrap();
        let err = client
            .complete(
                &[Message::user("ping")],
                "missing",
                None,
                &CompletionOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Stream { message } if message == "model not found"));
    }

    #[test]
    fn request_body_maps_context_window() {
        let body = OllamaClient::request_body(
            &[Message::user("q")],
            "m",
            Some(4096),
            &CompletionOptions {
                temperature: Some(0.2),
                ..CompletionOptions::default()
            },
            true,
        );
        assert_eq!(body["options"]["num_ctx"], 4096);
        assert_eq!(body["stream"], true);
    }
}
