//! Client for the external completion service.
//!
//! One call per request, no retries.  Any transport failure, timeout or
//! non-2xx answer becomes [`GenerationError::Provider`] carrying the status
//! and a bounded copy of the body.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CompletionConfig;
use crate::error::GenerationError;
use crate::util::truncate_chars;

/// Bodies longer than this are cut before being kept for diagnostics.
const MAX_ERROR_BODY_CHARS: usize = 1000;

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client.
pub struct HttpCompletionClient {
    cfg: CompletionConfig,
    client: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(cfg: CompletionConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.cfg
    }
}

fn bounded(body: &str) -> String {
    truncate_chars(body, MAX_ERROR_BODY_CHARS).to_string()
}

#[async_trait::async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let body = ChatCompletionRequest {
            model: &self.cfg.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature,
            max_tokens: max_output_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let mut rb = self.client.post(&self.cfg.url).json(&body);
        if let Some(key) = self.cfg.api_key.as_deref().filter(|k| !k.is_empty()) {
            rb = rb.bearer_auth(key);
        }

        let resp = match rb.send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(
                    target: "completion",
                    error = %err,
                    timeout = err.is_timeout(),
                    "completion request failed"
                );
                return Err(GenerationError::Provider {
                    status: None,
                    body: err.to_string(),
                });
            }
        };
        let status = resp.status();
        let text = resp.text().await.map_err(|err| GenerationError::Provider {
            status: Some(status.as_u16()),
            body: format!("failed to read response body: {}", err),
        })?;

        if !status.is_success() {
            tracing::warn!(
                target: "completion",
                status = status.as_u16(),
                body = %bounded(&text),
                "completion service returned an error"
            );
            return Err(GenerationError::Provider {
                status: Some(status.as_u16()),
                body: bounded(&text),
            });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|err| GenerationError::Provider {
                status: Some(status.as_u16()),
                body: format!("unexpected response shape ({}): {}", err, bounded(&text)),
            })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::Provider {
                status: Some(status.as_u16()),
                body: format!("response carried no message content: {}", bounded(&text)),
            })
    }
}
