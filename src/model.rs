//! Reasoning-model client.
//!
//! [`ReasoningModel`] is the seam the pipeline calls through; tests swap in
//! scripted fakes. [`HttpModelClient`] speaks two wire flavors of the
//! OpenAI-compatible API:
//!
//! - **reasoning**: `POST {base_url}/responses` with `reasoning.effort`;
//!   text is read from the first assistant `message` item.
//! - **completions**: `POST {base_url}/chat/completions` with
//!   `max_tokens` and `temperature`; text is `choices[0].message.content`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - other non-2xx → fail immediately with a body snippet
//! - connection errors → retry
//! - timeouts and cancellation → fail immediately
//!
//! One deadline covers the whole call, retries and backoff included: the
//! tighter of `http_timeout_seconds` from the start of the call and the
//! caller's scope deadline. No attempt starts once a backoff would overrun it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::scope::CallScope;

const SNIPPET_LIMIT: usize = 500;
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Reasoning effort hint. Ignored by the completions flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }
}

/// Text returned by one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub usage_tokens: u64,
}

#[async_trait]
pub trait ReasoningModel: Send + Sync {
    /// Model identifier, used for logging.
    fn model_name(&self) -> &str;

    /// Send one prompt. Fails with [`ModelError::EmptyText`] if the reply
    /// carries no text.
    async fn invoke(
        &self,
        prompt: &str,
        effort: Effort,
        scope: &CallScope,
    ) -> Result<ModelReply, ModelError>;
}

pub struct HttpModelClient {
    client: reqwest::Client,
    config: ModelConfig,
    api_key: String,
    max_retries: u32,
}

impl HttpModelClient {
    /// Build a client. An empty `api_key` falls back to `OPENAI_API_KEY`.
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = if config.api_key.trim().is_empty() {
            std::env::var("OPENAI_API_KEY").map_err(|_| {
                ModelError::Config(
                    "model.api_key is empty and OPENAI_API_KEY is not set".to_string(),
                )
            })?
        } else {
            config.api_key.clone()
        };

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if self.config.use_reasoning_api {
            format!("{}/responses", base)
        } else {
            format!("{}/chat/completions", base)
        }
    }

    fn request_body(&self, prompt: &str, effort: Effort) -> Value {
        let mut body = if self.config.use_reasoning_api {
            json!({
                "model": self.config.model_name,
                "input": [{ "role": "user", "content": prompt }],
                "reasoning": { "effort": effort.as_str() },
            })
        } else {
            json!({
                "model": self.config.model_name,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": self.config.max_tokens,
                "temperature": self.config.temperature,
            })
        };
        if self.config.store {
            body["store"] = Value::Bool(true);
        }
        body
    }

    async fn send_with_retry(&self, body: &Value, scope: &CallScope) -> Result<Value, ModelError> {
        let url = self.endpoint();
        let limit = Duration::from_secs(self.config.http_timeout_seconds);
        let call = scope.clone().with_timeout(limit);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                if call.budget(limit) <= delay {
                    tracing::warn!(attempt, "model call deadline reached before retry");
                    return Err(ModelError::Timeout(limit));
                }
                tokio::time::sleep(delay).await;
            }

            let budget = call.budget(limit);
            if budget.is_zero() {
                return Err(ModelError::Timeout(limit));
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .timeout(budget)
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| ModelError::Decode(e.to_string()));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = ModelError::Status {
                        status: status.as_u16(),
                        snippet: snippet(&body_text),
                    };

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(status = status.as_u16(), attempt, "model call failed, retrying");
                        last_err = Some(err);
                        continue;
                    }

                    return Err(err);
                }
                Err(e) if e.is_timeout() => return Err(ModelError::Timeout(budget)),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "model transport error, retrying");
                    last_err = Some(ModelError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ModelError::Transport("no attempts made".to_string())))
    }
}

#[async_trait]
impl ReasoningModel for HttpModelClient {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn invoke(
        &self,
        prompt: &str,
        effort: Effort,
        scope: &CallScope,
    ) -> Result<ModelReply, ModelError> {
        let body = self.request_body(prompt, effort);

        let envelope = tokio::select! {
            biased;
            _ = scope.token().cancelled() => return Err(ModelError::Cancelled),
            res = self.send_with_retry(&body, scope) => res?,
        };

        let text = if self.config.use_reasoning_api {
            extract_reasoning_text(&envelope)?
        } else {
            extract_completion_text(&envelope)?
        };

        let usage_tokens = envelope
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        tracing::debug!(
            model = %self.config.model_name,
            usage_tokens,
            chars = text.len(),
            "model call complete"
        );

        Ok(ModelReply { text, usage_tokens })
    }
}

/// Text of a `/responses` envelope: the first `output_text` (or `text`)
/// content item of the first assistant message.
pub fn extract_reasoning_text(envelope: &Value) -> Result<String, ModelError> {
    let output = envelope
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Decode("missing output array".to_string()))?;

    let text = output
        .iter()
        .filter(|item| {
            item.get("type").and_then(Value::as_str) == Some("message")
                && item.get("role").and_then(Value::as_str) == Some("assistant")
        })
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .find(|content| {
            matches!(
                content.get("type").and_then(Value::as_str),
                Some("output_text") | Some("text")
            )
        })
        .and_then(|content| content.get("text").and_then(Value::as_str));

    non_empty(text)
}

/// Text of a `/chat/completions` envelope: `choices[0].message.content`.
pub fn extract_completion_text(envelope: &Value) -> Result<String, ModelError> {
    let choices = envelope
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Decode("missing choices array".to_string()))?;

    let text = choices
        .first()
        .and_then(|choice| choice.pointer("/message/content"))
        .and_then(Value::as_str);

    non_empty(text)
}

fn non_empty(text: Option<&str>) -> Result<String, ModelError> {
    match text {
        Some(t) if !t.trim().is_empty() => Ok(t.to_string()),
        _ => Err(ModelError::EmptyText),
    }
}

fn snippet(body: &str) -> String {
    if body.chars().count() <= SNIPPET_LIMIT {
        body.to_string()
    } else {
        let cut: String = body.chars().take(SNIPPET_LIMIT).collect();
        format!("{}...", cut)
    }
}
