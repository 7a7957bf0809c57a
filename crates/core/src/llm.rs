use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::MessageRole;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_CHAT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for ChatRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => ChatRole::System,
            MessageRole::Assistant => ChatRole::Assistant,
            MessageRole::User => ChatRole::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// How the model should shape its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    /// Structured JSON object mode. Only the evaluation worker asks for this.
    JsonObject,
}

/// A single-shot chat completion. Implementations are stateless and never retry;
/// callers own retries and output-shape validation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        format: ResponseFormat,
        timeout: Duration,
    ) -> Result<String>;
}

/// Chat client for any OpenAI-compatible `chat/completions` endpoint (OpenRouter by default).
pub struct OpenRouterClient {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: SecretString, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: OPENROUTER_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, messages: &[ChatMessage], format: ResponseFormat) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if format == ResponseFormat::JsonObject {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        format: ResponseFormat,
        timeout: Duration,
    ) -> Result<String> {
        let body = self.request_body(&messages, format);
        tracing::debug!(
            "chat request: model={}, messages={}, format={:?}",
            self.model,
            messages.len(),
            format
        );

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?
            .error_for_status()
            .context("chat completion returned an error status")?
            .json::<LlmResponse>()
            .await
            .context("chat completion response was not valid JSON")?;

        let answer = resp
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;
        Ok(answer.trim().to_string())
    }
}
