//! LLM chat-completion client
//!
//! Auto-detects the provider from environment variables and exposes a
//! unified chat interface. OpenAI-compatible and Anthropic message APIs are
//! both supported; usage metadata is surfaced when the provider reports it.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    map_transport_error, status_error, ProviderClient, ProviderRequest, ProviderResponse,
    USER_AGENT,
};
use crate::types::{ProviderError, ProviderKind};

/// Supported LLM backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::OpenAi => write!(f, "OpenAI"),
            LlmProvider::Anthropic => write!(f, "Anthropic"),
        }
    }
}

/// Chat-completions client for the LLM-backed agents
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    backend: LlmProvider,
}

impl LlmClient {
    /// Auto-detect the backend from environment variables.
    ///
    /// Checks in order:
    /// 1. `OPENAI_API_KEY` → OpenAI (model from `CHAT_MODEL`)
    /// 2. `ANTHROPIC_API_KEY` → Anthropic (model from `ANTHROPIC_MODEL`)
    ///
    /// Returns `None` if no API key is found.
    pub fn from_env() -> Option<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(90))
            .timeout(std::time::Duration::from_secs(300))
            .user_agent(USER_AGENT)
            .build()
            .ok()?;

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            tracing::info!("LLM client initialized: provider=OpenAI model={}", model);
            return Some(Self {
                client,
                api_key,
                base_url,
                model,
                backend: LlmProvider::OpenAi,
            });
        }

        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            let model = std::env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string());
            let base_url = std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string());
            tracing::info!("LLM client initialized: provider=Anthropic model={}", model);
            return Some(Self {
                client,
                api_key,
                base_url,
                model,
                backend: LlmProvider::Anthropic,
            });
        }

        tracing::info!("No LLM API key found in environment, LLM agents disabled");
        None
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> LlmProvider {
        self.backend
    }

    async fn openai_completion(
        &self,
        system: &str,
        user: &str,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "max_tokens": 4096,
            "temperature": 0.3
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Llm, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::Llm, response).await);
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Llm, e))?;

        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Schema {
                provider: ProviderKind::Llm.to_string(),
                message: "no message content in completion".to_string(),
            })?
            .to_string();

        Ok(wrap_content(content, usage_from(&envelope, "prompt_tokens", "completion_tokens")))
    }

    async fn anthropic_completion(
        &self,
        system: &str,
        user: &str,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "system": system,
            "messages": [ { "role": "user", "content": user } ],
            "max_tokens": 4096
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Llm, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::Llm, response).await);
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Llm, e))?;

        let content = envelope
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Schema {
                provider: ProviderKind::Llm.to_string(),
                message: "no text block in message".to_string(),
            })?
            .to_string();

        Ok(wrap_content(content, usage_from(&envelope, "input_tokens", "output_tokens")))
    }
}

fn usage_from(envelope: &Value, input_key: &str, output_key: &str) -> Option<(u64, u64)> {
    let usage = envelope.get("usage")?;
    Some((
        usage.get(input_key)?.as_u64()?,
        usage.get(output_key)?.as_u64()?,
    ))
}

fn wrap_content(content: String, usage: Option<(u64, u64)>) -> ProviderResponse {
    let response = ProviderResponse::new(serde_json::json!({ "content": content }));
    match usage {
        Some((input, output)) => response.with_usage(input, output),
        None => response,
    }
}

#[async_trait]
impl ProviderClient for LlmClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Llm
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let system = request.system.as_deref().unwrap_or("");
        let user = request
            .payload
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidInput("prompt".to_string()))?;

        match self.backend {
            LlmProvider::OpenAi => self.openai_completion(system, user).await,
            LlmProvider::Anthropic => self.anthropic_completion(system, user).await,
        }
    }
}
