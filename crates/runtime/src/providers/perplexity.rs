//! Perplexity research client

use async_trait::async_trait;
use serde_json::Value;

use super::{
    map_transport_error, status_error, ProviderClient, ProviderRequest, ProviderResponse,
    USER_AGENT,
};
use crate::types::{ProviderError, ProviderKind};

/// Perplexity online-research client
pub struct PerplexityClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl PerplexityClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(90))
            .timeout(std::time::Duration::from_secs(300))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| map_transport_error(ProviderKind::Perplexity, e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PERPLEXITY_API_KEY").ok()?;
        let model =
            std::env::var("PERPLEXITY_MODEL").unwrap_or_else(|_| "sonar-pro".to_string());
        Self::new("https://api.perplexity.ai", api_key, model).ok()
    }
}

#[async_trait]
impl ProviderClient for PerplexityClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Perplexity
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let question = request
            .payload
            .get("prompt")
            .or_else(|| request.payload.get("query"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidInput("prompt".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system.as_deref().unwrap_or("Be precise and cite sources.") },
                { "role": "user", "content": question }
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Perplexity, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::Perplexity, response).await);
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Perplexity, e))?;

        let findings = envelope
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let sources = envelope
            .get("citations")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));

        let usage = envelope.get("usage").and_then(|usage| {
            Some((
                usage.get("prompt_tokens")?.as_u64()?,
                usage.get("completion_tokens")?.as_u64()?,
            ))
        });

        let mut result =
            ProviderResponse::new(serde_json::json!({ "findings": findings, "sources": sources }));
        if let Some((input, output)) = usage {
            result = result.with_usage(input, output);
        }
        Ok(result)
    }
}
