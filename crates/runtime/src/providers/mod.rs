//! External provider clients
//!
//! Thin adapters over the metadata and AI providers the agents consume.
//! Each client returns raw JSON plus optional token-usage metadata; the
//! agent runtime owns interpretation. Clients are black boxes behind
//! [`ProviderClient`], so tests substitute scripted implementations.

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{ProviderError, ProviderKind};

pub mod arxiv;
pub mod crossref;
pub mod llm;
pub mod perplexity;
pub mod semantic_scholar;

pub use arxiv::ArxivClient;
pub use crossref::CrossrefClient;
pub use llm::{LlmClient, LlmProvider};
pub use perplexity::PerplexityClient;
pub use semantic_scholar::SemanticScholarClient;

/// Stable User-Agent sent to every provider.
pub const USER_AGENT: &str = concat!("paperflow/", env!("CARGO_PKG_VERSION"));

/// A request to an external provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Provider-specific operation name, e.g. "chat", "works_lookup".
    pub operation: String,
    /// System/context text for prompt-driven providers.
    pub system: Option<String>,
    /// The main payload: prompt text or query parameters.
    pub payload: Value,
}

impl ProviderRequest {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            system: None,
            payload,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Rough size of the outbound text, used for token estimates when the
    /// provider reports no usage.
    pub fn text_len(&self) -> usize {
        self.system.as_deref().map(str::len).unwrap_or(0) + self.payload.to_string().len()
    }
}

/// Token usage reported by a provider, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw response from a provider call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub body: Value,
    pub usage: Option<ProviderUsage>,
}

impl ProviderResponse {
    pub fn new(body: Value) -> Self {
        Self { body, usage: None }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(ProviderUsage {
            input_tokens,
            output_tokens,
        });
        self
    }
}

/// One external provider endpoint.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Map a reqwest transport error into the provider error taxonomy.
pub(crate) fn map_transport_error(provider: ProviderKind, error: reqwest::Error) -> ProviderError {
    let provider = provider.to_string();
    if error.is_timeout() {
        ProviderError::Timeout {
            provider,
            elapsed: std::time::Duration::ZERO,
        }
    } else if error.is_connect() {
        ProviderError::ConnectionFailed {
            provider,
            message: error.to_string(),
        }
    } else if error.is_decode() {
        ProviderError::Schema {
            provider,
            message: error.to_string(),
        }
    } else {
        ProviderError::Io {
            provider,
            message: error.to_string(),
        }
    }
}

/// Turn a non-success HTTP status into a provider error.
pub(crate) async fn status_error(
    provider: ProviderKind,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unreadable error body".to_string());
    ProviderError::Http {
        provider: provider.to_string(),
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_text_len_covers_system_and_payload() {
        let request = ProviderRequest::new("chat", serde_json::json!({"q": "hello"}))
            .with_system("be terse");
        assert!(request.text_len() >= "be terse".len() + "hello".len());
    }

    #[test]
    fn user_agent_carries_version() {
        assert!(USER_AGENT.starts_with("paperflow/"));
    }
}
