//! Semantic Scholar graph client

use async_trait::async_trait;
use serde_json::Value;

use super::{
    map_transport_error, status_error, ProviderClient, ProviderRequest, ProviderResponse,
    USER_AGENT,
};
use crate::types::{ProviderError, ProviderKind};

const PAPER_FIELDS: &str = "title,authors,year,externalIds,abstract,citationCount";

/// Semantic Scholar client for citation verification
pub struct SemanticScholarClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| map_transport_error(ProviderKind::SemanticScholar, e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    pub fn public() -> Result<Self, ProviderError> {
        Self::new(
            "https://api.semanticscholar.org/graph/v1",
            std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok(),
        )
    }

    async fn search_paper(&self, query: &str) -> Result<Value, ProviderError> {
        let mut request = self
            .client
            .get(format!("{}/paper/search", self.base_url))
            .query(&[("query", query), ("fields", PAPER_FIELDS), ("limit", "5")]);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::SemanticScholar, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::SemanticScholar, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| map_transport_error(ProviderKind::SemanticScholar, e))
    }
}

#[async_trait]
impl ProviderClient for SemanticScholarClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SemanticScholar
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let query = request
            .payload
            .get("query")
            .or_else(|| request.payload.get("title"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidInput("query".to_string()))?;
        let body = self.search_paper(query).await?;
        Ok(ProviderResponse::new(body))
    }
}
