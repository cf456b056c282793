//! arXiv query client
//!
//! The arXiv API answers in Atom XML; the adapter passes the feed through
//! untouched and leaves interpretation to the discovery agent.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    map_transport_error, status_error, ProviderClient, ProviderRequest, ProviderResponse,
    USER_AGENT,
};
use crate::types::{ProviderError, ProviderKind};

/// arXiv export API client for related-paper discovery
pub struct ArxivClient {
    client: reqwest::Client,
    base_url: String,
}

impl ArxivClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| map_transport_error(ProviderKind::Arxiv, e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn public() -> Result<Self, ProviderError> {
        Self::new("http://export.arxiv.org/api")
    }

    async fn search(&self, query: &str, max_results: u32) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("search_query", format!("all:{query}").as_str()),
                ("max_results", max_results.to_string().as_str()),
            ])
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Arxiv, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::Arxiv, response).await);
        }

        response
            .text()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Arxiv, e))
    }
}

#[async_trait]
impl ProviderClient for ArxivClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Arxiv
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let query = request
            .payload
            .get("query")
            .or_else(|| request.payload.get("title"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidInput("query".to_string()))?;
        let feed = self.search(query, 10).await?;
        Ok(ProviderResponse::new(
            serde_json::json!({ "papers": { "atom_feed": feed } }),
        ))
    }
}
