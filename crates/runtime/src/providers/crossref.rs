//! Crossref works client

use async_trait::async_trait;
use serde_json::Value;

use super::{
    map_transport_error, status_error, ProviderClient, ProviderRequest, ProviderResponse,
    USER_AGENT,
};
use crate::types::{ProviderError, ProviderKind};

/// Crossref REST API client for metadata enhancement
pub struct CrossrefClient {
    client: reqwest::Client,
    base_url: String,
}

impl CrossrefClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| map_transport_error(ProviderKind::Crossref, e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn public() -> Result<Self, ProviderError> {
        Self::new("https://api.crossref.org")
    }

    /// Query works by title, returning the Crossref message envelope.
    async fn query_works(&self, title: &str, rows: u32) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(format!("{}/works", self.base_url))
            .query(&[("query.title", title), ("rows", rows.to_string().as_str())])
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Crossref, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::Crossref, response).await);
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Crossref, e))?;

        envelope
            .get("message")
            .cloned()
            .ok_or_else(|| ProviderError::Schema {
                provider: ProviderKind::Crossref.to_string(),
                message: "missing message envelope".to_string(),
            })
    }

    /// Resolve one DOI.
    async fn lookup_doi(&self, doi: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(format!("{}/works/{}", self.base_url, doi))
            .send()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Crossref, e))?;

        if !response.status().is_success() {
            return Err(status_error(ProviderKind::Crossref, response).await);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| map_transport_error(ProviderKind::Crossref, e))
            .map(|envelope| envelope.get("message").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ProviderClient for CrossrefClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Crossref
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = match request.operation.as_str() {
            "doi_lookup" => {
                let doi = request
                    .payload
                    .get("doi")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::InvalidInput("doi".to_string()))?;
                self.lookup_doi(doi).await?
            }
            _ => {
                let title = request
                    .payload
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::InvalidInput("title".to_string()))?;
                self.query_works(title, 3).await?
            }
        };
        Ok(ProviderResponse::new(body))
    }
}
