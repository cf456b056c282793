//! Core types and data structures for the pipeline runtime

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod credit;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod task;

pub use credit::*;
pub use error::*;
pub use event::*;
pub use pipeline::*;
pub use task::*;

/// Unique identifier for pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for agent tasks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for users
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for papers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaperId(pub String);

impl From<&str> for PaperId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for PaperId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed set of pipeline agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    PaperProcessor,
    MetadataEnhancer,
    ContentSummarizer,
    ConceptExplainer,
    QualityChecker,
    CitationFormatter,
    CitationVerifier,
    PerplexityResearcher,
    RelatedPaperDiscovery,
}

impl AgentType {
    /// All agents in default stage order.
    pub const ALL: [AgentType; 9] = [
        AgentType::PaperProcessor,
        AgentType::MetadataEnhancer,
        AgentType::ContentSummarizer,
        AgentType::ConceptExplainer,
        AgentType::QualityChecker,
        AgentType::CitationFormatter,
        AgentType::CitationVerifier,
        AgentType::PerplexityResearcher,
        AgentType::RelatedPaperDiscovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::PaperProcessor => "PAPER_PROCESSOR",
            AgentType::MetadataEnhancer => "METADATA_ENHANCER",
            AgentType::ContentSummarizer => "CONTENT_SUMMARIZER",
            AgentType::ConceptExplainer => "CONCEPT_EXPLAINER",
            AgentType::QualityChecker => "QUALITY_CHECKER",
            AgentType::CitationFormatter => "CITATION_FORMATTER",
            AgentType::CitationVerifier => "CITATION_VERIFIER",
            AgentType::PerplexityResearcher => "PERPLEXITY_RESEARCHER",
            AgentType::RelatedPaperDiscovery => "RELATED_PAPER_DISCOVERY",
        }
    }

    /// The external provider this agent talks to.
    pub fn provider(&self) -> ProviderKind {
        match self {
            AgentType::PaperProcessor
            | AgentType::ContentSummarizer
            | AgentType::ConceptExplainer
            | AgentType::QualityChecker
            | AgentType::CitationFormatter => ProviderKind::Llm,
            AgentType::MetadataEnhancer => ProviderKind::Crossref,
            AgentType::CitationVerifier => ProviderKind::SemanticScholar,
            AgentType::PerplexityResearcher => ProviderKind::Perplexity,
            AgentType::RelatedPaperDiscovery => ProviderKind::Arxiv,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External metadata and AI providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Crossref,
    SemanticScholar,
    Arxiv,
    Perplexity,
    Llm,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Crossref => "crossref",
            ProviderKind::SemanticScholar => "semantic_scholar",
            ProviderKind::Arxiv => "arxiv",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::Llm => "llm",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
