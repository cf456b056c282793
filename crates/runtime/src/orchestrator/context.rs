//! Job context
//!
//! The per-run dictionary of prior-stage results, plus the input projection
//! that feeds each stage. Projection probes candidate keys in priority
//! order, which tolerates schema drift between agents.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::types::{AgentResult, AgentType, PaperId, ResultData};

/// Candidate keys for the extracted paper text, in priority order.
pub const TEXT_KEYS: [&str; 4] = ["textContent", "extractedText", "content", "text"];

/// Prior-stage results for one run. A `None` entry marks a best-effort
/// stage that failed; downstream stages observe the gap and continue.
#[derive(Debug, Default)]
pub struct JobContext {
    results: HashMap<AgentType, Option<AgentResult>>,
    paper_id: Option<PaperId>,
    paper_title: Option<String>,
    document_text: Option<String>,
}

impl JobContext {
    pub fn new(
        paper_id: PaperId,
        paper_title: Option<String>,
        document_text: Option<String>,
    ) -> Self {
        Self {
            results: HashMap::new(),
            paper_id: Some(paper_id),
            paper_title,
            document_text,
        }
    }

    pub fn insert(&mut self, agent: AgentType, result: Option<AgentResult>) {
        self.results.insert(agent, result);
    }

    pub fn get(&self, agent: AgentType) -> Option<&AgentResult> {
        self.results.get(&agent).and_then(Option::as_ref)
    }

    /// Whether the stage ran and left a gap (failed best-effort stage).
    pub fn is_gap(&self, agent: AgentType) -> bool {
        matches!(self.results.get(&agent), Some(None))
    }

    pub fn results(&self) -> &HashMap<AgentType, Option<AgentResult>> {
        &self.results
    }

    /// Successfully completed stages, for credit-consumption accounting.
    pub fn completed_stages(&self) -> Vec<AgentType> {
        self.results
            .iter()
            .filter_map(|(agent, result)| {
                result
                    .as_ref()
                    .filter(|r| r.success)
                    .map(|_| *agent)
            })
            .collect()
    }

    fn project(&self, agent: AgentType, keys: &[&str]) -> Option<String> {
        self.get(agent)?.data.as_ref()?.project_string(keys)
    }

    /// The extracted paper text produced by the paper processor.
    pub fn extracted_text(&self) -> Option<String> {
        self.project(AgentType::PaperProcessor, &TEXT_KEYS)
    }

    /// Best-known paper title: enhanced metadata first, then the upload.
    pub fn title(&self) -> Option<String> {
        self.project(AgentType::MetadataEnhancer, &["title", "paperTitle"])
            .or_else(|| self.paper_title.clone())
    }

    /// Compose the input payload for `agent` from prior results.
    pub fn stage_input(&self, agent: AgentType) -> Value {
        let paper_id = self
            .paper_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();

        match agent {
            AgentType::PaperProcessor => json!({
                "paperId": paper_id,
                "documentText": self.document_text.clone().unwrap_or_default(),
            }),
            AgentType::MetadataEnhancer => json!({
                "paperId": paper_id,
                "title": self.paper_title.clone().unwrap_or_default(),
            }),
            AgentType::ContentSummarizer
            | AgentType::ConceptExplainer
            | AgentType::QualityChecker => json!({
                "paperId": paper_id,
                "textContent": self.extracted_text().unwrap_or_default(),
            }),
            AgentType::CitationFormatter => json!({
                "paperId": paper_id,
                "textContent": self.extracted_text().unwrap_or_default(),
            }),
            AgentType::CitationVerifier => {
                let citations = self
                    .get(AgentType::CitationFormatter)
                    .and_then(|result| result.data.as_ref())
                    .and_then(|data| match data {
                        ResultData::Citations { formatted, .. } => Some(formatted.join("\n")),
                        _ => None,
                    });
                json!({
                    "paperId": paper_id,
                    "citationsText": citations.unwrap_or_default(),
                    "title": self.title().unwrap_or_default(),
                })
            }
            AgentType::PerplexityResearcher => json!({
                "paperId": paper_id,
                "title": self.title().unwrap_or_default(),
                "brief": self
                    .project(AgentType::ContentSummarizer, &["brief", "summary"])
                    .unwrap_or_default(),
            }),
            AgentType::RelatedPaperDiscovery => json!({
                "paperId": paper_id,
                "title": self.title().unwrap_or_default(),
            }),
        }
    }

    /// Serialize the whole context for the persisted run row.
    pub fn to_entity_map(&self) -> HashMap<AgentType, Option<AgentResult>> {
        self.results.clone()
    }
}
