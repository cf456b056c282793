//! Stage graph definition
//!
//! The default pipeline: text extraction, then a parallel enhancement group,
//! then a sequential analysis tail. Each stage carries a fixed progress mark
//! and a failure policy.

use crate::types::AgentType;

/// Stages that run concurrently once the paper text is available.
pub const PARALLEL_GROUP: [AgentType; 3] = [
    AgentType::MetadataEnhancer,
    AgentType::ContentSummarizer,
    AgentType::ConceptExplainer,
];

/// Stages that run in order after the parallel group joins.
pub const SEQUENTIAL_TAIL: [AgentType; 5] = [
    AgentType::QualityChecker,
    AgentType::CitationFormatter,
    AgentType::CitationVerifier,
    AgentType::PerplexityResearcher,
    AgentType::RelatedPaperDiscovery,
];

/// Progress reported once the run finalizes.
pub const FINALIZE_PROGRESS: u8 = 100;

/// Fixed progress mark reached when a stage completes.
pub fn progress_for(agent: AgentType) -> u8 {
    match agent {
        AgentType::PaperProcessor => 15,
        AgentType::MetadataEnhancer => 25,
        AgentType::ContentSummarizer => 45,
        AgentType::ConceptExplainer => 55,
        AgentType::QualityChecker => 65,
        AgentType::CitationFormatter => 72,
        AgentType::CitationVerifier => 78,
        AgentType::PerplexityResearcher => 88,
        AgentType::RelatedPaperDiscovery => 95,
    }
}

/// Whether a stage failure aborts the run. Best-effort stages log the
/// failure and leave an empty context entry for downstream stages.
pub fn is_fatal(agent: AgentType) -> bool {
    matches!(
        agent,
        AgentType::PaperProcessor
            | AgentType::ContentSummarizer
            | AgentType::ConceptExplainer
            | AgentType::QualityChecker
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_marks_increase_along_the_default_order() {
        let mut previous = 0;
        for agent in AgentType::ALL {
            let mark = progress_for(agent);
            assert!(mark > previous, "{agent} mark {mark} <= {previous}");
            previous = mark;
        }
        assert!(FINALIZE_PROGRESS > previous);
    }

    #[test]
    fn failure_policy_matches_stage_criticality() {
        assert!(is_fatal(AgentType::PaperProcessor));
        assert!(is_fatal(AgentType::QualityChecker));
        assert!(!is_fatal(AgentType::MetadataEnhancer));
        assert!(!is_fatal(AgentType::RelatedPaperDiscovery));
        assert!(!is_fatal(AgentType::PerplexityResearcher));
    }

    #[test]
    fn every_agent_is_placed_exactly_once() {
        let mut placed = vec![AgentType::PaperProcessor];
        placed.extend(PARALLEL_GROUP);
        placed.extend(SEQUENTIAL_TAIL);
        placed.sort_by_key(|a| a.as_str());
        placed.dedup();
        assert_eq!(placed.len(), AgentType::ALL.len());
    }
}
