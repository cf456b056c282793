//! Credit balance, transaction, and token metrics types

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AgentType, ProviderKind, TaskId, UserId};

/// Subscription tiers used to resolve operation costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Pro,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        SubscriptionTier::Free
    }
}

/// Chargeable operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    FullPipelineProcessing,
    PaperTextExtraction,
    MetadataEnhancement,
    ContentSummarization,
    ConceptExplanation,
    QualityCheck,
    CitationFormatting,
    CitationVerification,
    ExternalResearch,
    RelatedPaperDiscovery,
}

impl OperationType {
    pub fn for_agent(agent: AgentType) -> Self {
        match agent {
            AgentType::PaperProcessor => OperationType::PaperTextExtraction,
            AgentType::MetadataEnhancer => OperationType::MetadataEnhancement,
            AgentType::ContentSummarizer => OperationType::ContentSummarization,
            AgentType::ConceptExplainer => OperationType::ConceptExplanation,
            AgentType::QualityChecker => OperationType::QualityCheck,
            AgentType::CitationFormatter => OperationType::CitationFormatting,
            AgentType::CitationVerifier => OperationType::CitationVerification,
            AgentType::PerplexityResearcher => OperationType::ExternalResearch,
            AgentType::RelatedPaperDiscovery => OperationType::RelatedPaperDiscovery,
        }
    }
}

/// Per-user credit balance row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: UserId,
    pub balance: u64,
    pub used_this_period: u64,
    pub next_reset_at: DateTime<Utc>,
    pub total_earned: u64,
    pub total_used: u64,
}

impl CreditBalance {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            used_this_period: 0,
            next_reset_at: first_of_next_month(Utc::now()),
            total_earned: 0,
            total_used: 0,
        }
    }
}

/// First instant of the month after `from`, in UTC.
pub fn first_of_next_month(from: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };
    // Day 1 at midnight UTC is always representable.
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(from)
}

/// Kinds of credit ledger entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Add,
    Deduct,
    Refund,
    Reset,
}

/// Immutable append-only credit ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: u64,
    pub balance_after: u64,
    pub operation_type: Option<OperationType>,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One persisted record per external provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetricsRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub agent: AgentType,
    pub task_id: TaskId,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub processing_time_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl TokenMetricsRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        provider: ProviderKind,
        agent: AgentType,
        task_id: TaskId,
        input_tokens: u64,
        output_tokens: u64,
        estimated_cost: f64,
        processing_time_ms: u64,
        success: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider,
            agent,
            task_id,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost,
            processing_time_ms,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Token estimate for text when the provider omits usage metadata.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
