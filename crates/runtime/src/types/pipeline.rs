//! Pipeline run types and per-run configuration

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentResult, AgentType, PaperId, RunId, UserId};

/// Lifecycle status of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
    PendingCredits,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::PendingCredits
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Initializing => "INITIALIZING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::PendingCredits => "PENDING_CREDITS",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run configuration: stage toggles, limits, cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages excluded from this run. Skipped stages contribute no progress
    /// change and leave no context entry.
    #[serde(default)]
    pub disabled_stages: HashSet<AgentType>,
    /// Bound on stages executing in parallel within one run.
    pub max_concurrent_agents: usize,
    /// Whole-run deadline.
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Credits reserved up front for the full pipeline.
    pub credit_cost: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            disabled_stages: HashSet::new(),
            max_concurrent_agents: 4,
            run_timeout: Duration::from_secs(15 * 60),
            credit_cost: 30,
        }
    }
}

impl PipelineConfig {
    pub fn is_enabled(&self, agent: AgentType) -> bool {
        !self.disabled_stages.contains(&agent)
    }
}

/// One structured stage error surfaced by the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub stage: AgentType,
    pub message: String,
    /// Whether this failure aborted the run.
    pub fatal: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Durable record of one end-to-end processing of one paper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub paper_id: PaperId,
    pub user_id: UserId,
    pub status: RunStatus,
    pub progress_percent: u8,
    pub current_stage: Option<AgentType>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub configuration: PipelineConfig,
    /// Stage name -> result. `None` marks a best-effort stage that failed;
    /// downstream stages observe the gap and continue.
    pub context: HashMap<AgentType, Option<AgentResult>>,
    pub errors: Vec<StageError>,
}

impl PipelineRun {
    pub fn new(run_id: RunId, paper_id: PaperId, user_id: UserId, config: PipelineConfig) -> Self {
        Self {
            run_id,
            paper_id,
            user_id,
            status: RunStatus::Pending,
            progress_percent: 0,
            current_stage: None,
            started_at: None,
            completed_at: None,
            configuration: config,
            context: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Progress never decreases within a run.
    pub fn advance_progress(&mut self, percent: u8) {
        if percent > self.progress_percent {
            self.progress_percent = percent.min(100);
        }
    }
}

/// Snapshot returned by the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub progress_percent: u8,
    pub current_stage: Option<AgentType>,
    pub errors: Vec<StageError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&RunStatus::PendingCredits).unwrap(),
            "\"PENDING_CREDITS\""
        );
    }

    #[test]
    fn progress_is_monotonic() {
        let mut run = PipelineRun::new(
            RunId::new(),
            PaperId::from("paper-1"),
            UserId::from("user-1"),
            PipelineConfig::default(),
        );
        run.advance_progress(45);
        run.advance_progress(15);
        assert_eq!(run.progress_percent, 45);
        run.advance_progress(100);
        assert_eq!(run.progress_percent, 100);
    }

    #[test]
    fn disabled_stage_toggles() {
        let mut config = PipelineConfig::default();
        assert!(config.is_enabled(AgentType::MetadataEnhancer));
        config.disabled_stages.insert(AgentType::MetadataEnhancer);
        assert!(!config.is_enabled(AgentType::MetadataEnhancer));
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::PendingCredits.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Initializing.is_terminal());
    }
}
