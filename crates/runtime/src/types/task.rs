//! Agent task and result types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentType, TaskId, UserId};

/// Lifecycle status of one agent invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AgentTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentTaskStatus::Completed | AgentTaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTaskStatus::Pending => "pending",
            AgentTaskStatus::Processing => "processing",
            AgentTaskStatus::Completed => "completed",
            AgentTaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: TaskId,
    pub agent: AgentType,
    pub user_id: UserId,
    pub input: Value,
    pub status: AgentTaskStatus,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(task_id: TaskId, agent: AgentType, user_id: UserId, input: Value) -> Self {
        Self {
            task_id,
            agent,
            user_id,
            input,
            status: AgentTaskStatus::Pending,
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome of one agent invocation, kept in memory and serialized into
/// `AgentTask::result` on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub task_id: TaskId,
    pub success: bool,
    pub data: Option<ResultData>,
    pub error_message: Option<String>,
    #[serde(with = "humantime_serde")]
    pub processing_time: Duration,
}

impl AgentResult {
    pub fn success(task_id: TaskId, data: ResultData, processing_time: Duration) -> Self {
        Self {
            task_id,
            success: true,
            data: Some(data),
            error_message: None,
            processing_time,
        }
    }

    pub fn failure(
        task_id: TaskId,
        error_message: impl Into<String>,
        processing_time: Duration,
    ) -> Self {
        Self {
            task_id,
            success: false,
            data: None,
            error_message: Some(error_message.into()),
            processing_time,
        }
    }

    /// Whether the payload is a degraded best-effort conversion of a
    /// malformed provider response.
    pub fn is_degraded(&self) -> bool {
        matches!(self.data, Some(ResultData::Degraded { .. }))
    }
}

/// One explained concept from the concept explainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptExplanation {
    pub term: String,
    pub explanation: String,
    #[serde(default)]
    pub field: Option<String>,
}

/// A single quality finding from the quality checker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityFinding {
    pub category: String,
    pub score: f64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Typed per-agent result payload.
///
/// `Degraded` carries the raw key/value map of a response that could not be
/// parsed into the expected shape but was salvageable enough to keep the
/// pipeline moving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultData {
    ExtractedText {
        text: String,
        #[serde(default)]
        page_count: Option<u32>,
    },
    Metadata {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        authors: Vec<String>,
        #[serde(default)]
        doi: Option<String>,
        #[serde(default)]
        journal: Option<String>,
        #[serde(default)]
        year: Option<i32>,
    },
    Summary {
        brief: String,
        #[serde(default)]
        standard: Option<String>,
        #[serde(default)]
        detailed: Option<String>,
    },
    Concepts {
        explanations: Vec<ConceptExplanation>,
    },
    Quality {
        overall_score: f64,
        #[serde(default)]
        findings: Vec<QualityFinding>,
    },
    Citations {
        style: String,
        formatted: Vec<String>,
    },
    CitationVerification {
        verified: u32,
        unverified: u32,
        #[serde(default)]
        details: Value,
    },
    Research {
        findings: String,
        #[serde(default)]
        sources: Vec<String>,
    },
    RelatedPapers {
        papers: Value,
    },
    Degraded {
        raw: serde_json::Map<String, Value>,
    },
}

impl ResultData {
    /// Pull the first non-empty string out of this payload under any of the
    /// candidate keys, in priority order. Tolerates schema drift between
    /// agents by probing the serialized form.
    pub fn project_string(&self, candidate_keys: &[&str]) -> Option<String> {
        let value = serde_json::to_value(self).ok()?;
        project_first_string(&value, candidate_keys)
    }
}

/// Look up `candidate_keys` in priority order on a JSON object and return the
/// first non-empty string found.
pub fn project_first_string(value: &Value, candidate_keys: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for key in candidate_keys {
        if let Some(found) = object.get(*key).and_then(Value::as_str) {
            if !found.trim().is_empty() {
                return Some(found.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_terminality() {
        assert!(!AgentTaskStatus::Pending.is_terminal());
        assert!(!AgentTaskStatus::Processing.is_terminal());
        assert!(AgentTaskStatus::Completed.is_terminal());
        assert!(AgentTaskStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentTaskStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn result_data_round_trips_with_tag() {
        let data = ResultData::Summary {
            brief: "short".into(),
            standard: None,
            detailed: Some("long".into()),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["kind"], "summary");
        let back: ResultData = serde_json::from_value(value).unwrap();
        assert!(matches!(back, ResultData::Summary { .. }));
    }

    #[test]
    fn projection_returns_first_non_empty_candidate() {
        let value = json!({
            "textContent": "",
            "extractedText": "the paper body",
            "content": "ignored",
        });
        let projected =
            project_first_string(&value, &["textContent", "extractedText", "content", "text"]);
        assert_eq!(projected.as_deref(), Some("the paper body"));
    }

    #[test]
    fn projection_on_missing_keys_is_none() {
        let value = json!({"other": 3});
        assert!(project_first_string(&value, &["text"]).is_none());
    }

    #[test]
    fn degraded_result_is_flagged() {
        let mut raw = serde_json::Map::new();
        raw.insert("summary".into(), json!("loose text"));
        let result = AgentResult::success(
            TaskId::new(),
            ResultData::Degraded { raw },
            Duration::from_millis(10),
        );
        assert!(result.is_degraded());
        assert!(result.success);
    }
}
