//! Runtime event types published on the event bus

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AgentType, RunId, TaskId, UserId};

/// All event kinds emitted by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    PipelineStarted,
    PipelineStageStarted,
    PipelineStageCompleted,
    PipelineStageFailed,
    PipelineCompleted,
    PipelineFailed,
    PipelineCancelled,
    CircuitOpened,
    CircuitHalfOpen,
    CircuitClosed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "TASK_CREATED",
            EventType::TaskStarted => "TASK_STARTED",
            EventType::TaskCompleted => "TASK_COMPLETED",
            EventType::TaskFailed => "TASK_FAILED",
            EventType::TaskTimeout => "TASK_TIMEOUT",
            EventType::PipelineStarted => "PIPELINE_STARTED",
            EventType::PipelineStageStarted => "PIPELINE_STAGE_STARTED",
            EventType::PipelineStageCompleted => "PIPELINE_STAGE_COMPLETED",
            EventType::PipelineStageFailed => "PIPELINE_STAGE_FAILED",
            EventType::PipelineCompleted => "PIPELINE_COMPLETED",
            EventType::PipelineFailed => "PIPELINE_FAILED",
            EventType::PipelineCancelled => "PIPELINE_CANCELLED",
            EventType::CircuitOpened => "CIRCUIT_OPENED",
            EventType::CircuitHalfOpen => "CIRCUIT_HALF_OPEN",
            EventType::CircuitClosed => "CIRCUIT_CLOSED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope carried by every published event: type, UTC millisecond
/// timestamp, correlation ids, and a free-form detail map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub timestamp_ms: i64,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
    pub user_id: Option<UserId>,
    pub agent: Option<AgentType>,
    pub detail: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp_ms: Utc::now().timestamp_millis(),
            run_id: None,
            task_id: None,
            user_id: None,
            agent: None,
            detail: Map::new(),
        }
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_agent(mut self, agent: AgentType) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::TaskTimeout.as_str(), "TASK_TIMEOUT");
        assert_eq!(
            EventType::PipelineStageCompleted.as_str(),
            "PIPELINE_STAGE_COMPLETED"
        );
        assert_eq!(EventType::CircuitHalfOpen.as_str(), "CIRCUIT_HALF_OPEN");
    }

    #[test]
    fn envelope_builder_sets_correlation_ids() {
        let run_id = RunId::new();
        let event = EventEnvelope::new(EventType::PipelineStarted)
            .with_run(run_id)
            .with_user(UserId::from("u1"))
            .with_detail("stage_count", 9);
        assert_eq!(event.run_id, Some(run_id));
        assert_eq!(event.detail["stage_count"], 9);
        assert!(event.timestamp_ms > 0);
    }
}
