//! Error types for the pipeline runtime

use std::time::Duration;
use thiserror::Error;

use super::{AgentType, RunId, TaskId, UserId};

/// Main runtime error type
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Credit error: {0}")]
    Credit(#[from] CreditError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors surfaced by external provider calls and the reliability envelope.
///
/// Classification into retryable / non-retryable matches on the variant plus
/// the carried message, never on concrete transport exception types.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Request to {provider} timed out after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    #[error("Connection to {provider} failed: {message}")]
    ConnectionFailed { provider: String, message: String },

    #[error("HTTP {status} from {provider}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("I/O error talking to {provider}: {message}")]
    Io { provider: String, message: String },

    #[error("Unexpected response shape from {provider}: {message}")]
    Schema { provider: String, message: String },

    #[error("Circuit open for agent {agent}: retry in {retry_in:?}")]
    CircuitOpen { agent: AgentType, retry_in: Duration },

    #[error("Required input missing: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the reliability envelope may retry this failure.
    ///
    /// Retryable: timeouts, connection refused/reset, HTTP 429, HTTP 5xx,
    /// "overloaded" responses, and generic I/O errors. Auth failures
    /// (401/403), other 4xx, schema mismatches, circuit-open short circuits
    /// and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } => true,
            ProviderError::ConnectionFailed { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("refused")
                    || m.contains("reset")
                    || m.contains("timed out")
                    || m.contains("timeout")
                    || m.contains("broken pipe")
                    || m.contains("unreachable")
            }
            ProviderError::Http {
                status, message, ..
            } => {
                *status == 429
                    || (500..600).contains(&(*status as u32))
                    || message.to_ascii_lowercase().contains("overloaded")
            }
            ProviderError::Io { .. } => true,
            ProviderError::Schema { .. } => false,
            ProviderError::CircuitOpen { .. } => false,
            ProviderError::InvalidInput(_) => false,
            ProviderError::Cancelled => false,
        }
    }

    /// Cancellation must not feed failure statistics or the breaker.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

/// Agent task lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Task not found: {task_id}")]
    NotFound { task_id: TaskId },

    #[error("Illegal task transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: String,
        to: String,
    },

    #[error("Task store failure: {0}")]
    Storage(String),

    #[error("Task service is shutting down")]
    ShuttingDown,
}

/// Pipeline orchestration errors
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Insufficient credits for user {user_id}: required {required}, available {available}")]
    InsufficientCredits {
        user_id: UserId,
        required: u64,
        available: u64,
    },

    #[error("Stage {stage} is missing required input '{field}'")]
    MissingInput { stage: AgentType, field: String },

    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: AgentType, message: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    #[error("Run {run_id} exceeded the {timeout:?} run timeout")]
    RunTimeout { run_id: RunId, timeout: Duration },

    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: RunId },

    #[error("Concurrent pipeline limit reached ({limit})")]
    ConcurrencyLimit { limit: usize },

    #[error("Orchestrator is draining, refusing new runs")]
    ShuttingDown,
}

/// Credit accounting errors
#[derive(Error, Debug, Clone)]
pub enum CreditError {
    #[error("No credit balance for user: {user_id}")]
    UnknownUser { user_id: UserId },

    #[error("Insufficient credits for user {user_id}: required {required}, available {available}")]
    Insufficient {
        user_id: UserId,
        required: u64,
        available: u64,
    },

    #[error("Credit store failure: {0}")]
    Storage(String),
}

/// Result alias used across the runtime
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, message: &str) -> ProviderError {
        ProviderError::Http {
            provider: "llm".into(),
            status,
            message: message.into(),
        }
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(http(429, "too many requests").is_retryable());
        assert!(http(500, "internal").is_retryable());
        assert!(http(503, "unavailable").is_retryable());
    }

    #[test]
    fn auth_and_client_errors_are_not_retryable() {
        assert!(!http(401, "unauthorized").is_retryable());
        assert!(!http(403, "forbidden").is_retryable());
        assert!(!http(404, "not found").is_retryable());
        assert!(!http(422, "unprocessable").is_retryable());
    }

    #[test]
    fn overloaded_message_is_retryable_regardless_of_status() {
        assert!(http(400, "model overloaded, try again").is_retryable());
    }

    #[test]
    fn connection_reset_is_retryable() {
        let err = ProviderError::ConnectionFailed {
            provider: "crossref".into(),
            message: "connection reset by peer".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn schema_cancel_and_circuit_open_are_not_retryable() {
        let schema = ProviderError::Schema {
            provider: "llm".into(),
            message: "missing field".into(),
        };
        assert!(!schema.is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
        let open = ProviderError::CircuitOpen {
            agent: AgentType::PaperProcessor,
            retry_in: Duration::from_secs(10),
        };
        assert!(!open.is_retryable());
    }

    #[test]
    fn cancellation_is_flagged() {
        assert!(ProviderError::Cancelled.is_cancellation());
        assert!(!http(500, "x").is_cancellation());
    }
}
