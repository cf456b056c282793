//! Runtime configuration
//!
//! One aggregate, serde-loadable from TOML, mapped onto the per-component
//! config structs at wiring time.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::OrchestratorConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::tasks::TaskServiceConfig;
use crate::types::{ConfigError, PipelineConfig};

/// Task-service tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSection {
    #[serde(with = "humantime_serde")]
    pub processing_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for TaskSection {
    fn default() -> Self {
        let defaults = TaskServiceConfig::default();
        Self {
            processing_timeout: defaults.processing_timeout,
            reaper_interval: defaults.reaper_interval,
            cleanup_interval: defaults.cleanup_interval,
            retention: defaults.retention,
        }
    }
}

/// Circuit-breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for CircuitSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            open_duration: defaults.open_duration,
            probe_timeout: defaults.probe_timeout,
        }
    }
}

/// Token-accounting tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSection {
    #[serde(with = "humantime_serde")]
    pub replay_window: Duration,
    #[serde(with = "humantime_serde")]
    pub log_interval: Duration,
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            replay_window: Duration::from_secs(30 * 24 * 60 * 60),
            log_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Aggregate runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub orchestrator: OrchestratorSection,
    pub pipeline: PipelineConfig,
    pub tasks: TaskSection,
    pub circuit: CircuitSection,
    pub tokens: TokenSection,
    /// Concurrent executions allowed per agent worker.
    pub worker_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorSection::default(),
            pipeline: PipelineConfig::default(),
            tasks: TaskSection::default(),
            circuit: CircuitSection::default(),
            tokens: TokenSection::default(),
            worker_concurrency: 4,
        }
    }
}

/// Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    pub max_concurrent_runs: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 8,
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file, with every omitted field defaulted.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        let mut config: RuntimeConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if config.worker_concurrency == 0 {
            config.worker_concurrency = 4;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_runs must be positive".to_string(),
            ));
        }
        if self.pipeline.max_concurrent_agents == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_agents must be positive".to_string(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_runs: self.orchestrator.max_concurrent_runs,
            pipeline_defaults: self.pipeline.clone(),
        }
    }

    pub fn task_service_config(&self) -> TaskServiceConfig {
        TaskServiceConfig {
            processing_timeout: self.tasks.processing_timeout,
            reaper_interval: self.tasks.reaper_interval,
            cleanup_interval: self.tasks.cleanup_interval,
            retention: self.tasks.retention,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit.failure_threshold,
            open_duration: self.circuit.open_duration,
            probe_timeout: self.circuit.probe_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.orchestrator.max_concurrent_runs, 8);
        assert_eq!(config.pipeline.credit_cost, 30);
        assert_eq!(config.circuit.failure_threshold, 3);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "worker_concurrency = 2\n[orchestrator]\nmax_concurrent_runs = 3\n[circuit]\nfailure_threshold = 5\nopen_duration = \"2m\"\nprobe_timeout = \"45s\"\n"
        )
        .unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.orchestrator.max_concurrent_runs, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.open_duration, Duration::from_secs(120));
        // Untouched sections keep defaults.
        assert_eq!(config.pipeline.credit_cost, 30);
        assert_eq!(
            config.tasks.processing_timeout,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let result = RuntimeConfig::load("/nonexistent/paperflow.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = RuntimeConfig::default();
        config.orchestrator.max_concurrent_runs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
