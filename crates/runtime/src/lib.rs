//! Paperflow pipeline runtime
//!
//! The core orchestration layer for multi-agent research-paper processing:
//! a pipeline orchestrator, a reliability envelope around every external
//! agent call, a durable agent-task lifecycle service, and credit/token
//! accounting.

use std::collections::HashMap;
use std::sync::Arc;

pub mod accounting;
pub mod agents;
pub mod config;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod providers;
pub mod reliability;
pub mod store;
pub mod tasks;
pub mod types;

// Re-export commonly used types
pub use accounting::{CreditCostTable, CreditService, TokenRecorderConfig, TokenUsageRecorder};
pub use agents::{AgentRegistry, AgentWorker, AgentWorkerConfig};
pub use config::RuntimeConfig;
pub use events::{EventBus, EventBusConfig};
pub use orchestrator::{
    OrchestratorConfig, PipelineOrchestrator, ProgressCallback, StartRun,
};
pub use providers::{ProviderClient, ProviderRequest, ProviderResponse};
pub use reliability::{
    default_retry_configs, CircuitBreakerConfig, CircuitBreakerRegistry, ProviderRateLimiter,
    RateLimiterConfig, RetryConfig, RetryMetricsRegistry, RetryPolicy,
};
pub use store::{
    CreditStore, InMemoryCreditStore, InMemoryRunStore, InMemoryTaskStore,
    InMemoryTokenMetricsStore, RunStore, TaskStore, TokenMetricsStore,
};
pub use tasks::{AgentTaskService, TaskServiceConfig};
pub use types::*;

use serde::Serialize;

/// Storage backends behind the runtime.
pub struct RuntimeStores {
    pub tasks: Arc<dyn TaskStore>,
    pub runs: Arc<dyn RunStore>,
    pub credits: Arc<dyn CreditStore>,
    pub tokens: Arc<dyn TokenMetricsStore>,
}

impl RuntimeStores {
    /// All-in-memory stores for tests and single-process deployments.
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
            credits: Arc::new(InMemoryCreditStore::new()),
            tokens: Arc::new(InMemoryTokenMetricsStore::new()),
        }
    }
}

/// The assembled pipeline runtime.
#[derive(Clone)]
pub struct PipelineRuntime {
    pub event_bus: Arc<EventBus>,
    pub tasks: Arc<AgentTaskService>,
    pub credits: Arc<CreditService>,
    pub tokens: Arc<TokenUsageRecorder>,
    pub retry_policy: Arc<RetryPolicy>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl PipelineRuntime {
    /// Wire every component against in-memory stores.
    pub async fn new(
        config: RuntimeConfig,
        providers: HashMap<AgentType, Arc<dyn ProviderClient>>,
    ) -> Self {
        Self::with_stores(config, providers, RuntimeStores::in_memory()).await
    }

    /// Wire every component against the supplied stores, replay token
    /// totals, and launch the background workers.
    pub async fn with_stores(
        config: RuntimeConfig,
        providers: HashMap<AgentType, Arc<dyn ProviderClient>>,
        stores: RuntimeStores,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());

        let tasks = AgentTaskService::new(
            config.task_service_config(),
            stores.tasks.clone(),
            event_bus.clone(),
        );
        tasks.start_background_workers();

        let tokens = TokenUsageRecorder::new(
            TokenRecorderConfig {
                replay_window: config.tokens.replay_window,
                log_interval: config.tokens.log_interval,
            },
            stores.tokens.clone(),
        );
        tokens.replay_recent().await;
        tokens.start_background_workers();

        let credits = Arc::new(CreditService::new(
            stores.credits.clone(),
            CreditCostTable::default(),
        ));

        let retry_policy = Arc::new(RetryPolicy::new(
            default_retry_configs(),
            Arc::new(RetryMetricsRegistry::new()),
            Arc::new(CircuitBreakerRegistry::new(
                config.circuit_breaker_config(),
                event_bus.clone(),
            )),
        ));

        let registry = Arc::new(AgentRegistry::build(
            AgentWorkerConfig {
                concurrency: config.worker_concurrency.max(1),
            },
            providers,
            retry_policy.clone(),
            Arc::new(ProviderRateLimiter::default()),
            tasks.clone(),
            tokens.clone(),
        ));

        let orchestrator = PipelineOrchestrator::new(
            config.orchestrator_config(),
            registry,
            tasks.clone(),
            credits.clone(),
            stores.runs.clone(),
            event_bus.clone(),
        );

        Self {
            event_bus,
            tasks,
            credits,
            tokens,
            retry_policy,
            orchestrator,
        }
    }

    /// Snapshot of the reliability and accounting counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            retry: self
                .retry_policy
                .metrics()
                .snapshot_all()
                .into_iter()
                .map(|(agent, snapshot)| {
                    let overall_success_rate = snapshot.overall_success_rate();
                    let retry_success_rate = snapshot.retry_success_rate();
                    (
                        agent.as_str().to_string(),
                        AgentStats {
                            snapshot,
                            overall_success_rate,
                            retry_success_rate,
                        },
                    )
                })
                .collect(),
            circuits: self
                .retry_policy
                .breakers()
                .snapshot_all()
                .into_iter()
                .map(|(agent, snapshot)| (agent.as_str().to_string(), snapshot))
                .collect(),
            token_usage: self.tokens.global_usage(),
            processed_papers: self.tasks.processed_paper_count(),
            active_runs: self.orchestrator.active_run_count(),
            recent_events: self.event_bus.recent().len(),
        }
    }

    /// Reset the retry counters (admin surface).
    pub fn reset_stats(&self) {
        self.retry_policy.metrics().reset_all();
    }

    /// Drain: refuse new runs, finish in-flight ones, stop workers.
    pub async fn shutdown(&self) {
        self.orchestrator.drain().await;
        self.tasks.shutdown();
        self.tokens.shutdown();
        tracing::info!("pipeline runtime drained");
    }
}

/// Aggregated counters for the admin surface.
#[derive(Debug, Serialize)]
pub struct RuntimeStats {
    pub retry: HashMap<String, AgentStats>,
    pub circuits: HashMap<String, reliability::CircuitSnapshot>,
    pub token_usage: accounting::UsageSnapshot,
    pub processed_papers: usize,
    pub active_runs: usize,
    pub recent_events: usize,
}

/// Per-agent retry counters with the derived rates.
#[derive(Debug, Serialize)]
pub struct AgentStats {
    #[serde(flatten)]
    pub snapshot: reliability::RetryMetricsSnapshot,
    pub overall_success_rate: f64,
    pub retry_success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runtime_wires_with_no_providers() {
        let runtime = PipelineRuntime::new(RuntimeConfig::default(), HashMap::new()).await;
        let stats = runtime.stats();
        assert_eq!(stats.active_runs, 0);
        assert_eq!(stats.processed_papers, 0);
        assert_eq!(stats.token_usage.calls, 0);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn stats_serialize_to_json() {
        let runtime = PipelineRuntime::new(RuntimeConfig::default(), HashMap::new()).await;
        runtime
            .retry_policy
            .metrics()
            .for_agent(AgentType::PaperProcessor)
            .record_attempt(false);
        let json = serde_json::to_value(runtime.stats()).unwrap();
        assert!(json["retry"]["PAPER_PROCESSOR"]["total_attempts"].is_u64());
        runtime.shutdown().await;
    }
}
