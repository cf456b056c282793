//! Reliability envelope around external agent calls
//!
//! Composes per-agent retry with exponential backoff and jitter, a per-agent
//! circuit breaker, and accurate per-agent retry statistics. Every provider
//! call in the runtime goes through [`RetryPolicy::execute_with_retry`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::types::{AgentType, ProviderError};

pub mod circuit_breaker;
pub mod metrics;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
    CircuitStateKind,
};
pub use metrics::{RetryMetrics, RetryMetricsRegistry, RetryMetricsSnapshot};
pub use rate_limiter::{ProviderRateLimiter, RateLimiterConfig};

/// Backoff ceiling shared by every agent.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Per-agent retry configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            attempt_timeout,
        }
    }
}

/// The startup table of per-agent retry envelopes.
pub fn default_retry_configs() -> HashMap<AgentType, RetryConfig> {
    use AgentType::*;
    let secs = Duration::from_secs;
    let mins = |m: u64| Duration::from_secs(m * 60);
    HashMap::from([
        (PaperProcessor, RetryConfig::new(3, secs(10), mins(5))),
        (ContentSummarizer, RetryConfig::new(4, secs(8), mins(5))),
        (ConceptExplainer, RetryConfig::new(4, secs(5), mins(5))),
        (MetadataEnhancer, RetryConfig::new(4, secs(5), mins(3))),
        (QualityChecker, RetryConfig::new(3, secs(6), mins(5))),
        (CitationFormatter, RetryConfig::new(3, secs(4), mins(3))),
        (CitationVerifier, RetryConfig::new(3, secs(6), mins(3))),
        (PerplexityResearcher, RetryConfig::new(5, secs(15), mins(5))),
        (RelatedPaperDiscovery, RetryConfig::new(4, secs(12), mins(5))),
    ])
}

/// Delay before the retry that follows failed attempt `n` (0-based):
/// `min(initial * 2^n * (1 ± jitter), 30s)` with jitter uniform in [0, 0.5].
pub(crate) fn backoff_delay(initial_delay: Duration, failed_attempt: u32) -> Duration {
    let base = initial_delay
        .as_millis()
        .saturating_mul(1u128 << failed_attempt.min(63)) as f64;
    let jitter: f64 = rand::thread_rng().gen_range(-0.5..=0.5);
    let with_jitter = base * (1.0 + jitter);
    Duration::from_millis(with_jitter as u64).min(MAX_BACKOFF)
}

/// Retry + circuit breaker + statistics around a single agent operation.
pub struct RetryPolicy {
    configs: HashMap<AgentType, RetryConfig>,
    metrics: Arc<RetryMetricsRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RetryPolicy {
    pub fn new(
        configs: HashMap<AgentType, RetryConfig>,
        metrics: Arc<RetryMetricsRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            configs,
            metrics,
            breakers,
        }
    }

    pub fn config(&self, agent: AgentType) -> RetryConfig {
        self.configs.get(&agent).cloned().unwrap_or(RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(5 * 60),
        })
    }

    pub fn metrics(&self) -> &Arc<RetryMetricsRegistry> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `op` under the agent's reliability envelope.
    ///
    /// Returns the first successful value, or the last underlying error once
    /// retries are exhausted. The circuit is consulted once at operation
    /// start: while open the call fails fast with `CircuitOpen` and neither
    /// counters nor breaker move. The breaker itself is fed outer-operation
    /// outcomes, one success or one failure per operation, so a single
    /// many-retry operation cannot trip it alone. The first attempt is
    /// unconditional; each retry waits an exponentially growing, jittered
    /// delay. A schema mismatch is given one retry (transient on first
    /// occurrence), then treated as permanent. Cancellation exits without
    /// feeding the breaker or the failure counters.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        agent: AgentType,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let config = self.config(agent);
        let metrics = self.metrics.for_agent(agent);

        // Fail fast while the circuit rejects calls. Not an attempt, not a
        // fresh failure. In half-open this admits the single probe.
        self.breakers.check(agent)?;

        let mut attempt: u32 = 0;
        loop {
            let is_retry = attempt > 0;
            metrics.record_attempt(is_retry);

            let outcome = match tokio::time::timeout(config.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: agent.provider().to_string(),
                    elapsed: config.attempt_timeout,
                }),
            };

            let error = match outcome {
                Ok(value) => {
                    self.breakers.record_success(agent);
                    metrics.record_operation_success(is_retry);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancellation() {
                return Err(error);
            }

            let schema_first_occurrence =
                matches!(error, ProviderError::Schema { .. }) && attempt == 0;
            let retryable = error.is_retryable() || schema_first_occurrence;

            if !retryable || attempt >= config.max_retries {
                self.breakers.record_failure(agent);
                metrics.record_operation_failure();
                tracing::warn!(
                    agent = %agent,
                    attempts = attempt + 1,
                    error = %error,
                    "operation failed"
                );
                return Err(error);
            }

            let delay = backoff_delay(config.initial_delay, attempt);
            tracing::debug!(
                agent = %agent,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
