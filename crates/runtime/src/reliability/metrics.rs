//! Retry statistics per agent
//!
//! Tracks every attempt and outer-operation outcome via atomic counters.
//! `successful_operations` counts operations that end in success regardless
//! of whether they needed a retry, so the overall success rate and the
//! retry success rate are independent figures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::AgentType;

/// Per-agent retry counters.
#[derive(Clone)]
pub struct RetryMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    successful_operations: AtomicU64,
    successful_retries: AtomicU64,
    failed_operations: AtomicU64,
}

impl Default for RetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_attempts: AtomicU64::new(0),
                total_retries: AtomicU64::new(0),
                successful_operations: AtomicU64::new(0),
                successful_retries: AtomicU64::new(0),
                failed_operations: AtomicU64::new(0),
            }),
        }
    }

    /// Record one individual call. `is_retry` is true for every attempt
    /// after the first within an outer operation.
    pub fn record_attempt(&self, is_retry: bool) {
        self.inner.total_attempts.fetch_add(1, Ordering::Relaxed);
        if is_retry {
            self.inner.total_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the final outcome of an outer operation.
    /// Counts first-attempt successes and eventual-retry successes alike.
    pub fn record_operation_success(&self, needed_retry: bool) {
        self.inner
            .successful_operations
            .fetch_add(1, Ordering::Relaxed);
        if needed_retry {
            self.inner
                .successful_retries
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an outer operation whose retries exhausted.
    pub fn record_operation_failure(&self) {
        self.inner.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            total_attempts: self.inner.total_attempts.load(Ordering::Relaxed),
            total_retries: self.inner.total_retries.load(Ordering::Relaxed),
            successful_operations: self.inner.successful_operations.load(Ordering::Relaxed),
            successful_retries: self.inner.successful_retries.load(Ordering::Relaxed),
            failed_operations: self.inner.failed_operations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.inner.total_attempts.store(0, Ordering::Relaxed);
        self.inner.total_retries.store(0, Ordering::Relaxed);
        self.inner.successful_operations.store(0, Ordering::Relaxed);
        self.inner.successful_retries.store(0, Ordering::Relaxed);
        self.inner.failed_operations.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of one agent's retry counters.
#[derive(Debug, Clone, Serialize)]
pub struct RetryMetricsSnapshot {
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successful_operations: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
}

impl RetryMetricsSnapshot {
    /// Successful outer operations over all completed outer operations.
    /// This is the headline figure; it must never be computed from retry
    /// counts alone.
    pub fn overall_success_rate(&self) -> f64 {
        let completed = self.successful_operations + self.failed_operations;
        if completed == 0 {
            0.0
        } else {
            self.successful_operations as f64 / completed as f64
        }
    }

    /// Operations that needed a retry and succeeded, over total retries.
    pub fn retry_success_rate(&self) -> f64 {
        if self.total_retries == 0 {
            0.0
        } else {
            self.successful_retries as f64 / self.total_retries as f64
        }
    }
}

/// Registry of retry metrics, one per agent, process-wide.
#[derive(Default)]
pub struct RetryMetricsRegistry {
    per_agent: RwLock<HashMap<AgentType, RetryMetrics>>,
}

impl RetryMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_agent(&self, agent: AgentType) -> RetryMetrics {
        if let Some(metrics) = self.per_agent.read().get(&agent) {
            return metrics.clone();
        }
        self.per_agent
            .write()
            .entry(agent)
            .or_insert_with(RetryMetrics::new)
            .clone()
    }

    pub fn snapshot_all(&self) -> HashMap<AgentType, RetryMetricsSnapshot> {
        self.per_agent
            .read()
            .iter()
            .map(|(agent, metrics)| (*agent, metrics.snapshot()))
            .collect()
    }

    pub fn reset_all(&self) {
        for metrics in self.per_agent.read().values() {
            metrics.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_success_counts_toward_overall_rate() {
        let metrics = RetryMetrics::new();

        // Six operations succeed on the first attempt.
        for _ in 0..6 {
            metrics.record_attempt(false);
            metrics.record_operation_success(false);
        }
        // Three operations exhaust three retries each and fail.
        for _ in 0..3 {
            metrics.record_attempt(false);
            for _ in 0..3 {
                metrics.record_attempt(true);
            }
            metrics.record_operation_failure();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.successful_operations, 6);
        assert_eq!(snap.failed_operations, 3);
        assert_eq!(snap.total_attempts, 6 + 3 * 4);
        assert_eq!(snap.total_retries, 9);
        assert!((snap.overall_success_rate() - 6.0 / 9.0).abs() < 1e-9);
        assert_eq!(snap.retry_success_rate(), 0.0);
    }

    #[test]
    fn retry_success_feeds_both_rates() {
        let metrics = RetryMetrics::new();

        // One operation succeeds after two retries.
        metrics.record_attempt(false);
        metrics.record_attempt(true);
        metrics.record_attempt(true);
        metrics.record_operation_success(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.successful_operations, 1);
        assert_eq!(snap.successful_retries, 1);
        assert_eq!(snap.total_retries, 2);
        assert!((snap.overall_success_rate() - 1.0).abs() < f64::EPSILON);
        assert!((snap.retry_success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rates_are_zero_with_no_operations() {
        let snap = RetryMetrics::new().snapshot();
        assert_eq!(snap.overall_success_rate(), 0.0);
        assert_eq!(snap.retry_success_rate(), 0.0);
    }

    #[test]
    fn registry_hands_out_shared_counters() {
        let registry = RetryMetricsRegistry::new();
        let a = registry.for_agent(AgentType::ContentSummarizer);
        let b = registry.for_agent(AgentType::ContentSummarizer);
        a.record_attempt(false);
        a.record_operation_success(false);
        assert_eq!(b.snapshot().successful_operations, 1);
        assert_eq!(registry.snapshot_all().len(), 1);
    }

    #[test]
    fn reset_clears_counters() {
        let registry = RetryMetricsRegistry::new();
        let metrics = registry.for_agent(AgentType::QualityChecker);
        metrics.record_attempt(false);
        metrics.record_operation_failure();
        registry.reset_all();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_attempts, 0);
        assert_eq!(snap.failed_operations, 0);
    }
}
