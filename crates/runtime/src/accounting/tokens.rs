//! Token usage accounting
//!
//! One persisted record per external provider call, aggregated into four
//! in-memory running totals: per provider, per agent, per user, and global.
//! Totals are volatile and rebuilt on startup by replaying the last 30 days
//! of persisted records. A background task logs the global aggregate
//! periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::store::TokenMetricsStore;
use crate::types::{AgentType, ProviderKind, TaskId, TokenMetricsRecord, UserId};

const COST_MICROS: f64 = 1_000_000.0;

/// Lock-free accumulator for one aggregation key.
#[derive(Default)]
pub struct RunningTotal {
    calls: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_micros: AtomicU64,
}

impl RunningTotal {
    fn apply(&self, record: &TokenMetricsRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !record.success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.input_tokens
            .fetch_add(record.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(record.output_tokens, Ordering::Relaxed);
        self.cost_micros.fetch_add(
            (record.estimated_cost * COST_MICROS) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        UsageSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost: self.cost_micros.load(Ordering::Relaxed) as f64 / COST_MICROS,
        }
    }
}

/// Point-in-time aggregate for one key.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageSnapshot {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct TokenRecorderConfig {
    /// How far back to replay persisted records on startup.
    pub replay_window: Duration,
    /// Cadence of the aggregate usage log line.
    pub log_interval: Duration,
}

impl Default for TokenRecorderConfig {
    fn default() -> Self {
        Self {
            replay_window: Duration::from_secs(30 * 24 * 60 * 60),
            log_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Token usage recorder with running totals.
pub struct TokenUsageRecorder {
    config: TokenRecorderConfig,
    store: Arc<dyn TokenMetricsStore>,
    per_provider: DashMap<ProviderKind, Arc<RunningTotal>>,
    per_agent: DashMap<AgentType, Arc<RunningTotal>>,
    per_user: DashMap<UserId, Arc<RunningTotal>>,
    global: Arc<RunningTotal>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl TokenUsageRecorder {
    pub fn new(config: TokenRecorderConfig, store: Arc<dyn TokenMetricsStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            per_provider: DashMap::new(),
            per_agent: DashMap::new(),
            per_user: DashMap::new(),
            global: Arc::new(RunningTotal::default()),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
        })
    }

    /// Rebuild running totals from persisted records inside the replay
    /// window. Call once at startup, before accepting traffic.
    pub async fn replay_recent(&self) -> usize {
        let since = Utc::now()
            - ChronoDuration::from_std(self.config.replay_window)
                .unwrap_or_else(|_| ChronoDuration::days(30));
        let records = self.store.records_since(since).await;
        let count = records.len();
        for record in &records {
            self.aggregate(record);
        }
        tracing::info!(replayed = count, "token usage totals rebuilt");
        count
    }

    fn aggregate(&self, record: &TokenMetricsRecord) {
        self.per_provider
            .entry(record.provider)
            .or_default()
            .apply(record);
        self.per_agent.entry(record.agent).or_default().apply(record);
        self.per_user
            .entry(record.user_id.clone())
            .or_default()
            .apply(record);
        self.global.apply(record);
    }

    /// Persist one provider-call record and fold it into the running totals.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        user_id: UserId,
        provider: ProviderKind,
        agent: AgentType,
        task_id: TaskId,
        input_tokens: u64,
        output_tokens: u64,
        estimated_cost: f64,
        processing_time_ms: u64,
        success: bool,
    ) -> TokenMetricsRecord {
        let record = TokenMetricsRecord::new(
            user_id,
            provider,
            agent,
            task_id,
            input_tokens,
            output_tokens,
            estimated_cost,
            processing_time_ms,
            success,
        );
        self.store.append(record.clone()).await;
        self.aggregate(&record);
        record
    }

    pub fn global_usage(&self) -> UsageSnapshot {
        self.global.snapshot()
    }

    pub fn provider_usage(&self, provider: ProviderKind) -> Option<UsageSnapshot> {
        self.per_provider.get(&provider).map(|t| t.snapshot())
    }

    pub fn agent_usage(&self, agent: AgentType) -> Option<UsageSnapshot> {
        self.per_agent.get(&agent).map(|t| t.snapshot())
    }

    pub fn user_usage(&self, user_id: &UserId) -> Option<UsageSnapshot> {
        self.per_user.get(user_id).map(|t| t.snapshot())
    }

    /// Launch the periodic aggregate log task.
    pub fn start_background_workers(self: &Arc<Self>) {
        let recorder = self.clone();
        let shutdown_notify = self.shutdown_notify.clone();
        let is_running = self.is_running.clone();
        let log_interval = self.config.log_interval;

        tokio::spawn(async move {
            let mut interval = interval(log_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !*is_running.read() {
                            break;
                        }
                        let usage = recorder.global_usage();
                        tracing::info!(
                            calls = usage.calls,
                            failed_calls = usage.failed_calls,
                            total_tokens = usage.total_tokens,
                            estimated_cost = usage.estimated_cost,
                            "aggregate token usage"
                        );
                    }
                    _ = shutdown_notify.notified() => {
                        break;
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTokenMetricsStore;

    fn recorder() -> (Arc<TokenUsageRecorder>, Arc<InMemoryTokenMetricsStore>) {
        let store = Arc::new(InMemoryTokenMetricsStore::new());
        (
            TokenUsageRecorder::new(TokenRecorderConfig::default(), store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn record_updates_all_four_totals() {
        let (recorder, store) = recorder();
        let user = UserId::from("u1");

        recorder
            .record(
                user.clone(),
                ProviderKind::Llm,
                AgentType::ContentSummarizer,
                TaskId::new(),
                100,
                40,
                0.002,
                900,
                true,
            )
            .await;
        recorder
            .record(
                user.clone(),
                ProviderKind::SemanticScholar,
                AgentType::CitationVerifier,
                TaskId::new(),
                10,
                5,
                0.0,
                120,
                false,
            )
            .await;

        assert_eq!(store.count().await, 2);

        let global = recorder.global_usage();
        assert_eq!(global.calls, 2);
        assert_eq!(global.failed_calls, 1);
        assert_eq!(global.total_tokens, 155);

        let llm = recorder.provider_usage(ProviderKind::Llm).unwrap();
        assert_eq!(llm.calls, 1);
        assert_eq!(llm.total_tokens, 140);

        let summarizer = recorder
            .agent_usage(AgentType::ContentSummarizer)
            .unwrap();
        assert_eq!(summarizer.input_tokens, 100);

        let mine = recorder.user_usage(&user).unwrap();
        assert_eq!(mine.calls, 2);
    }

    #[tokio::test]
    async fn replay_rebuilds_totals_within_window() {
        let store = Arc::new(InMemoryTokenMetricsStore::new());

        let mut recent = TokenMetricsRecord::new(
            UserId::from("u1"),
            ProviderKind::Llm,
            AgentType::PaperProcessor,
            TaskId::new(),
            50,
            50,
            0.001,
            300,
            true,
        );
        recent.timestamp = Utc::now() - ChronoDuration::days(5);
        store.append(recent).await;

        let mut ancient = TokenMetricsRecord::new(
            UserId::from("u1"),
            ProviderKind::Llm,
            AgentType::PaperProcessor,
            TaskId::new(),
            500,
            500,
            0.01,
            300,
            true,
        );
        ancient.timestamp = Utc::now() - ChronoDuration::days(45);
        store.append(ancient).await;

        let recorder = TokenUsageRecorder::new(TokenRecorderConfig::default(), store);
        let replayed = recorder.replay_recent().await;
        assert_eq!(replayed, 1);
        assert_eq!(recorder.global_usage().total_tokens, 100);
    }

    #[tokio::test]
    async fn unknown_keys_have_no_snapshot() {
        let (recorder, _) = recorder();
        assert!(recorder.provider_usage(ProviderKind::Arxiv).is_none());
        assert!(recorder.agent_usage(AgentType::ConceptExplainer).is_none());
        assert!(recorder.user_usage(&UserId::from("nobody")).is_none());
        assert_eq!(recorder.global_usage().calls, 0);
    }

    #[tokio::test]
    async fn cost_accumulates_with_micro_precision() {
        let (recorder, _) = recorder();
        for _ in 0..3 {
            recorder
                .record(
                    UserId::from("u1"),
                    ProviderKind::Perplexity,
                    AgentType::PerplexityResearcher,
                    TaskId::new(),
                    1,
                    1,
                    0.000125,
                    10,
                    true,
                )
                .await;
        }
        let usage = recorder.provider_usage(ProviderKind::Perplexity).unwrap();
        assert!((usage.estimated_cost - 0.000375).abs() < 1e-9);
    }
}
