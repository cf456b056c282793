//! Storage contracts and in-memory implementations
//!
//! The runtime only depends on these traits; the schema behind them is an
//! integration concern. The in-memory implementations back tests and
//! single-process deployments, and define the reference semantics every
//! backend must preserve (per-key atomic updates, append-only ledgers).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::types::{
    AgentTask, AgentTaskStatus, CreditBalance, CreditError, CreditTransaction, PipelineRun, RunId,
    TaskError, TaskId, TokenMetricsRecord, UserId,
};

/// Closure applied atomically to one task row.
pub type TaskMutation = Box<dyn FnOnce(&mut AgentTask) -> Result<(), TaskError> + Send>;

/// Closure applied atomically to one run row.
pub type RunMutation = Box<dyn FnOnce(&mut PipelineRun) + Send>;

/// Durable agent-task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: AgentTask) -> Result<(), TaskError>;
    async fn get(&self, task_id: &TaskId) -> Result<Option<AgentTask>, TaskError>;
    /// Apply `mutate` to the row under the store's per-task lock and return
    /// the updated row. The closure's error aborts the update.
    async fn update(&self, task_id: &TaskId, mutate: TaskMutation) -> Result<AgentTask, TaskError>;
    /// Tasks in `processing` whose `started_at` is strictly before `cutoff`.
    async fn processing_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskError>;
    /// Delete terminal tasks completed strictly before `cutoff`; returns the
    /// number removed.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, TaskError>;
    async fn count_by_status(&self) -> Result<HashMap<AgentTaskStatus, usize>, TaskError>;
}

/// In-memory task store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, AgentTask>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: AgentTask) -> Result<(), TaskError> {
        self.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<AgentTask>, TaskError> {
        Ok(self.tasks.get(task_id).map(|entry| entry.clone()))
    }

    async fn update(&self, task_id: &TaskId, mutate: TaskMutation) -> Result<AgentTask, TaskError> {
        let mut entry = self.tasks.get_mut(task_id).ok_or(TaskError::NotFound {
            task_id: task_id.clone(),
        })?;
        mutate(entry.value_mut())?;
        Ok(entry.clone())
    }

    async fn processing_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskError> {
        Ok(self
            .tasks
            .iter()
            .filter(|entry| {
                entry.status == AgentTaskStatus::Processing
                    && entry.started_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|entry| entry.task_id.clone())
            .collect())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, TaskError> {
        let doomed: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry.status.is_terminal()
                    && entry.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|entry| entry.task_id.clone())
            .collect();
        let count = doomed.len();
        for task_id in doomed {
            self.tasks.remove(&task_id);
        }
        Ok(count)
    }

    async fn count_by_status(&self) -> Result<HashMap<AgentTaskStatus, usize>, TaskError> {
        let mut counts = HashMap::new();
        for entry in self.tasks.iter() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Durable pipeline-run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, run: PipelineRun);
    async fn get(&self, run_id: RunId) -> Option<PipelineRun>;
    async fn update(&self, run_id: RunId, mutate: RunMutation) -> Option<PipelineRun>;
    async fn list_for_user(&self, user_id: &UserId) -> Vec<PipelineRun>;
}

/// In-memory run store.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: DashMap<RunId, PipelineRun>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: PipelineRun) {
        self.runs.insert(run.run_id, run);
    }

    async fn get(&self, run_id: RunId) -> Option<PipelineRun> {
        self.runs.get(&run_id).map(|entry| entry.clone())
    }

    async fn update(&self, run_id: RunId, mutate: RunMutation) -> Option<PipelineRun> {
        let mut entry = self.runs.get_mut(&run_id)?;
        mutate(entry.value_mut());
        Some(entry.clone())
    }

    async fn list_for_user(&self, user_id: &UserId) -> Vec<PipelineRun> {
        self.runs
            .iter()
            .filter(|entry| &entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect()
    }
}

/// Credit balances plus the append-only transaction ledger.
#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>, CreditError>;
    async fn put_balance(&self, balance: CreditBalance) -> Result<(), CreditError>;
    async fn append_transaction(&self, transaction: CreditTransaction) -> Result<(), CreditError>;
    async fn transactions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<CreditTransaction>, CreditError>;
    /// Whether a refund with this reference id already exists for the user.
    async fn refund_exists(
        &self,
        user_id: &UserId,
        reference_id: &str,
    ) -> Result<bool, CreditError>;
}

/// In-memory credit store.
#[derive(Default)]
pub struct InMemoryCreditStore {
    balances: DashMap<UserId, CreditBalance>,
    ledger: RwLock<Vec<CreditTransaction>>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>, CreditError> {
        Ok(self.balances.get(user_id).map(|entry| entry.clone()))
    }

    async fn put_balance(&self, balance: CreditBalance) -> Result<(), CreditError> {
        self.balances.insert(balance.user_id.clone(), balance);
        Ok(())
    }

    async fn append_transaction(&self, transaction: CreditTransaction) -> Result<(), CreditError> {
        self.ledger.write().push(transaction);
        Ok(())
    }

    async fn transactions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        Ok(self
            .ledger
            .read()
            .iter()
            .filter(|tx| &tx.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn refund_exists(
        &self,
        user_id: &UserId,
        reference_id: &str,
    ) -> Result<bool, CreditError> {
        Ok(self.ledger.read().iter().any(|tx| {
            &tx.user_id == user_id
                && tx.kind == crate::types::TransactionKind::Refund
                && tx.reference_id.as_deref() == Some(reference_id)
        }))
    }
}

/// Persisted token-usage records.
#[async_trait]
pub trait TokenMetricsStore: Send + Sync {
    async fn append(&self, record: TokenMetricsRecord);
    /// Records with `timestamp >= since`, used for startup replay.
    async fn records_since(&self, since: DateTime<Utc>) -> Vec<TokenMetricsRecord>;
    async fn count(&self) -> usize;
}

/// In-memory token metrics store.
#[derive(Default)]
pub struct InMemoryTokenMetricsStore {
    records: RwLock<Vec<TokenMetricsRecord>>,
}

impl InMemoryTokenMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenMetricsStore for InMemoryTokenMetricsStore {
    async fn append(&self, record: TokenMetricsRecord) {
        self.records.write().push(record);
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Vec<TokenMetricsRecord> {
        self.records
            .read()
            .iter()
            .filter(|record| record.timestamp >= since)
            .cloned()
            .collect()
    }

    async fn count(&self) -> usize {
        self.records.read().len()
    }
}
