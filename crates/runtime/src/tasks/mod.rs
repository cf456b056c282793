//! Agent task lifecycle service
//!
//! Durable record of every agent invocation with a strict state machine:
//! `pending → processing → completed | failed`. Every transition emits
//! exactly one event. Background workers time out stuck tasks and delete
//! old terminal ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::events::EventBus;
use crate::store::TaskStore;
use crate::types::{
    AgentTask, AgentTaskStatus, AgentType, EventEnvelope, EventType, PaperId, TaskError, TaskId,
    UserId,
};

/// Task service configuration
#[derive(Debug, Clone)]
pub struct TaskServiceConfig {
    /// How long a task may sit in `processing` before the reaper times it out.
    pub processing_timeout: Duration,
    /// Reaper sweep cadence.
    pub reaper_interval: Duration,
    /// Cleanup sweep cadence.
    pub cleanup_interval: Duration,
    /// Terminal tasks older than this are deleted by cleanup.
    pub retention: Duration,
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(5 * 60),
            reaper_interval: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Agent task lifecycle service
pub struct AgentTaskService {
    config: TaskServiceConfig,
    store: Arc<dyn TaskStore>,
    event_bus: Arc<EventBus>,
    processed_papers: Mutex<HashSet<PaperId>>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl AgentTaskService {
    pub fn new(
        config: TaskServiceConfig,
        store: Arc<dyn TaskStore>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            event_bus,
            processed_papers: Mutex::new(HashSet::new()),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
        })
    }

    /// Launch the reaper and cleanup loops. Call once after construction.
    pub fn start_background_workers(self: &Arc<Self>) {
        self.clone().spawn_reaper_loop();
        self.clone().spawn_cleanup_loop();
    }

    fn emit(&self, event_type: EventType, task: &AgentTask) {
        let snapshot = serde_json::to_value(task).unwrap_or(Value::Null);
        self.event_bus.publish(
            EventEnvelope::new(event_type)
                .with_task(task.task_id.clone())
                .with_user(task.user_id.clone())
                .with_agent(task.agent)
                .with_detail("status", task.status.as_str())
                .with_detail("task", snapshot),
        );
    }

    /// Insert a new task in `pending` and emit `TASK_CREATED`.
    pub async fn create_task(
        &self,
        task_id: TaskId,
        agent: AgentType,
        user_id: UserId,
        input: Value,
    ) -> Result<AgentTask, TaskError> {
        if !*self.is_running.read() {
            return Err(TaskError::ShuttingDown);
        }
        let task = AgentTask::new(task_id, agent, user_id, input);
        self.store.insert(task.clone()).await?;
        self.emit(EventType::TaskCreated, &task);
        Ok(task)
    }

    /// `pending → processing`, stamping `started_at`.
    pub async fn start_task(&self, task_id: &TaskId) -> Result<AgentTask, TaskError> {
        let id = task_id.clone();
        let task = self
            .store
            .update(
                task_id,
                Box::new(move |task| {
                    if task.status != AgentTaskStatus::Pending {
                        return Err(TaskError::IllegalTransition {
                            task_id: id,
                            from: task.status.to_string(),
                            to: AgentTaskStatus::Processing.to_string(),
                        });
                    }
                    task.status = AgentTaskStatus::Processing;
                    task.started_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await
            .map_err(|error| self.log_rejection(error))?;
        self.emit(EventType::TaskStarted, &task);
        Ok(task)
    }

    /// `processing → completed` with the result payload attached.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        result: Value,
    ) -> Result<AgentTask, TaskError> {
        let id = task_id.clone();
        let task = self
            .store
            .update(
                task_id,
                Box::new(move |task| {
                    if task.status != AgentTaskStatus::Processing {
                        return Err(TaskError::IllegalTransition {
                            task_id: id,
                            from: task.status.to_string(),
                            to: AgentTaskStatus::Completed.to_string(),
                        });
                    }
                    task.status = AgentTaskStatus::Completed;
                    task.result = Some(result);
                    task.completed_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await
            .map_err(|error| self.log_rejection(error))?;
        self.emit(EventType::TaskCompleted, &task);

        if task.agent == AgentType::PaperProcessor {
            if let Some(paper_id) = extract_paper_id(&task.input) {
                self.mark_paper_processed(paper_id);
            }
        }
        Ok(task)
    }

    /// `processing → failed` with an error message.
    pub async fn fail_task(
        &self,
        task_id: &TaskId,
        error_message: impl Into<String>,
    ) -> Result<AgentTask, TaskError> {
        let task = self
            .transition_to_failed(task_id, error_message.into())
            .await?;
        self.emit(EventType::TaskFailed, &task);
        Ok(task)
    }

    /// Time a task out: `processing → failed` with a timeout reason and a
    /// `TASK_TIMEOUT` event. A no-op on already terminal tasks.
    pub async fn timeout_task(
        &self,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<Option<AgentTask>, TaskError> {
        if let Some(existing) = self.store.get(task_id).await? {
            if existing.status.is_terminal() {
                return Ok(None);
            }
        }
        let task = self
            .transition_to_failed(task_id, format!("Task timed out: {}", reason.into()))
            .await?;
        self.emit(EventType::TaskTimeout, &task);
        Ok(Some(task))
    }

    async fn transition_to_failed(
        &self,
        task_id: &TaskId,
        error_message: String,
    ) -> Result<AgentTask, TaskError> {
        let id = task_id.clone();
        self.store
            .update(
                task_id,
                Box::new(move |task| {
                    if task.status != AgentTaskStatus::Processing {
                        return Err(TaskError::IllegalTransition {
                            task_id: id,
                            from: task.status.to_string(),
                            to: AgentTaskStatus::Failed.to_string(),
                        });
                    }
                    task.status = AgentTaskStatus::Failed;
                    task.error = Some(error_message);
                    task.completed_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await
            .map_err(|error| self.log_rejection(error))
    }

    fn log_rejection(&self, error: TaskError) -> TaskError {
        if let TaskError::IllegalTransition { task_id, from, to } = &error {
            tracing::warn!(task_id = %task_id, from = %from, to = %to, "illegal task transition rejected");
        }
        error
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<AgentTask>, TaskError> {
        self.store.get(task_id).await
    }

    /// Record a processed paper. Returns false when the id was already
    /// present; re-adding is a no-op.
    pub fn mark_paper_processed(&self, paper_id: PaperId) -> bool {
        self.processed_papers.lock().insert(paper_id)
    }

    pub fn is_paper_processed(&self, paper_id: &PaperId) -> bool {
        self.processed_papers.lock().contains(paper_id)
    }

    pub fn processed_paper_count(&self) -> usize {
        self.processed_papers.lock().len()
    }

    /// One reaper pass: time out every `processing` task whose `started_at`
    /// is strictly older than the processing timeout. Returns the number of
    /// tasks timed out.
    pub async fn run_reaper_sweep(&self) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.processing_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let stale = match self.store.processing_started_before(cutoff).await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::error!(error = %error, "reaper scan failed");
                return 0;
            }
        };
        let mut reaped = 0;
        for task_id in stale {
            let reason = format!(
                "processing exceeded {}s",
                self.config.processing_timeout.as_secs()
            );
            match self.timeout_task(&task_id, reason).await {
                Ok(Some(_)) => reaped += 1,
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(task_id = %task_id, error = %error, "reaper could not time out task")
                }
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "timeout reaper sweep finished");
        }
        reaped
    }

    /// One cleanup pass: delete terminal tasks older than the retention
    /// window. Returns the number deleted.
    pub async fn run_cleanup(&self) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.retention)
                .unwrap_or_else(|_| ChronoDuration::days(7));
        match self.store.delete_terminal_before(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(deleted, "task cleanup finished");
                }
                deleted
            }
            Err(error) => {
                tracing::error!(error = %error, "task cleanup failed");
                0
            }
        }
    }

    fn spawn_reaper_loop(self: Arc<Self>) {
        let shutdown_notify = self.shutdown_notify.clone();
        let is_running = self.is_running.clone();
        let reaper_interval = self.config.reaper_interval;

        tokio::spawn(async move {
            let mut interval = interval(reaper_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !*is_running.read() {
                            break;
                        }
                        self.run_reaper_sweep().await;
                    }
                    _ = shutdown_notify.notified() => {
                        break;
                    }
                }
            }
        });
    }

    fn spawn_cleanup_loop(self: Arc<Self>) {
        let shutdown_notify = self.shutdown_notify.clone();
        let is_running = self.is_running.clone();
        let cleanup_interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = interval(cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !*is_running.read() {
                            break;
                        }
                        self.run_cleanup().await;
                    }
                    _ = shutdown_notify.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Stop background workers. Pending transitions in flight still land.
    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }
}

/// Pull the paper id out of a task input payload, tolerating both camelCase
/// and snake_case producers.
fn extract_paper_id(input: &Value) -> Option<PaperId> {
    crate::types::project_first_string(input, &["paperId", "paper_id"]).map(PaperId)
}
