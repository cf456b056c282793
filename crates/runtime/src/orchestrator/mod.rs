//! Pipeline orchestrator
//!
//! Drives one paper through the configured stage graph: credit gate, text
//! extraction, the parallel enhancement group, then the sequential analysis
//! tail. Maintains the run state machine, threads prior-stage outputs
//! through the job context, reports progress, and settles credits on every
//! terminal path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::accounting::CreditService;
use crate::agents::AgentRegistry;
use crate::events::EventBus;
use crate::store::RunStore;
use crate::tasks::AgentTaskService;
use crate::types::{
    AgentType, CreditError, EventEnvelope, EventType, OperationType, OrchestratorError, PaperId,
    PipelineConfig, PipelineRun, RunId, RunStatus, RunStatusReport, StageError, SubscriptionTier,
    TaskId, UserId,
};

pub mod context;
pub mod stages;

pub use context::JobContext;
pub use stages::{is_fatal, progress_for, FINALIZE_PROGRESS, PARALLEL_GROUP, SEQUENTIAL_TAIL};

/// Invoked after every progress change with the run id, the new progress,
/// and the stage that moved it.
pub type ProgressCallback = Arc<dyn Fn(RunId, u8, Option<AgentType>) + Send + Sync>;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pipelines allowed to run concurrently, process-wide.
    pub max_concurrent_runs: usize,
    /// Per-run defaults when the caller supplies none.
    pub pipeline_defaults: PipelineConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 8,
            pipeline_defaults: PipelineConfig::default(),
        }
    }
}

/// Everything the upload handler passes in to launch a run.
#[derive(Debug, Clone)]
pub struct StartRun {
    pub paper_id: PaperId,
    pub user_id: UserId,
    pub paper_title: Option<String>,
    /// Extracted document text, opaque to the core.
    pub document_text: Option<String>,
    pub tier: SubscriptionTier,
    pub config: Option<PipelineConfig>,
}

/// Why stage execution stopped early.
#[derive(Debug, Clone)]
enum StageAbort {
    Fatal { stage: AgentType, message: String },
    Timeout,
}

struct RunHandle {
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<Option<RunStatus>>,
}

type InFlight = Arc<Mutex<HashMap<TaskId, AgentType>>>;

/// The pipeline orchestrator.
pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    tasks: Arc<AgentTaskService>,
    credits: Arc<CreditService>,
    runs: Arc<dyn RunStore>,
    event_bus: Arc<EventBus>,
    active: DashMap<RunId, RunHandle>,
    run_semaphore: Arc<Semaphore>,
    is_draining: AtomicBool,
}

impl PipelineOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        tasks: Arc<AgentTaskService>,
        credits: Arc<CreditService>,
        runs: Arc<dyn RunStore>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let run_semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Arc::new(Self {
            config,
            registry,
            tasks,
            credits,
            runs,
            event_bus,
            active: DashMap::new(),
            run_semaphore,
            is_draining: AtomicBool::new(false),
        })
    }

    /// Launch a pipeline run. Reserves the full pipeline cost up front; a
    /// user who cannot afford it gets a run terminal in `PENDING_CREDITS`
    /// with no stages executed.
    pub async fn start_run(
        self: &Arc<Self>,
        request: StartRun,
        progress_cb: Option<ProgressCallback>,
    ) -> Result<RunId, OrchestratorError> {
        if self.is_draining.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }

        let run_id = RunId::new();
        let config = request
            .config
            .clone()
            .unwrap_or_else(|| self.config.pipeline_defaults.clone());
        let run = PipelineRun::new(
            run_id,
            request.paper_id.clone(),
            request.user_id.clone(),
            config.clone(),
        );
        self.runs.insert(run).await;

        match self
            .credits
            .reserve(&request.user_id, config.credit_cost, Some(run_id.to_string()))
            .await
        {
            Ok(_) => {}
            Err(CreditError::Insufficient {
                required,
                available,
                ..
            }) => {
                let now = Utc::now();
                self.runs
                    .update(
                        run_id,
                        Box::new(move |run| {
                            run.status = RunStatus::PendingCredits;
                            run.completed_at = Some(now);
                        }),
                    )
                    .await;
                self.event_bus.publish(
                    EventEnvelope::new(EventType::PipelineFailed)
                        .with_run(run_id)
                        .with_user(request.user_id.clone())
                        .with_detail("reason", "insufficient_credits")
                        .with_detail("required", required)
                        .with_detail("available", available),
                );
                tracing::warn!(
                    run_id = %run_id,
                    user_id = %request.user_id,
                    required,
                    available,
                    "run parked pending credits"
                );
                return Ok(run_id);
            }
            Err(error) => {
                return Err(OrchestratorError::StageFailed {
                    stage: AgentType::PaperProcessor,
                    message: format!("credit reservation failed: {error}"),
                })
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        self.active.insert(run_id, RunHandle { cancel_tx, done_rx });

        let orchestrator = self.clone();
        let request = Arc::new(request);
        let config = Arc::new(config);
        tokio::spawn(async move {
            orchestrator
                .drive(run_id, request, config, cancel_rx, progress_cb, done_tx)
                .await;
        });
        Ok(run_id)
    }

    /// Cancel a run. Safe to call at any time; cancelling a finished run is
    /// a no-op.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        if let Some(handle) = self.active.get(&run_id) {
            let _ = handle.cancel_tx.send(true);
            return Ok(());
        }
        match self.runs.get(run_id).await {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::RunNotFound { run_id }),
        }
    }

    /// Structured run status for the caller; never raw stack traces.
    pub async fn status(&self, run_id: RunId) -> Result<RunStatusReport, OrchestratorError> {
        let run = self
            .runs
            .get(run_id)
            .await
            .ok_or(OrchestratorError::RunNotFound { run_id })?;
        Ok(RunStatusReport {
            run_id,
            status: run.status,
            progress_percent: run.progress_percent,
            current_stage: run.current_stage,
            errors: run.errors,
        })
    }

    /// Block until the run reaches a terminal status.
    pub async fn wait_for(&self, run_id: RunId) -> Result<RunStatus, OrchestratorError> {
        let done_rx = self.active.get(&run_id).map(|handle| handle.done_rx.clone());
        if let Some(mut done_rx) = done_rx {
            loop {
                if let Some(status) = *done_rx.borrow() {
                    return Ok(status);
                }
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.runs
            .get(run_id)
            .await
            .map(|run| run.status)
            .ok_or(OrchestratorError::RunNotFound { run_id })
    }

    /// Stop accepting new runs and wait for the in-flight ones.
    pub async fn drain(&self) {
        self.is_draining.store(true, Ordering::SeqCst);
        let receivers: Vec<watch::Receiver<Option<RunStatus>>> = self
            .active
            .iter()
            .map(|entry| entry.done_rx.clone())
            .collect();
        for mut done_rx in receivers {
            loop {
                if done_rx.borrow().is_some() {
                    break;
                }
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub fn active_run_count(&self) -> usize {
        self.active.len()
    }

    /// All runs recorded for one user, newest first.
    pub async fn runs_for_user(&self, user_id: &UserId) -> Vec<RunStatusReport> {
        let mut runs = self.runs.list_for_user(user_id).await;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.into_iter()
            .map(|run| RunStatusReport {
                run_id: run.run_id,
                status: run.status,
                progress_percent: run.progress_percent,
                current_stage: run.current_stage,
                errors: run.errors,
            })
            .collect()
    }

    async fn drive(
        self: Arc<Self>,
        run_id: RunId,
        request: Arc<StartRun>,
        config: Arc<PipelineConfig>,
        mut cancel_rx: watch::Receiver<bool>,
        progress_cb: Option<ProgressCallback>,
        done_tx: watch::Sender<Option<RunStatus>>,
    ) {
        let _permit = match self.run_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        self.runs
            .update(
                run_id,
                Box::new(|run| run.status = RunStatus::Initializing),
            )
            .await;
        self.event_bus.publish(
            EventEnvelope::new(EventType::PipelineStarted)
                .with_run(run_id)
                .with_user(request.user_id.clone())
                .with_detail("paper_id", request.paper_id.to_string()),
        );

        let started = Utc::now();
        self.runs
            .update(
                run_id,
                Box::new(move |run| {
                    run.status = RunStatus::Running;
                    run.started_at = Some(started);
                }),
            )
            .await;

        let ctx = Arc::new(Mutex::new(JobContext::new(
            request.paper_id.clone(),
            request.paper_title.clone(),
            request.document_text.clone(),
        )));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));

        let mut exec_handle = tokio::spawn(self.clone().execute_stages(
            run_id,
            request.clone(),
            config.clone(),
            ctx.clone(),
            progress_cb.clone(),
            in_flight.clone(),
        ));

        let outcome = tokio::select! {
            joined = &mut exec_handle => Some(joined.unwrap_or_else(|join_error| {
                Err(StageAbort::Fatal {
                    stage: AgentType::PaperProcessor,
                    message: format!("stage executor panicked: {join_error}"),
                })
            })),
            _ = cancel_rx.changed() => None,
            _ = tokio::time::sleep(config.run_timeout) => Some(Err(StageAbort::Timeout)),
        };

        let final_status = match outcome {
            None => {
                exec_handle.abort();
                let _ = (&mut exec_handle).await;
                self.fail_in_flight(&in_flight, "cancelled").await;
                self.refund_unconsumed(run_id, &request, &config, &ctx).await;
                self.finalize(
                    run_id,
                    RunStatus::Cancelled,
                    EventType::PipelineCancelled,
                    &request,
                    &ctx,
                    &progress_cb,
                    None,
                )
                .await
            }
            Some(Ok(())) => {
                self.finalize(
                    run_id,
                    RunStatus::Completed,
                    EventType::PipelineCompleted,
                    &request,
                    &ctx,
                    &progress_cb,
                    Some(FINALIZE_PROGRESS),
                )
                .await
            }
            Some(Err(StageAbort::Fatal { stage, message })) => {
                self.fail_in_flight(&in_flight, "aborted after fatal stage failure")
                    .await;
                self.refund_unconsumed(run_id, &request, &config, &ctx).await;
                tracing::error!(run_id = %run_id, stage = %stage, message, "run failed");
                self.finalize(
                    run_id,
                    RunStatus::Failed,
                    EventType::PipelineFailed,
                    &request,
                    &ctx,
                    &progress_cb,
                    None,
                )
                .await
            }
            Some(Err(StageAbort::Timeout)) => {
                exec_handle.abort();
                let _ = (&mut exec_handle).await;
                self.fail_in_flight(&in_flight, "run timed out").await;
                self.refund_unconsumed(run_id, &request, &config, &ctx).await;
                let timeout = config.run_timeout;
                self.runs
                    .update(
                        run_id,
                        Box::new(move |run| {
                            run.errors.push(StageError {
                                stage: run.current_stage.unwrap_or(AgentType::PaperProcessor),
                                message: format!("run exceeded the {timeout:?} timeout"),
                                fatal: true,
                                occurred_at: Utc::now(),
                            });
                        }),
                    )
                    .await;
                self.finalize(
                    run_id,
                    RunStatus::Failed,
                    EventType::PipelineFailed,
                    &request,
                    &ctx,
                    &progress_cb,
                    None,
                )
                .await
            }
        };

        let _ = done_tx.send(Some(final_status));
        self.active.remove(&run_id);
    }

    async fn execute_stages(
        self: Arc<Self>,
        run_id: RunId,
        request: Arc<StartRun>,
        config: Arc<PipelineConfig>,
        ctx: Arc<Mutex<JobContext>>,
        progress_cb: Option<ProgressCallback>,
        in_flight: InFlight,
    ) -> Result<(), StageAbort> {
        self.run_stage(
            run_id,
            AgentType::PaperProcessor,
            &request,
            &config,
            &ctx,
            &progress_cb,
            &in_flight,
        )
        .await?;

        // Enhancement stages fan out, bounded by the per-run agent cap.
        let stage_semaphore = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        let mut group = JoinSet::new();
        for agent in PARALLEL_GROUP {
            if !config.is_enabled(agent) {
                continue;
            }
            let this = self.clone();
            let request = request.clone();
            let config = config.clone();
            let ctx = ctx.clone();
            let progress_cb = progress_cb.clone();
            let in_flight = in_flight.clone();
            let semaphore = stage_semaphore.clone();
            group.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.run_stage(
                    run_id, agent, &request, &config, &ctx, &progress_cb, &in_flight,
                )
                .await
            });
        }

        let mut fatal: Option<StageAbort> = None;
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok(Err(abort)) => {
                    if fatal.is_none() {
                        fatal = Some(abort);
                        group.abort_all();
                    }
                }
                Ok(Ok(())) => {}
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    tracing::error!(run_id = %run_id, error = %join_error, "stage task panicked");
                    fatal.get_or_insert(StageAbort::Fatal {
                        stage: AgentType::ContentSummarizer,
                        message: format!("stage task panicked: {join_error}"),
                    });
                }
            }
        }
        if let Some(abort) = fatal {
            return Err(abort);
        }

        for agent in SEQUENTIAL_TAIL {
            self.run_stage(
                run_id, agent, &request, &config, &ctx, &progress_cb, &in_flight,
            )
            .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        run_id: RunId,
        agent: AgentType,
        request: &Arc<StartRun>,
        config: &Arc<PipelineConfig>,
        ctx: &Arc<Mutex<JobContext>>,
        progress_cb: &Option<ProgressCallback>,
        in_flight: &InFlight,
    ) -> Result<(), StageAbort> {
        if !config.is_enabled(agent) {
            tracing::debug!(run_id = %run_id, agent = %agent, "stage disabled, skipping");
            return Ok(());
        }

        let input = ctx.lock().stage_input(agent);
        let task = match self
            .tasks
            .create_task(TaskId::new(), agent, request.user_id.clone(), input)
            .await
        {
            Ok(task) => task,
            Err(error) => {
                return self
                    .settle_stage_failure(run_id, agent, error.to_string(), ctx)
                    .await;
            }
        };

        self.runs
            .update(
                run_id,
                Box::new(move |run| run.current_stage = Some(agent)),
            )
            .await;
        self.event_bus.publish(
            EventEnvelope::new(EventType::PipelineStageStarted)
                .with_run(run_id)
                .with_task(task.task_id.clone())
                .with_user(request.user_id.clone())
                .with_agent(agent),
        );

        let Some(worker) = self.registry.worker(agent) else {
            return self
                .settle_stage_failure(run_id, agent, "no worker registered".to_string(), ctx)
                .await;
        };

        in_flight.lock().insert(task.task_id.clone(), agent);
        let result = worker.process(&task).await;
        in_flight.lock().remove(&task.task_id);

        if result.success {
            ctx.lock().insert(agent, Some(result.clone()));
            let mark = progress_for(agent);
            let stored = result.clone();
            let updated = self
                .runs
                .update(
                    run_id,
                    Box::new(move |run| {
                        run.advance_progress(mark);
                        run.context.insert(agent, Some(stored));
                    }),
                )
                .await;
            let progress = updated.map(|run| run.progress_percent).unwrap_or(mark);
            if let Some(cb) = progress_cb {
                cb(run_id, progress, Some(agent));
            }
            self.event_bus.publish(
                EventEnvelope::new(EventType::PipelineStageCompleted)
                    .with_run(run_id)
                    .with_task(result.task_id.clone())
                    .with_user(request.user_id.clone())
                    .with_agent(agent)
                    .with_detail("progress", progress)
                    .with_detail("degraded", result.is_degraded()),
            );
            Ok(())
        } else {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "agent failed".to_string());
            self.event_bus.publish(
                EventEnvelope::new(EventType::PipelineStageFailed)
                    .with_run(run_id)
                    .with_task(result.task_id.clone())
                    .with_user(request.user_id.clone())
                    .with_agent(agent)
                    .with_detail("error", message.clone()),
            );
            self.settle_stage_failure(run_id, agent, message, ctx).await
        }
    }

    /// Record a stage failure and decide whether the run continues.
    async fn settle_stage_failure(
        &self,
        run_id: RunId,
        agent: AgentType,
        message: String,
        ctx: &Arc<Mutex<JobContext>>,
    ) -> Result<(), StageAbort> {
        let fatal = is_fatal(agent);
        let error_message = message.clone();
        self.runs
            .update(
                run_id,
                Box::new(move |run| {
                    run.errors.push(StageError {
                        stage: agent,
                        message: error_message,
                        fatal,
                        occurred_at: Utc::now(),
                    });
                    if !fatal {
                        run.context.insert(agent, None);
                    }
                }),
            )
            .await;

        if fatal {
            Err(StageAbort::Fatal {
                stage: agent,
                message,
            })
        } else {
            tracing::warn!(
                run_id = %run_id,
                agent = %agent,
                error = %message,
                "best-effort stage failed, run continues"
            );
            ctx.lock().insert(agent, None);
            Ok(())
        }
    }

    /// Mark every still-running stage task failed with `reason`. Tasks that
    /// raced to completion are left alone.
    async fn fail_in_flight(&self, in_flight: &InFlight, reason: &str) {
        let pending: Vec<TaskId> = in_flight.lock().keys().cloned().collect();
        for task_id in pending {
            if let Err(error) = self.tasks.fail_task(&task_id, reason).await {
                tracing::debug!(task_id = %task_id, error = %error, "in-flight task already settled");
            }
        }
        in_flight.lock().clear();
    }

    /// Return the share of the up-front reservation not consumed by
    /// completed stages. Idempotent per run id.
    async fn refund_unconsumed(
        &self,
        run_id: RunId,
        request: &Arc<StartRun>,
        config: &Arc<PipelineConfig>,
        ctx: &Arc<Mutex<JobContext>>,
    ) {
        let consumed: u64 = ctx
            .lock()
            .completed_stages()
            .into_iter()
            .map(|agent| {
                self.credits
                    .cost_of(OperationType::for_agent(agent), request.tier)
            })
            .sum();
        let refund = config.credit_cost.saturating_sub(consumed);
        if refund == 0 {
            return;
        }
        if let Err(error) = self
            .credits
            .refund(&request.user_id, refund, &run_id.to_string())
            .await
        {
            tracing::error!(run_id = %run_id, error = %error, "credit refund failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        run_id: RunId,
        status: RunStatus,
        event_type: EventType,
        request: &Arc<StartRun>,
        ctx: &Arc<Mutex<JobContext>>,
        progress_cb: &Option<ProgressCallback>,
        progress: Option<u8>,
    ) -> RunStatus {
        let snapshot = ctx.lock().to_entity_map();
        let now = Utc::now();
        let updated = self
            .runs
            .update(
                run_id,
                Box::new(move |run| {
                    run.status = status;
                    run.completed_at = Some(now);
                    run.current_stage = None;
                    run.context = snapshot;
                    if let Some(progress) = progress {
                        run.advance_progress(progress);
                    }
                }),
            )
            .await;

        let final_progress = updated.map(|run| run.progress_percent).unwrap_or(0);
        if let Some(cb) = progress_cb {
            cb(run_id, final_progress, None);
        }
        self.event_bus.publish(
            EventEnvelope::new(event_type)
                .with_run(run_id)
                .with_user(request.user_id.clone())
                .with_detail("status", status.as_str())
                .with_detail("progress", final_progress),
        );
        tracing::info!(run_id = %run_id, status = %status, progress = final_progress, "run finalized");
        status
    }
}
