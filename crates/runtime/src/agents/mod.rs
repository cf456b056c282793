//! Per-agent worker runtime
//!
//! One [`AgentWorker`] per agent kind, each owning a bounded execution pool,
//! a provider client, and references to the reliability envelope, task
//! service, and token accounting. A worker turns one `AgentTask` into one
//! `AgentResult`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::accounting::TokenUsageRecorder;
use crate::providers::{ProviderClient, ProviderRequest, ProviderResponse};
use crate::reliability::{ProviderRateLimiter, RetryPolicy};
use crate::tasks::AgentTaskService;
use crate::types::{
    estimate_tokens, project_first_string, AgentResult, AgentTask, AgentType, ProviderError,
    ProviderKind, ResultData,
};

pub mod parse;

pub use parse::parse_result;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct AgentWorkerConfig {
    /// Concurrent executions allowed per agent.
    pub concurrency: usize,
}

impl Default for AgentWorkerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Per-million-token USD price used for rough cost attribution.
fn cost_estimate(provider: ProviderKind, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_rate, output_rate) = match provider {
        ProviderKind::Llm => (3.0, 15.0),
        ProviderKind::Perplexity => (1.0, 1.0),
        // Metadata providers are free; attribute zero cost.
        ProviderKind::Crossref | ProviderKind::SemanticScholar | ProviderKind::Arxiv => (0.0, 0.0),
    };
    (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
}

/// Executes one kind of agent against its provider.
pub struct AgentWorker {
    agent: AgentType,
    provider: Arc<dyn ProviderClient>,
    pool: Arc<Semaphore>,
    retry_policy: Arc<RetryPolicy>,
    rate_limiter: Arc<ProviderRateLimiter>,
    tasks: Arc<AgentTaskService>,
    tokens: Arc<TokenUsageRecorder>,
}

impl AgentWorker {
    pub fn new(
        agent: AgentType,
        config: AgentWorkerConfig,
        provider: Arc<dyn ProviderClient>,
        retry_policy: Arc<RetryPolicy>,
        rate_limiter: Arc<ProviderRateLimiter>,
        tasks: Arc<AgentTaskService>,
        tokens: Arc<TokenUsageRecorder>,
    ) -> Self {
        Self {
            agent,
            provider,
            pool: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry_policy,
            rate_limiter,
            tasks,
            tokens,
        }
    }

    pub fn agent(&self) -> AgentType {
        self.agent
    }

    /// Execute one task end to end: start it, run the provider call under
    /// the reliability envelope, parse the response, account tokens, and
    /// settle the task record.
    pub async fn process(&self, task: &AgentTask) -> AgentResult {
        let started = Instant::now();

        let _permit = match self.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return AgentResult::failure(
                    task.task_id.clone(),
                    "worker pool closed",
                    started.elapsed(),
                )
            }
        };

        if let Err(error) = self.tasks.start_task(&task.task_id).await {
            return AgentResult::failure(task.task_id.clone(), error.to_string(), started.elapsed());
        }

        // Fail fast without consuming the half-open probe slot.
        if self.retry_policy.breakers().is_open(self.agent) {
            return self
                .settle_failure(task, "circuit open for agent".to_string(), started, 0)
                .await;
        }

        let request = match build_request(self.agent, &task.input) {
            Ok(request) => request,
            Err(error) => {
                return self
                    .settle_failure(task, error.to_string(), started, 0)
                    .await;
            }
        };
        let prompt_tokens = estimate_tokens(&request.payload.to_string())
            + request.system.as_deref().map(estimate_tokens).unwrap_or(0);

        let outcome = self
            .retry_policy
            .execute_with_retry(self.agent, || {
                let request = request.clone();
                async move {
                    self.rate_limiter.acquire(self.provider.kind()).await;
                    let response = self.provider.call(request).await?;
                    let data = parse_result(self.agent, &response.body)?;
                    Ok::<_, ProviderError>((response, data))
                }
            })
            .await;

        match outcome {
            Ok((response, data)) => self.settle_success(task, response, data, started, prompt_tokens).await,
            Err(error) => {
                let message = if error.is_cancellation() {
                    "cancelled".to_string()
                } else {
                    error.to_string()
                };
                self.settle_failure(task, message, started, prompt_tokens)
                    .await
            }
        }
    }

    async fn settle_success(
        &self,
        task: &AgentTask,
        response: ProviderResponse,
        data: ResultData,
        started: Instant,
        estimated_input: u64,
    ) -> AgentResult {
        let elapsed = started.elapsed();
        let (input_tokens, output_tokens) = match response.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (
                estimated_input,
                estimate_tokens(&response.body.to_string()),
            ),
        };
        self.tokens
            .record(
                task.user_id.clone(),
                self.provider.kind(),
                self.agent,
                task.task_id.clone(),
                input_tokens,
                output_tokens,
                cost_estimate(self.provider.kind(), input_tokens, output_tokens),
                elapsed.as_millis() as u64,
                true,
            )
            .await;

        let result = AgentResult::success(task.task_id.clone(), data, elapsed);
        let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
        if let Err(error) = self.tasks.complete_task(&task.task_id, payload).await {
            tracing::warn!(task_id = %task.task_id, error = %error, "could not complete task record");
        }
        result
    }

    async fn settle_failure(
        &self,
        task: &AgentTask,
        message: String,
        started: Instant,
        estimated_input: u64,
    ) -> AgentResult {
        let elapsed = started.elapsed();
        if estimated_input > 0 {
            self.tokens
                .record(
                    task.user_id.clone(),
                    self.provider.kind(),
                    self.agent,
                    task.task_id.clone(),
                    estimated_input,
                    0,
                    0.0,
                    elapsed.as_millis() as u64,
                    false,
                )
                .await;
        }
        if let Err(error) = self.tasks.fail_task(&task.task_id, message.clone()).await {
            tracing::warn!(task_id = %task.task_id, error = %error, "could not fail task record");
        }
        AgentResult::failure(task.task_id.clone(), message, elapsed)
    }
}

/// Compose the provider request for one agent from its task input.
///
/// Each agent projects its primary input from a candidate-key list so minor
/// schema drift between stages does not break the pipeline; a genuinely
/// missing input is a non-retryable failure.
pub fn build_request(agent: AgentType, input: &Value) -> Result<ProviderRequest, ProviderError> {
    let require = |keys: &[&str]| {
        project_first_string(input, keys).ok_or_else(|| ProviderError::InvalidInput(keys[0].into()))
    };

    match agent {
        AgentType::PaperProcessor => {
            let document = require(&["documentText", "rawText", "content", "text"])?;
            Ok(ProviderRequest::new("chat", json!({ "prompt": document }))
                .with_system("Extract the complete readable text from the supplied document. Answer with JSON: {\"text\": ..., \"pageCount\": ...}."))
        }
        AgentType::ContentSummarizer => {
            let text = require(&["textContent", "extractedText", "content", "text"])?;
            Ok(ProviderRequest::new("chat", json!({ "prompt": text }))
                .with_system("Summarize the paper. Answer with JSON: {\"brief\": ..., \"standard\": ..., \"detailed\": ...}."))
        }
        AgentType::ConceptExplainer => {
            let text = require(&["textContent", "extractedText", "content", "text"])?;
            Ok(ProviderRequest::new("chat", json!({ "prompt": text }))
                .with_system("Explain the key technical concepts for a graduate student. Answer with JSON: {\"concepts\": [{\"term\": ..., \"explanation\": ...}]}."))
        }
        AgentType::QualityChecker => {
            let text = require(&["textContent", "extractedText", "content", "text"])?;
            Ok(ProviderRequest::new("chat", json!({ "prompt": text }))
                .with_system("Assess methodology, rigor and reproducibility. Answer with JSON: {\"overallScore\": 0..1, \"findings\": [{\"category\": ..., \"score\": ..., \"comment\": ...}]}."))
        }
        AgentType::CitationFormatter => {
            let text = require(&["citationsText", "references", "textContent", "content", "text"])?;
            Ok(ProviderRequest::new("chat", json!({ "prompt": text }))
                .with_system("Extract the bibliography and format every entry in APA style. Answer with JSON: {\"style\": \"APA\", \"formatted\": [...]}."))
        }
        AgentType::MetadataEnhancer => {
            let title = require(&["title", "paperTitle"])?;
            Ok(ProviderRequest::new("works_query", json!({ "title": title })))
        }
        AgentType::CitationVerifier => {
            let query = require(&["citationsText", "citations", "query", "title"])?;
            Ok(ProviderRequest::new("paper_search", json!({ "query": query })))
        }
        AgentType::PerplexityResearcher => {
            let topic = require(&["title", "topic", "brief", "summary"])?;
            Ok(ProviderRequest::new(
                "chat",
                json!({ "prompt": format!("What is the current state of research around: {topic}?") }),
            )
            .with_system("Be precise and cite sources."))
        }
        AgentType::RelatedPaperDiscovery => {
            let query = require(&["title", "query", "topic"])?;
            Ok(ProviderRequest::new("search", json!({ "query": query })))
        }
    }
}

/// All agent workers, keyed by agent kind.
pub struct AgentRegistry {
    workers: HashMap<AgentType, Arc<AgentWorker>>,
}

impl AgentRegistry {
    pub fn new(workers: HashMap<AgentType, Arc<AgentWorker>>) -> Self {
        Self { workers }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: AgentWorkerConfig,
        providers: HashMap<AgentType, Arc<dyn ProviderClient>>,
        retry_policy: Arc<RetryPolicy>,
        rate_limiter: Arc<ProviderRateLimiter>,
        tasks: Arc<AgentTaskService>,
        tokens: Arc<TokenUsageRecorder>,
    ) -> Self {
        let workers = providers
            .into_iter()
            .map(|(agent, provider)| {
                let worker = AgentWorker::new(
                    agent,
                    config.clone(),
                    provider,
                    retry_policy.clone(),
                    rate_limiter.clone(),
                    tasks.clone(),
                    tokens.clone(),
                );
                (agent, Arc::new(worker))
            })
            .collect();
        Self { workers }
    }

    pub fn worker(&self, agent: AgentType) -> Option<Arc<AgentWorker>> {
        self.workers.get(&agent).cloned()
    }

    pub fn agents(&self) -> Vec<AgentType> {
        self.workers.keys().copied().collect()
    }
}
