//! Inbound surface for callers: task submission, status queries,
//! cancellation, and follow-up questions.
//!
//! One [`ResearchService`] owns the shared handle pool and a registry of
//! running tasks. Each submission spawns exactly one orchestrator; there is
//! never more than one active orchestrator per task key.

use crate::citations::{CitationExtractor, HttpUrlResolver};
use crate::orchestrator::{Orchestrator, SharedSnapshot};
use crate::pool::{Connector, HandlePool};
use crate::retry::{next_decision, RetryConfig, RetryDecision};
use crate::transport::{GeminiTransport, GeminiTransportConfig, ResearchTransport};
use crate::types::{
    ProgressEvent, ResearchError, ResearchRequest, Result, TaskOutcome, TaskPhase, TaskSnapshot,
    TaskStats,
};
use crate::utils::config::{Config, OrchestratorConfig};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Connector minting Gemini transports for the pool.
struct GeminiConnector {
    config: GeminiTransportConfig,
}

#[async_trait::async_trait]
impl Connector for GeminiConnector {
    async fn connect(&self) -> Result<Arc<dyn ResearchTransport>> {
        Ok(Arc::new(GeminiTransport::new(self.config.clone())?))
    }
}

/// Caller's grip on a submitted task.
pub struct TaskHandle {
    /// Crate-assigned task key, valid for `get_status`/`cancel`
    pub key: Uuid,
    /// Ordered progress events, at most one buffered
    pub progress: mpsc::Receiver<ProgressEvent>,
    /// Resolves to the terminal outcome
    pub outcome: JoinHandle<TaskOutcome>,
}

struct TaskEntry {
    snapshot: SharedSnapshot,
    cancel: CancellationToken,
}

/// Shared entry point for research tasks and follow-up questions.
pub struct ResearchService {
    pool: Arc<HandlePool>,
    retry: RetryConfig,
    timing: OrchestratorConfig,
    followup_model: String,
    resolve_citations: bool,
    tasks: RwLock<HashMap<Uuid, TaskEntry>>,
}

impl ResearchService {
    /// Build a service over an existing pool. Used directly by tests with a
    /// fake connector; production callers usually go through
    /// [`Self::from_config`].
    pub fn new(
        pool: Arc<HandlePool>,
        retry: RetryConfig,
        timing: OrchestratorConfig,
        followup_model: impl Into<String>,
    ) -> Self {
        let resolve_citations = timing.resolve_citations;
        Self {
            pool,
            retry,
            timing,
            followup_model: followup_model.into(),
            resolve_citations,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Build the full production stack from configuration.
    pub fn from_config(config: Config) -> Self {
        let transport_config = GeminiTransportConfig::new(config.provider.api_key)
            .with_base_url(config.provider.base_url)
            .with_research_agent(config.provider.research_agent)
            .with_request_timeout(config.provider.request_timeout);
        let connector = Arc::new(GeminiConnector {
            config: transport_config,
        });
        let pool = Arc::new(HandlePool::new(connector, config.health));
        Self::new(
            pool,
            config.retry,
            config.orchestrator,
            config.provider.followup_model,
        )
    }

    /// Load configuration from the environment and build the service.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(Config::from_env()?))
    }

    /// The pool shared by every orchestrator this service spawns.
    pub fn pool(&self) -> &Arc<HandlePool> {
        &self.pool
    }

    /// Submit a research task. Spawns one orchestrator and returns
    /// immediately; progress arrives on the handle's channel and the
    /// terminal outcome through `handle.outcome`.
    pub fn submit_task(&self, request: ResearchRequest) -> TaskHandle {
        let (progress_tx, progress_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let extractor = self.extractor();
        let orchestrator = Orchestrator::new(
            self.pool.clone(),
            self.retry.clone(),
            self.timing.clone(),
            extractor,
        )
        .with_cancellation(cancel.clone())
        .with_progress_channel(progress_tx);

        let key = orchestrator.key();
        let snapshot: SharedSnapshot = Arc::new(parking_lot::Mutex::new(TaskSnapshot {
            key,
            task_id: None,
            phase: TaskPhase::Submitting,
            events_seen: 0,
            last_message: None,
            stats: TaskStats::default(),
            started_at: Utc::now(),
        }));
        let orchestrator = orchestrator.with_snapshot_cell(snapshot.clone());

        self.tasks.write().insert(
            key,
            TaskEntry {
                snapshot,
                cancel: cancel.clone(),
            },
        );

        let outcome = tokio::spawn(orchestrator.run(request));
        TaskHandle {
            key,
            progress: progress_rx,
            outcome,
        }
    }

    /// Current snapshot of a task, or `None` for an unknown key. Works for
    /// terminal tasks until they are removed.
    pub fn get_status(&self, key: Uuid) -> Option<TaskSnapshot> {
        self.tasks
            .read()
            .get(&key)
            .map(|entry| entry.snapshot.lock().clone())
    }

    /// Request cancellation of a task. Returns `false` for an unknown key.
    /// The orchestrator reaches `Cancelled` promptly, without waiting out
    /// in-flight retries or backoff sleeps.
    pub fn cancel(&self, key: Uuid) -> bool {
        match self.tasks.read().get(&key) {
            Some(entry) => {
                tracing::info!(%key, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the registry entry for a finished task.
    pub fn remove(&self, key: Uuid) -> bool {
        self.tasks.write().remove(&key).is_some()
    }

    /// Ask a follow-up question about a completed research task. Runs as a
    /// short-lived request through the same handle pool, retry policy, and
    /// health accounting as a full task.
    pub async fn follow_up(&self, task_id: &str, question: &str) -> Result<String> {
        self.follow_up_with_cancellation(task_id, question, &CancellationToken::new())
            .await
    }

    /// [`follow_up`](Self::follow_up) under an external cancellation token.
    /// Both the in-flight request and any backoff sleep observe the token;
    /// cancellation never waits out a delay.
    pub async fn follow_up_with_cancellation(
        &self,
        task_id: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut attempt: u32 = 1;
        let sequence_start = Instant::now();
        loop {
            let handle = self.pool.acquire().await?;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                out = tokio::time::timeout(
                    self.timing.request_timeout,
                    handle
                        .transport()
                        .follow_up(task_id, question, &self.followup_model),
                ) => out.unwrap_or_else(|_| Err(ResearchError::Timeout("follow-up".to_string()))),
            };

            match self.pool.record_checked(&handle, result, |_| true) {
                Ok(answer) => return Ok(answer),
                Err(err) => {
                    match next_decision(attempt, sequence_start.elapsed(), &err, &self.retry) {
                        RetryDecision::RetryAfter {
                            delay,
                            attempt: next,
                        } => {
                            tracing::info!(attempt, ?delay, error = %err, "follow-up failed, backing off");
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                            attempt = next;
                        }
                        RetryDecision::Abandon { .. } => return Err(err),
                    }
                }
            }
        }
    }

    fn extractor(&self) -> CitationExtractor {
        if self.resolve_citations {
            match HttpUrlResolver::new(self.timing.request_timeout) {
                Ok(resolver) => return CitationExtractor::new(Arc::new(resolver)),
                Err(err) => {
                    tracing::warn!(error = %err, "url resolver unavailable, citations keep provider urls");
                }
            }
        }
        CitationExtractor::without_resolution()
    }
}
