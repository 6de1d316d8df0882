//! Shared test fixtures: a scripted transport and connector that let the
//! integration tests drive the orchestrator through exact failure sequences
//! without a live network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use vera::pool::{Connector, HandleHealthPolicy, HandlePool};
use vera::retry::RetryConfig;
use vera::transport::{
    EventStream, ProviderState, ProviderStatus, ResearchTransport, ResumeToken, StreamEvent,
};
use vera::types::{ProgressKind, RawResearchOutput, ResearchError, ResearchRequest, Result};
use vera::utils::config::OrchestratorConfig;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One scripted answer to an `open_stream` or `resume_stream` call.
pub enum StreamScript {
    /// Yield these items in order, then end the stream gracefully.
    Events(Vec<Result<StreamEvent>>),
    /// The call itself fails.
    Fail(ResearchError),
    /// The call succeeds but the stream never yields, parking the consumer
    /// until cancellation or the overall deadline.
    Hang,
    /// Yield these items, then park without ending the stream.
    EventsThenHang(Vec<Result<StreamEvent>>),
}

/// Transport whose every method pops its next response from a script queue.
///
/// Exhausted queues fall back to benign defaults (successful submit, empty
/// stream, completed status) so tests only script the interesting part of a
/// scenario.
#[derive(Default)]
pub struct ScriptedTransport {
    submits: Mutex<VecDeque<Result<String>>>,
    opens: Mutex<VecDeque<StreamScript>>,
    resumes: Mutex<VecDeque<StreamScript>>,
    polls: Mutex<VecDeque<Result<ProviderStatus>>>,
    fetches: Mutex<VecDeque<Result<RawResearchOutput>>>,
    followups: Mutex<VecDeque<Result<String>>>,
    resume_tokens: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_submit(&self, result: Result<String>) {
        self.submits.lock().push_back(result);
    }

    pub fn push_open(&self, script: StreamScript) {
        self.opens.lock().push_back(script);
    }

    pub fn push_resume(&self, script: StreamScript) {
        self.resumes.lock().push_back(script);
    }

    pub fn push_poll(&self, result: Result<ProviderStatus>) {
        self.polls.lock().push_back(result);
    }

    pub fn push_fetch(&self, result: Result<RawResearchOutput>) {
        self.fetches.lock().push_back(result);
    }

    pub fn push_follow_up(&self, result: Result<String>) {
        self.followups.lock().push_back(result);
    }

    /// Cursors seen by `resume_stream`, in call order.
    pub fn resume_tokens(&self) -> Vec<String> {
        self.resume_tokens.lock().clone()
    }

    fn materialize(script: Option<StreamScript>) -> Result<EventStream> {
        match script.unwrap_or(StreamScript::Events(Vec::new())) {
            StreamScript::Events(items) => Ok(Box::pin(futures::stream::iter(items))),
            StreamScript::Fail(err) => Err(err),
            StreamScript::Hang => Ok(Box::pin(futures::stream::pending())),
            StreamScript::EventsThenHang(items) => Ok(Box::pin(
                futures::stream::iter(items).chain(futures::stream::pending()),
            )),
        }
    }
}

#[async_trait]
impl ResearchTransport for ScriptedTransport {
    async fn submit(&self, _request: &ResearchRequest) -> Result<String> {
        self.submits
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("task-scripted".to_string()))
    }

    async fn open_stream(&self, _task_id: &str) -> Result<EventStream> {
        Self::materialize(self.opens.lock().pop_front())
    }

    async fn resume_stream(&self, _task_id: &str, token: &ResumeToken) -> Result<EventStream> {
        self.resume_tokens.lock().push(token.as_str().to_string());
        Self::materialize(self.resumes.lock().pop_front())
    }

    async fn poll_status(&self, _task_id: &str) -> Result<ProviderStatus> {
        self.polls.lock().pop_front().unwrap_or_else(|| {
            Ok(ProviderStatus {
                state: ProviderState::Completed,
                detail: None,
            })
        })
    }

    async fn fetch_result(&self, _task_id: &str) -> Result<RawResearchOutput> {
        self.fetches.lock().pop_front().unwrap_or_else(|| {
            Ok(RawResearchOutput {
                text: "scripted report".to_string(),
                grounding: None,
            })
        })
    }

    async fn follow_up(&self, _task_id: &str, _question: &str, _model: &str) -> Result<String> {
        self.followups
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("scripted answer".to_string()))
    }
}

/// Connector that hands the same scripted transport to every minted handle.
/// Handle generations still rotate; only the transport behind them is shared.
pub struct ScriptedConnector {
    transport: Arc<ScriptedTransport>,
}

impl ScriptedConnector {
    pub fn new(transport: Arc<ScriptedTransport>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn ResearchTransport>> {
        Ok(self.transport.clone())
    }
}

// ============= Scenario helpers =============

pub fn thought(message: &str, cursor: &str) -> Result<StreamEvent> {
    Ok(StreamEvent::new(ProgressKind::Thought, message).with_cursor(cursor))
}

pub fn action(message: &str, cursor: &str) -> Result<StreamEvent> {
    Ok(StreamEvent::new(ProgressKind::Action, message).with_cursor(cursor))
}

pub fn pushed_error(message: &str) -> Result<StreamEvent> {
    Ok(StreamEvent::new(ProgressKind::Error, message))
}

pub fn broken(message: &str) -> Result<StreamEvent> {
    Err(ResearchError::Transient(message.to_string()))
}

pub fn transient(message: &str) -> ResearchError {
    ResearchError::Transient(message.to_string())
}

/// Retry policy with millisecond backoff so scenarios finish quickly.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_base_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(10))
}

/// Orchestrator timing with a short poll interval and a deadline generous
/// enough that only scenarios that script a hang ever reach it.
pub fn fast_timing() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(5),
        max_wait: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        resolve_citations: false,
    }
}

/// Pool over a scripted transport with the default health policy.
pub fn scripted_pool(transport: &Arc<ScriptedTransport>) -> Arc<HandlePool> {
    scripted_pool_with(transport, HandleHealthPolicy::default())
}

pub fn scripted_pool_with(
    transport: &Arc<ScriptedTransport>,
    policy: HandleHealthPolicy,
) -> Arc<HandlePool> {
    Arc::new(HandlePool::new(
        ScriptedConnector::new(transport.clone()),
        policy,
    ))
}
