//! Transport seam between the orchestrator and the remote research provider.
//!
//! The orchestrator drives everything through the [`ResearchTransport`]
//! trait, which keeps the state machine testable against a scripted fake
//! without a live network dependency. The production implementation lives in
//! [`gemini`].

use crate::types::{ProgressKind, RawResearchOutput, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Gemini-style Interactions API transport over HTTP.
pub mod gemini;

pub use gemini::{GeminiTransport, GeminiTransportConfig};

/// Opaque cursor allowing a dropped stream to be continued without
/// restarting the task from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wrap a provider-supplied cursor value.
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// The raw cursor value sent back to the provider on resume.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One event yielded by the provider's progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// What kind of progress the provider reported
    pub kind: ProgressKind,
    /// Event payload (thought text, search query, error detail)
    pub content: String,
    /// Cursor identifying this event for resumption, when the provider
    /// supplies one
    pub cursor: Option<ResumeToken>,
}

impl StreamEvent {
    /// Event without a resumption cursor.
    pub fn new(kind: ProgressKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            cursor: None,
        }
    }

    /// Attach the cursor identifying this event for resumption.
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(ResumeToken::new(cursor));
        self
    }
}

/// Boxed stream of progress events. Items are transport errors when the
/// connection breaks mid-stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Provider-side state of a submitted task, as reported by a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    /// Agent is still investigating
    Running,
    /// Final payload is ready to fetch
    Completed,
    /// The provider gave up on the task
    Failed,
    /// The task was cancelled provider-side
    Cancelled,
}

/// Response to a single status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Coarse task state
    pub state: ProviderState,
    /// Free-form detail from the provider, if any
    pub detail: Option<String>,
}

/// Authenticated channel to the remote research service.
///
/// One transport instance corresponds to one connection handle in the pool;
/// the pool mints a fresh transport whenever health thresholds force handle
/// rotation. Every method is a real request against the service and must be
/// fed back into pool accounting by the caller.
#[async_trait]
pub trait ResearchTransport: Send + Sync {
    /// Submit a research job. Returns the provider-assigned task id.
    async fn submit(&self, request: &crate::types::ResearchRequest) -> Result<String>;

    /// Open the progress stream for a task from the beginning.
    async fn open_stream(&self, task_id: &str) -> Result<EventStream>;

    /// Resume a broken stream from the given cursor.
    ///
    /// A successful return means only that the call completed; the caller
    /// must still validate that the stream yields events before treating
    /// the attempt as forward progress.
    async fn resume_stream(&self, task_id: &str, token: &ResumeToken) -> Result<EventStream>;

    /// One-shot status check for a task.
    async fn poll_status(&self, task_id: &str) -> Result<ProviderStatus>;

    /// Fetch the final payload of a completed task.
    async fn fetch_result(&self, task_id: &str) -> Result<RawResearchOutput>;

    /// Ask a follow-up question against a completed task's context.
    async fn follow_up(&self, task_id: &str, question: &str, model: &str) -> Result<String>;
}
