//! Core types shared across the crate: task requests and outcomes, progress
//! events, provider grounding metadata, and the error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============= Request Types =============

/// A deep-research job specification submitted to the remote provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    /// Research question or complex topic requiring investigation
    pub query: String,
    /// Optional instructions for report format (e.g. "include a comparison table")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_instructions: Option<String>,
    /// Optional provider file-search store names for grounding in private data
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_search_stores: Vec<String>,
}

impl ResearchRequest {
    /// Create a request with just a query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            format_instructions: None,
            file_search_stores: Vec::new(),
        }
    }
}

// ============= Task Lifecycle Types =============

/// Phase of an orchestrated research task.
///
/// Transitions are monotonic forward except for the explicit
/// `Reconnecting ⇄ Streaming` cycle. Terminal phases never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    /// Job is being submitted to the provider
    Submitting,
    /// Progress events are being consumed (push stream or status polling)
    Streaming,
    /// Connectivity broke; a resume attempt is in flight
    Reconnecting,
    /// Terminal: final payload received and citations extracted
    Completed,
    /// Terminal: retries exhausted or a permanent error occurred
    Failed,
    /// Terminal: caller-initiated cancellation
    Cancelled,
}

impl TaskPhase {
    /// Whether this phase admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Kind of a progress event observed while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    /// Agent started its autonomous investigation
    Started,
    /// A reasoning step reported by the agent
    Thought,
    /// An action taken by the agent (e.g. a search query)
    Action,
    /// Non-fatal error notification pushed by the provider
    Error,
}

/// One progress event, delivered to the caller in the order received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// What kind of progress this event reports
    pub kind: ProgressKind,
    /// Human-readable content of the event
    pub message: String,
    /// When the orchestrator received the event
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: ProgressKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Attempt counters accumulated over one task's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Submission attempts (including retries)
    pub submit_attempts: u32,
    /// Completed `Reconnecting` intervals
    pub reconnects: u32,
    /// Status polls issued against the provider
    pub polls: u32,
}

/// Caller-facing snapshot of an in-flight or finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Crate-assigned task key
    pub key: uuid::Uuid,
    /// Provider-assigned task id, once submission succeeded
    pub task_id: Option<String>,
    /// Current phase of the task
    pub phase: TaskPhase,
    /// Number of progress events accumulated so far
    pub events_seen: usize,
    /// Most recent progress message, if any
    pub last_message: Option<String>,
    /// Attempt counters so far
    pub stats: TaskStats,
    /// When the task was submitted
    pub started_at: DateTime<Utc>,
}

// ============= Result Types =============

/// Normalized unit of evidence linking report text to a source URL.
///
/// Immutable once produced; extraction over identical raw output yields
/// identical records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationRecord {
    /// Final source URL (redirects resolved where possible)
    pub url: String,
    /// Display title of the source
    pub title: String,
    /// Supported snippet of the report text
    pub snippet: String,
    /// Byte offset where the supported span starts in the report text
    pub start_offset: usize,
    /// Byte offset where the supported span ends in the report text
    pub end_offset: usize,
}

/// Metadata attached to a completed report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Provider-assigned task id
    pub task_id: String,
    /// Wall-clock duration of the whole task
    pub elapsed: Duration,
    /// Attempt counters accumulated over the task
    pub stats: TaskStats,
    /// Always a terminal phase
    pub final_phase: TaskPhase,
}

/// Final output record returned to the caller on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchReport {
    /// Final report text
    pub text: String,
    /// Ordered citations, mapped to offsets into `text`
    pub citations: Vec<CitationRecord>,
    /// Task-level metadata for the report
    pub metadata: ReportMetadata,
}

/// Terminal outcome of one orchestrated task.
///
/// Transient errors are handled internally by the retry policy and never
/// surface individually; only the final outcome reaches the caller.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Final payload fully received and passed through citation extraction
    Completed(Box<ResearchReport>),
    /// Retries exhausted or a permanent error occurred
    Failed {
        /// Classification of the terminal failure
        kind: FailureKind,
        /// Human-readable reason, never a bare error code
        reason: String,
        /// Best available partial progress
        progress: Vec<ProgressEvent>,
        /// Attempt counters at the point of failure
        stats: TaskStats,
    },
    /// Caller-initiated cancellation; partial progress preserved
    Cancelled {
        /// Progress accumulated before cancellation
        progress: Vec<ProgressEvent>,
        /// Attempt counters at the point of cancellation
        stats: TaskStats,
    },
}

impl TaskOutcome {
    /// The terminal phase this outcome corresponds to.
    pub fn phase(&self) -> TaskPhase {
        match self {
            Self::Completed(_) => TaskPhase::Completed,
            Self::Failed { .. } => TaskPhase::Failed,
            Self::Cancelled { .. } => TaskPhase::Cancelled,
        }
    }
}

// ============= Provider Payload Types =============

/// Raw provider output for a completed task, before citation extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawResearchOutput {
    /// Final report text
    #[serde(default)]
    pub text: String,
    /// Provider grounding metadata, absent when the provider supplied none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding: Option<GroundingMetadata>,
}

/// Provider-supplied evidence linking report text to source URLs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    /// Retrievable sources the report drew on
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
    /// Mappings from report spans to supporting chunks
    #[serde(default)]
    pub grounding_supports: Vec<GroundingSupport>,
}

/// One retrievable source referenced by grounding supports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingChunk {
    /// Web source for this chunk; other source kinds are ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSource>,
}

/// A web source behind a grounding chunk. The `uri` is frequently a
/// provider redirect URL rather than the final destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    /// Source URL as the provider reported it
    #[serde(default)]
    pub uri: String,
    /// Display title, when the provider supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Links a span of report text to the chunks that support it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingSupport {
    /// The supported span of report text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<TextSegment>,
    /// Indices into `grounding_chunks` backing this span
    #[serde(default)]
    pub grounding_chunk_indices: Vec<usize>,
}

/// A span of the final report text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSegment {
    /// Byte offset where the span starts
    #[serde(default)]
    pub start_index: usize,
    /// Byte offset where the span ends
    #[serde(default)]
    pub end_index: usize,
    /// Text of the span, sometimes omitted by the provider
    #[serde(default)]
    pub text: String,
}

// ============= Error Types =============

/// Error taxonomy for the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResearchError {
    /// Retryable transport-level failure (reset, refused, 5xx-equivalent)
    #[error("transient connection error: {0}")]
    Transient(String),

    /// A network call exceeded its per-call timeout; retryable
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Caller-caused, non-retryable (malformed request, 4xx-equivalent)
    #[error("permanent request error: {0}")]
    PermanentRequest(String),

    /// Credential rejected by the provider; non-retryable
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Provider-reported fatal error; non-retryable
    #[error("provider fatal error [{code}]: {message}")]
    ProviderFatal {
        /// Provider-reported error code
        code: String,
        /// Provider-reported error message
        message: String,
    },

    /// A resumed stream (or other validated response) was unusable even
    /// though the call returned without transport error. Always retryable
    /// through a fresh reconnect, never silently promoted to success.
    #[error("resumed stream unusable: {0}")]
    ResumptionInvalid(String),

    /// Caller-initiated cancellation; not a failure
    #[error("task cancelled")]
    Cancelled,

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff
    Transient,
    /// Retrying cannot help
    Permanent,
    /// Neither: stop immediately without consulting the retry policy
    Cancelled,
}

impl ResearchError {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::ResumptionInvalid(_) => {
                ErrorClass::Transient
            }
            Self::PermanentRequest(_)
            | Self::Auth(_)
            | Self::ProviderFatal { .. }
            | Self::Config(_) => ErrorClass::Permanent,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// The terminal failure kind this error maps to.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::TransientConnection,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::PermanentRequest(_) | Self::Config(_) => FailureKind::PermanentRequest,
            Self::Auth(_) => FailureKind::Auth,
            Self::ProviderFatal { .. } => FailureKind::ProviderFatal,
            Self::ResumptionInvalid(_) => FailureKind::ResumptionInvalid,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Terminal failure classification surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection-level failures exhausted the retry policy
    TransientConnection,
    /// A per-call timeout or the overall deadline was exceeded
    Timeout,
    /// The request itself was rejected as invalid
    PermanentRequest,
    /// The credential was rejected
    Auth,
    /// The provider reported a fatal task-level error
    ProviderFatal,
    /// Stream resumption kept yielding unusable streams
    ResumptionInvalid,
    /// The caller cancelled the task
    Cancelled,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminality() {
        assert!(!TaskPhase::Submitting.is_terminal());
        assert!(!TaskPhase::Streaming.is_terminal());
        assert!(!TaskPhase::Reconnecting.is_terminal());
        assert!(TaskPhase::Completed.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(TaskPhase::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ResearchError::Transient("reset".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ResearchError::Timeout("poll".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ResearchError::ResumptionInvalid("empty stream".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ResearchError::Auth("bad key".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ResearchError::ProviderFatal {
                code: "RESEARCH_FAILED".into(),
                message: "agent error".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(ResearchError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            ResearchError::ResumptionInvalid("x".into()).failure_kind(),
            FailureKind::ResumptionInvalid
        );
        assert_eq!(
            ResearchError::PermanentRequest("x".into()).failure_kind(),
            FailureKind::PermanentRequest
        );
    }

    #[test]
    fn test_grounding_metadata_deserializes_provider_shape() {
        let raw = serde_json::json!({
            "groundingChunks": [
                {"web": {"uri": "https://example.com/a", "title": "A"}},
                {"web": {"uri": "https://example.com/b"}}
            ],
            "groundingSupports": [
                {
                    "segment": {"startIndex": 0, "endIndex": 10, "text": "first span"},
                    "groundingChunkIndices": [0, 1]
                }
            ]
        });

        let meta: GroundingMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.grounding_chunks.len(), 2);
        assert_eq!(meta.grounding_supports.len(), 1);
        assert_eq!(
            meta.grounding_supports[0].grounding_chunk_indices,
            vec![0, 1]
        );
        assert_eq!(
            meta.grounding_chunks[0]
                .web
                .as_ref()
                .unwrap()
                .title
                .as_deref(),
            Some("A")
        );
    }

    #[test]
    fn test_outcome_phase() {
        let cancelled = TaskOutcome::Cancelled {
            progress: vec![],
            stats: TaskStats::default(),
        };
        assert_eq!(cancelled.phase(), TaskPhase::Cancelled);
    }
}
