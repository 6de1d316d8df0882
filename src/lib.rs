//! # V.E.R.A - Verified Evidence Research Agent
//!
//! Orchestration core for long-running deep-research tasks executed by a
//! remote AI research service. The crate tracks a submitted job across many
//! minutes of streaming and polling, detects and recovers from dropped or
//! degraded connections, and turns raw provider responses into structured
//! citation data.
//!
//! ## Overview
//!
//! Four components cooperate:
//!
//! 1. **[`pool::HandlePool`]** - owns authenticated handles to the remote
//!    service and rotates them on health breaches (request count, age, idle
//!    time, consecutive failures).
//! 2. **[`retry`]** - pure backoff decisions: retry after a jittered delay,
//!    or abandon with a failure kind.
//! 3. **[`citations::CitationExtractor`]** - normalizes provider grounding
//!    metadata into ordered citation records, resolving redirect URLs.
//! 4. **[`orchestrator::Orchestrator`]** - the state machine driving one
//!    task: `Submitting → Streaming ⇄ Reconnecting → terminal`.
//!
//! Rendering, CLI argument parsing, and server transports are external
//! collaborators; this crate exposes a typed surface for them through
//! [`service::ResearchService`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vera::{ResearchRequest, ResearchService, TaskOutcome};
//!
//! #[tokio::main]
//! async fn main() -> vera::Result<()> {
//!     // Requires GEMINI_API_KEY in the environment
//!     let service = ResearchService::from_env()?;
//!
//!     let mut handle = service.submit_task(ResearchRequest::new(
//!         "Compare the memory models of Rust and Zig",
//!     ));
//!
//!     while let Some(event) = handle.progress.recv().await {
//!         println!("[{:?}] {}", event.kind, event.message);
//!     }
//!
//!     match handle.outcome.await.expect("orchestrator panicked") {
//!         TaskOutcome::Completed(report) => {
//!             println!("{}", report.text);
//!             for citation in &report.citations {
//!                 println!("- {} ({})", citation.title, citation.url);
//!             }
//!         }
//!         TaskOutcome::Failed { reason, .. } => eprintln!("failed: {reason}"),
//!         TaskOutcome::Cancelled { .. } => eprintln!("cancelled"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without a network
//!
//! The orchestrator reaches the provider only through the
//! [`transport::ResearchTransport`] trait, and the pool mints transports
//! through [`pool::Connector`]. Inject fakes for both to exercise the full
//! state machine - reconnection, resume validation, health rotation -
//! deterministically.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Citation extraction from provider grounding metadata.
pub mod citations;
/// The task orchestration state machine.
pub mod orchestrator;
/// Connection handle pooling and health tracking.
pub mod pool;
/// Retry and backoff policy.
pub mod retry;
/// Inbound service surface (submit, status, cancel, follow-up).
pub mod service;
/// Transport seam and the production provider implementation.
pub mod transport;
/// Core types (requests, outcomes, errors, grounding metadata).
pub mod types;
/// Configuration and shared helpers.
pub mod utils;

// Re-export commonly used types
pub use citations::{CitationExtractor, HttpUrlResolver, UrlResolver};
pub use orchestrator::Orchestrator;
pub use pool::{ConnectionHandle, Connector, HandleHealthPolicy, HandlePool};
pub use retry::{RetryConfig, RetryDecision};
pub use service::{ResearchService, TaskHandle};
pub use transport::{
    GeminiTransport, GeminiTransportConfig, ProviderState, ProviderStatus, ResearchTransport,
    ResumeToken, StreamEvent,
};
pub use types::{
    CitationRecord, FailureKind, ProgressEvent, ProgressKind, ResearchError, ResearchReport,
    ResearchRequest, Result, TaskOutcome, TaskPhase, TaskSnapshot,
};
pub use utils::config::Config;
