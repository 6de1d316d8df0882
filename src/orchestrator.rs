//! The task orchestration state machine.
//!
//! One [`Orchestrator`] drives one research task end-to-end:
//!
//! ```text
//! Submitting → Streaming ⇄ Reconnecting → {Completed | Failed | Cancelled}
//! ```
//!
//! Every network attempt borrows a handle from the shared [`HandlePool`]
//! for the duration of that attempt and feeds its outcome back through the
//! pool's validate-then-record helper: stream opens, resumes, status polls,
//! and pushed error notifications all count. Retry loops re-acquire a handle
//! on every iteration so health-based rotation applies to each attempt, not
//! just the first. Cancellation is checked at every suspension point,
//! including backoff sleeps.

use crate::citations::CitationExtractor;
use crate::pool::{ConnectionHandle, HandlePool};
use crate::retry::{next_decision, RetryConfig, RetryDecision};
use crate::transport::{EventStream, ProviderState, ProviderStatus, StreamEvent};
use crate::types::{
    ProgressEvent, ProgressKind, RawResearchOutput, ReportMetadata, ResearchError,
    ResearchReport, ResearchRequest, Result, TaskOutcome, TaskPhase, TaskSnapshot, TaskStats,
};
use crate::utils::config::OrchestratorConfig;
use crate::utils::format_duration;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Snapshot cell shared with the inbound service for `get_status`.
pub type SharedSnapshot = Arc<parking_lot::Mutex<TaskSnapshot>>;

/// Internal per-task state. Owned by one orchestrator for the task's whole
/// lifetime; never shared across concurrent orchestration attempts.
struct TaskState {
    key: Uuid,
    task_id: String,
    phase: TaskPhase,
    progress: Vec<ProgressEvent>,
    resume_token: Option<crate::transport::ResumeToken>,
    stats: TaskStats,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl TaskState {
    fn new(key: Uuid) -> Self {
        Self {
            key,
            task_id: String::new(),
            phase: TaskPhase::Submitting,
            progress: Vec::new(),
            resume_token: None,
            stats: TaskStats::default(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Forward-only transition; terminal phases never regress.
    fn set_phase(&mut self, phase: TaskPhase) {
        if self.phase.is_terminal() {
            debug_assert!(false, "phase transition out of terminal {:?}", self.phase);
            return;
        }
        tracing::debug!(task_id = %self.task_id, from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            key: self.key,
            task_id: (!self.task_id.is_empty()).then(|| self.task_id.clone()),
            phase: self.phase,
            events_seen: self.progress.len(),
            last_message: self.progress.last().map(|e| e.message.clone()),
            stats: self.stats,
            started_at: self.started_at,
        }
    }
}

/// A progress stream together with the handle it was opened on. The handle
/// stays borrowed for the stream's lifetime so stream-level failures can be
/// charged to it.
struct ActiveStream {
    handle: ConnectionHandle,
    stream: EventStream,
}

/// What ended a streaming interval.
enum StreamEnd {
    /// Provider closed the stream normally; completion is found by polling
    Graceful,
    /// Transport broke mid-stream
    Broken(ResearchError),
}

/// Drives a single research task through the phase machine.
pub struct Orchestrator {
    pool: Arc<HandlePool>,
    retry: RetryConfig,
    timing: OrchestratorConfig,
    extractor: CitationExtractor,
    cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    snapshot_cell: Option<SharedSnapshot>,
    key: Uuid,
}

impl Orchestrator {
    /// Orchestrator with a fresh task key and no external wiring.
    pub fn new(
        pool: Arc<HandlePool>,
        retry: RetryConfig,
        timing: OrchestratorConfig,
        extractor: CitationExtractor,
    ) -> Self {
        Self {
            pool,
            retry,
            timing,
            extractor,
            cancel: CancellationToken::new(),
            progress_tx: None,
            snapshot_cell: None,
            key: Uuid::new_v4(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Deliver progress events through a bounded channel. Use capacity 1 to
    /// guarantee at most one pending event; delivery order always matches
    /// receipt order.
    pub fn with_progress_channel(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Mirror task state into a shared snapshot cell for status queries.
    pub fn with_snapshot_cell(mut self, cell: SharedSnapshot) -> Self {
        self.snapshot_cell = Some(cell);
        self
    }

    /// Token that cancels this orchestrator when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Crate-assigned key for this task.
    pub fn key(&self) -> Uuid {
        self.key
    }

    /// Run the task to a terminal outcome. Transient errors are absorbed by
    /// the retry policy; the returned outcome is the only thing the caller
    /// sees.
    pub async fn run(self, request: ResearchRequest) -> TaskOutcome {
        let mut task = TaskState::new(self.key);
        tracing::info!(key = %self.key, query = %truncate(&request.query, 100), "research task starting");

        let outcome = match self.drive(&request, &mut task).await {
            Ok(report) => {
                task.set_phase(TaskPhase::Completed);
                self.publish(&task);
                tracing::info!(
                    task_id = %task.task_id,
                    elapsed = %format_duration(task.started.elapsed()),
                    citations = report.citations.len(),
                    "research task completed"
                );
                TaskOutcome::Completed(report)
            }
            Err(ResearchError::Cancelled) => {
                task.set_phase(TaskPhase::Cancelled);
                self.publish(&task);
                tracing::info!(task_id = %task.task_id, "research task cancelled");
                TaskOutcome::Cancelled {
                    progress: std::mem::take(&mut task.progress),
                    stats: task.stats,
                }
            }
            Err(err) => {
                task.set_phase(TaskPhase::Failed);
                self.publish(&task);
                let reason = format!(
                    "{} after {} ({} submit attempts, {} reconnects, {} polls)",
                    err,
                    format_duration(task.started.elapsed()),
                    task.stats.submit_attempts,
                    task.stats.reconnects,
                    task.stats.polls,
                );
                tracing::error!(task_id = %task.task_id, %reason, "research task failed");
                TaskOutcome::Failed {
                    kind: err.failure_kind(),
                    reason,
                    progress: std::mem::take(&mut task.progress),
                    stats: task.stats,
                }
            }
        };
        outcome
    }

    async fn drive(
        &self,
        request: &ResearchRequest,
        task: &mut TaskState,
    ) -> Result<Box<ResearchReport>> {
        self.publish(task);
        task.task_id = self.submit_with_retry(request, task).await?;
        task.set_phase(TaskPhase::Streaming);
        self.publish(task);

        // Initial stream; `Ok` here is already a usable stream by type, so
        // no first-event validation is required yet.
        let mut active = self.establish_with_retry(task, false).await?;

        loop {
            match self.consume(task, &mut active).await? {
                StreamEnd::Graceful => break,
                StreamEnd::Broken(err) => {
                    // The open attempt on this handle was already recorded;
                    // the reconnect attempts carry the failure accounting
                    // from here.
                    tracing::warn!(
                        task_id = %task.task_id,
                        error = %err,
                        "stream broke, entering reconnect"
                    );
                    task.set_phase(TaskPhase::Reconnecting);
                    self.publish(task);

                    active = self.establish_with_retry(task, true).await?;
                    task.stats.reconnects += 1;
                    task.set_phase(TaskPhase::Streaming);
                    self.publish(task);
                }
            }
        }
        drop(active);

        self.await_completion(task).await?;
        let raw = self.fetch_with_retry(task).await?;
        let citations = self.extractor.extract(&raw).await;

        Ok(Box::new(ResearchReport {
            text: raw.text,
            citations,
            metadata: ReportMetadata {
                task_id: task.task_id.clone(),
                elapsed: task.started.elapsed(),
                stats: task.stats,
                final_phase: TaskPhase::Completed,
            },
        }))
    }

    // ============= Submitting =============

    async fn submit_with_retry(
        &self,
        request: &ResearchRequest,
        task: &mut TaskState,
    ) -> Result<String> {
        let mut attempt: u32 = 1;
        let sequence_start = Instant::now();
        loop {
            let err = match self.try_submit(request, task).await {
                Ok(task_id) => return Ok(task_id),
                Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                Err(err) => err,
            };
            attempt = self
                .backoff_or_abandon("submission", attempt, sequence_start, err)
                .await?;
        }
    }

    async fn try_submit(&self, request: &ResearchRequest, task: &mut TaskState) -> Result<String> {
        // Re-acquired on every retry iteration so each attempt sees a
        // health-checked handle.
        let handle = self.pool.acquire().await?;
        task.stats.submit_attempts += 1;

        let result = self
            .guarded("submit", handle.transport().submit(request))
            .await;
        if matches!(result, Err(ResearchError::Cancelled)) {
            return Err(ResearchError::Cancelled);
        }
        self.pool
            .record_checked(&handle, result, |task_id| !task_id.is_empty())
    }

    // ============= Streaming / Reconnecting =============

    async fn establish_with_retry(
        &self,
        task: &mut TaskState,
        validate_first: bool,
    ) -> Result<ActiveStream> {
        let mut attempt: u32 = 1;
        let sequence_start = Instant::now();
        loop {
            let err = match self.try_establish(task, validate_first).await {
                Ok(active) => return Ok(active),
                Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                Err(err) => err,
            };
            attempt = self
                .backoff_or_abandon("stream connect", attempt, sequence_start, err)
                .await?;
        }
    }

    async fn try_establish(
        &self,
        task: &mut TaskState,
        validate_first: bool,
    ) -> Result<ActiveStream> {
        let handle = self.pool.acquire().await?;

        let opened = match &task.resume_token {
            Some(token) => {
                self.guarded(
                    "resume stream",
                    handle.transport().resume_stream(&task.task_id, token),
                )
                .await
            }
            None => {
                self.guarded("open stream", handle.transport().open_stream(&task.task_id))
                    .await
            }
        };
        if matches!(opened, Err(ResearchError::Cancelled)) {
            return Err(ResearchError::Cancelled);
        }

        if !validate_first {
            let stream = self.pool.record_checked(&handle, opened, |_| true)?;
            return Ok(ActiveStream { handle, stream });
        }

        // Success is recorded only after the resumed stream proves usable by
        // yielding its first event. An empty stream is a failure for health
        // accounting even though the call itself returned without error.
        let peeked: Result<(StreamEvent, EventStream)> = match opened {
            Ok(mut stream) => {
                let first = self
                    .guarded("first resumed event", async { Ok(stream.next().await) })
                    .await;
                match first {
                    Ok(Some(Ok(event))) => Ok((event, stream)),
                    Ok(Some(Err(err))) => Err(err),
                    Ok(None) => Err(ResearchError::ResumptionInvalid(
                        "resumed stream ended before yielding any event".to_string(),
                    )),
                    Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        let (first, stream) = self.pool.record_checked(&handle, peeked, |_| true)?;
        self.record_event(task, &handle, first).await?;
        Ok(ActiveStream { handle, stream })
    }

    /// Consume events until the stream ends, breaks, or stalls. A stream
    /// that goes silent for longer than the idle timeout is treated as
    /// broken so the reconnect path fires; only cancellation and the
    /// overall deadline surface as errors.
    async fn consume(&self, task: &mut TaskState, active: &mut ActiveStream) -> Result<StreamEnd> {
        loop {
            let remaining = self
                .timing
                .max_wait
                .checked_sub(task.started.elapsed())
                .ok_or_else(|| self.deadline_error(task))?;

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ResearchError::Cancelled),
                _ = tokio::time::sleep(remaining) => return Err(self.deadline_error(task)),
                _ = tokio::time::sleep(self.timing.idle_timeout) => {
                    return Ok(StreamEnd::Broken(ResearchError::Timeout(format!(
                        "no stream event within {}",
                        format_duration(self.timing.idle_timeout)
                    ))));
                }
                next = active.stream.next() => match next {
                    Some(Ok(event)) => self.record_event(task, &active.handle, event).await?,
                    Some(Err(err)) => return Ok(StreamEnd::Broken(err)),
                    None => return Ok(StreamEnd::Graceful),
                },
            }
        }
    }

    /// Fold one received event into task state and deliver it onward.
    async fn record_event(
        &self,
        task: &mut TaskState,
        handle: &ConnectionHandle,
        event: StreamEvent,
    ) -> Result<()> {
        if event.kind == ProgressKind::Error {
            // An error notification pushed by the service counts toward
            // failure tracking like any active request failure.
            self.pool.record_failure(handle);
            tracing::warn!(task_id = %task.task_id, detail = %event.content, "provider pushed error event");
        } else if let Some(cursor) = &event.cursor {
            // Confirmed forward progress from a validated stream is the only
            // thing allowed to move the resumption token.
            task.resume_token = Some(cursor.clone());
        }

        let progress = ProgressEvent::new(event.kind, event.content);
        task.progress.push(progress.clone());
        self.publish(task);

        if let Some(tx) = &self.progress_tx {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ResearchError::Cancelled),
                sent = tx.send(progress) => {
                    if sent.is_err() {
                        tracing::debug!("progress receiver dropped, accumulating only");
                    }
                }
            }
        }
        Ok(())
    }

    // ============= Completion polling =============

    async fn await_completion(&self, task: &mut TaskState) -> Result<()> {
        let mut attempt: u32 = 1;
        let mut sequence_start = Instant::now();
        loop {
            if task.started.elapsed() >= self.timing.max_wait {
                return Err(self.deadline_error(task));
            }

            match self.try_poll(task).await {
                Ok(status) => {
                    // A usable poll response resets the retry sequence.
                    attempt = 1;
                    sequence_start = Instant::now();
                    match status.state {
                        ProviderState::Running => {
                            tracing::debug!(
                                task_id = %task.task_id,
                                elapsed = %format_duration(task.started.elapsed()),
                                "research still in progress"
                            );
                            self.sleep_cancellable(self.timing.poll_interval).await?;
                        }
                        ProviderState::Completed => return Ok(()),
                        ProviderState::Failed => {
                            return Err(provider_terminal("RESEARCH_FAILED", status))
                        }
                        ProviderState::Cancelled => {
                            return Err(provider_terminal("RESEARCH_CANCELLED", status))
                        }
                    }
                }
                Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                Err(err) => {
                    attempt = self
                        .backoff_or_abandon("status poll", attempt, sequence_start, err)
                        .await?;
                }
            }
        }
    }

    /// A status poll is a real request: it feeds the same success/failure
    /// accounting as streaming and reconnection.
    async fn try_poll(&self, task: &mut TaskState) -> Result<ProviderStatus> {
        let handle = self.pool.acquire().await?;
        task.stats.polls += 1;

        let result = self
            .guarded("status poll", handle.transport().poll_status(&task.task_id))
            .await;
        if matches!(result, Err(ResearchError::Cancelled)) {
            return Err(ResearchError::Cancelled);
        }
        self.pool.record_checked(&handle, result, |_| true)
    }

    // ============= Result fetch =============

    async fn fetch_with_retry(&self, task: &mut TaskState) -> Result<RawResearchOutput> {
        let mut attempt: u32 = 1;
        let sequence_start = Instant::now();
        loop {
            let err = match self.try_fetch(task).await {
                Ok(raw) => return Ok(raw),
                Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                Err(err) => err,
            };
            attempt = self
                .backoff_or_abandon("result fetch", attempt, sequence_start, err)
                .await?;
        }
    }

    async fn try_fetch(&self, task: &TaskState) -> Result<RawResearchOutput> {
        let handle = self.pool.acquire().await?;

        let result = self
            .guarded("result fetch", handle.transport().fetch_result(&task.task_id))
            .await;
        if matches!(result, Err(ResearchError::Cancelled)) {
            return Err(ResearchError::Cancelled);
        }
        self.pool.record_checked(&handle, result, |_| true)
    }

    // ============= Shared machinery =============

    /// Consult the retry policy after a failed attempt; sleeps through the
    /// backoff (cancellable) and returns the next attempt number, or the
    /// original error on abandon.
    async fn backoff_or_abandon(
        &self,
        what: &str,
        attempt: u32,
        sequence_start: Instant,
        err: ResearchError,
    ) -> Result<u32> {
        match next_decision(attempt, sequence_start.elapsed(), &err, &self.retry) {
            RetryDecision::RetryAfter {
                delay,
                attempt: next,
            } => {
                tracing::info!(what, attempt, ?delay, error = %err, "attempt failed, backing off");
                self.sleep_cancellable(delay).await?;
                Ok(next)
            }
            RetryDecision::Abandon { .. } => Err(err),
        }
    }

    /// Wrap a transport call with cancellation and the per-call timeout.
    async fn guarded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ResearchError::Cancelled),
            out = tokio::time::timeout(self.timing.request_timeout, fut) => match out {
                Ok(result) => result,
                Err(_) => Err(ResearchError::Timeout(format!(
                    "{what} exceeded {}",
                    format_duration(self.timing.request_timeout)
                ))),
            },
        }
    }

    /// Backoff sleeps are themselves cancellable; cancellation never waits
    /// out an in-flight delay.
    async fn sleep_cancellable(&self, delay: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ResearchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn deadline_error(&self, task: &TaskState) -> ResearchError {
        ResearchError::Timeout(format!(
            "research timed out after {} (deadline {})",
            format_duration(task.started.elapsed()),
            format_duration(self.timing.max_wait),
        ))
    }

    fn publish(&self, task: &TaskState) {
        if let Some(cell) = &self.snapshot_cell {
            *cell.lock() = task.snapshot();
        }
    }
}

fn provider_terminal(code: &str, status: ProviderStatus) -> ResearchError {
    ResearchError::ProviderFatal {
        code: code.to_string(),
        message: status
            .detail
            .unwrap_or_else(|| "no detail reported".to_string()),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_never_regresses_from_terminal() {
        let mut task = TaskState::new(Uuid::new_v4());
        task.set_phase(TaskPhase::Streaming);
        task.set_phase(TaskPhase::Cancelled);

        // Release builds ignore the transition instead of regressing
        if !cfg!(debug_assertions) {
            task.set_phase(TaskPhase::Streaming);
            assert_eq!(task.phase, TaskPhase::Cancelled);
        }
    }

    #[test]
    fn test_snapshot_reflects_progress() {
        let mut task = TaskState::new(Uuid::new_v4());
        task.task_id = "task-9".to_string();
        task.progress
            .push(ProgressEvent::new(ProgressKind::Thought, "weighing sources"));

        let snapshot = task.snapshot();
        assert_eq!(snapshot.task_id.as_deref(), Some("task-9"));
        assert_eq!(snapshot.events_seen, 1);
        assert_eq!(snapshot.last_message.as_deref(), Some("weighing sources"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("shrt", 100), "shrt");
    }
}
