//! Connection handle pooling and health tracking.
//!
//! The pool owns the lifecycle of authenticated channels to the remote
//! research service. Orchestrator instances borrow a handle for the duration
//! of a single attempt and report the outcome back through the pool, which
//! decides at the next `acquire` whether the handle is still fit for use.
//!
//! # Health model
//!
//! A handle is invalidated by breaching any one threshold of
//! [`HandleHealthPolicy`]: cumulative request count, age, idle time, or
//! consecutive failures. Health is evaluated once per acquisition, not
//! continuously. Retry loops must call [`HandlePool::acquire`] on every
//! iteration instead of caching a handle across the whole sequence, since a
//! cached handle never sees health-based refresh after the first attempt.
//!
//! # Success accounting
//!
//! The pool performs no response validation of its own. Callers must verify
//! a response is usable before recording success; the
//! [`HandlePool::record_checked`] helper encodes that ordering in one place.

use crate::transport::ResearchTransport;
use crate::types::{ResearchError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health thresholds for a connection handle. Any single breach invalidates
/// the handle at the next acquisition.
#[derive(Debug, Clone)]
pub struct HandleHealthPolicy {
    /// Maximum requests served by one handle (default: 100)
    pub max_requests: u64,

    /// Maximum handle age (default: 30 minutes)
    pub max_age: Duration,

    /// Maximum idle time since last use (default: 5 minutes)
    ///
    /// Absolute value, configured independently of `max_age`.
    pub max_idle: Duration,

    /// Consecutive failures before forced rotation (default: 3)
    pub max_consecutive_failures: u32,
}

impl Default for HandleHealthPolicy {
    fn default() -> Self {
        Self {
            max_requests: 100,
            max_age: Duration::from_secs(1800),
            max_idle: Duration::from_secs(300),
            max_consecutive_failures: 3,
        }
    }
}

impl HandleHealthPolicy {
    /// Set the request-count threshold.
    pub fn with_max_requests(mut self, max: u64) -> Self {
        self.max_requests = max;
        self
    }

    /// Set the age threshold.
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }

    /// Set the idle-time threshold.
    pub fn with_max_idle(mut self, idle: Duration) -> Self {
        self.max_idle = idle;
        self
    }

    /// Set the consecutive-failure threshold.
    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

/// Mints transports for the pool when a handle must be replaced.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh authenticated transport.
    async fn connect(&self) -> Result<Arc<dyn ResearchTransport>>;
}

struct HandleInner {
    transport: Arc<dyn ResearchTransport>,
    generation: u64,
    created_at: Instant,
    last_used: Mutex<Instant>,
    request_count: AtomicU64,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
}

/// An authenticated channel to the remote service plus its health metadata.
///
/// Cheap to clone; all clones share the same counters. Counters are updated
/// only through the pool's record methods.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(transport: Arc<dyn ResearchTransport>, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(HandleInner {
                transport,
                generation,
                created_at: now,
                last_used: Mutex::new(now),
                request_count: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                total_failures: AtomicU64::new(0),
            }),
        }
    }

    /// The transport behind this handle.
    pub fn transport(&self) -> &dyn ResearchTransport {
        self.inner.transport.as_ref()
    }

    /// Monotonically increasing id; a fresher handle always carries a
    /// strictly greater generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Requests recorded as successful against this handle.
    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::Relaxed)
    }

    /// Failures since the last recorded success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Failures recorded over this handle's whole lifetime.
    pub fn total_failures(&self) -> u64 {
        self.inner.total_failures.load(Ordering::Relaxed)
    }

    /// Name of the first breached health threshold, if any.
    fn health_breach(&self, policy: &HandleHealthPolicy) -> Option<&'static str> {
        if self.request_count() >= policy.max_requests {
            return Some("max_requests");
        }
        if self.inner.created_at.elapsed() >= policy.max_age {
            return Some("max_age");
        }
        if self.inner.last_used.lock().elapsed() >= policy.max_idle {
            return Some("max_idle");
        }
        if self.consecutive_failures() >= policy.max_consecutive_failures {
            return Some("max_consecutive_failures");
        }
        None
    }

    /// Whether this handle passes every threshold of the policy.
    pub fn is_healthy(&self, policy: &HandleHealthPolicy) -> bool {
        self.health_breach(policy).is_none()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation())
            .field("request_count", &self.request_count())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

/// Point-in-time view of the pool, for tests and observability.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Generation of the current handle, if one exists
    pub current_generation: Option<u64>,
    /// Handles minted over the pool's lifetime
    pub total_minted: u64,
}

/// Shared pool holding the single current handle to the remote service.
///
/// Safe to share across concurrently running orchestrator instances; all
/// mutation is serialized internally.
pub struct HandlePool {
    connector: Arc<dyn Connector>,
    policy: HandleHealthPolicy,
    current: Mutex<Option<ConnectionHandle>>,
    next_generation: AtomicU64,
    total_minted: AtomicU64,
}

impl HandlePool {
    /// Pool with no current handle; the first `acquire` mints one.
    pub fn new(connector: Arc<dyn Connector>, policy: HandleHealthPolicy) -> Self {
        Self {
            connector,
            policy,
            current: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            total_minted: AtomicU64::new(0),
        }
    }

    /// The health policy this pool evaluates at acquisition.
    pub fn policy(&self) -> &HandleHealthPolicy {
        &self.policy
    }

    /// Return a healthy handle, minting a new one if none exists or the
    /// current one breaches the health policy.
    ///
    /// Health is checked here and only here; callers that want fresh health
    /// on every retry iteration must re-acquire each time.
    pub async fn acquire(&self) -> Result<ConnectionHandle> {
        if let Some(handle) = self.healthy_current() {
            return Ok(handle);
        }

        // Mint outside the lock; connecting may suspend.
        let transport = self.connector.connect().await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = ConnectionHandle::new(transport, generation);
        self.total_minted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(generation, "minted new connection handle");

        let mut current = self.current.lock();
        // Another orchestrator may have installed a healthy handle while we
        // were connecting; prefer it to keep a single current handle.
        if let Some(existing) = current.as_ref() {
            if existing.is_healthy(&self.policy) {
                return Ok(existing.clone());
            }
        }
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    fn healthy_current(&self) -> Option<ConnectionHandle> {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(handle) => {
                if let Some(breach) = handle.health_breach(&self.policy) {
                    tracing::debug!(
                        generation = handle.generation(),
                        breach,
                        "handle failed health check, will rotate"
                    );
                    *current = None;
                    None
                } else {
                    Some(handle.clone())
                }
            }
            None => None,
        }
    }

    /// Record a successful request against a handle.
    ///
    /// Call only after the response has been independently verified as
    /// usable; prefer [`Self::record_checked`], which enforces that order.
    pub fn record_success(&self, handle: &ConnectionHandle) {
        handle.inner.request_count.fetch_add(1, Ordering::Relaxed);
        handle.inner.consecutive_failures.store(0, Ordering::Relaxed);
        *handle.inner.last_used.lock() = Instant::now();
    }

    /// Record a failed request against a handle.
    ///
    /// Applies to every real request (submission, stream open, resume,
    /// status poll, follow-up), including calls that returned without
    /// transport error but produced an unusable response.
    pub fn record_failure(&self, handle: &ConnectionHandle) {
        let consecutive = handle
            .inner
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        handle.inner.total_failures.fetch_add(1, Ordering::Relaxed);
        *handle.inner.last_used.lock() = Instant::now();
        if consecutive >= self.policy.max_consecutive_failures {
            tracing::warn!(
                generation = handle.generation(),
                consecutive,
                "handle reached consecutive-failure threshold"
            );
        }
    }

    /// Validate-then-record: the single place where a response outcome
    /// becomes a health event.
    ///
    /// Success is recorded only when the call returned `Ok` *and* the value
    /// passes `usable`. An `Ok` that fails validation records a failure and
    /// is turned into [`ResearchError::ResumptionInvalid`]; it is never
    /// silently promoted to success.
    pub fn record_checked<T>(
        &self,
        handle: &ConnectionHandle,
        result: Result<T>,
        usable: impl FnOnce(&T) -> bool,
    ) -> Result<T> {
        match result {
            Ok(value) if usable(&value) => {
                self.record_success(handle);
                Ok(value)
            }
            Ok(_) => {
                self.record_failure(handle);
                Err(ResearchError::ResumptionInvalid(
                    "response returned without error but failed validation".to_string(),
                ))
            }
            Err(err) => {
                self.record_failure(handle);
                Err(err)
            }
        }
    }

    /// Force the next `acquire` to mint a new handle, regardless of health.
    ///
    /// A no-op if the pool has already rotated past the given handle.
    pub fn invalidate(&self, handle: &ConnectionHandle) {
        let mut current = self.current.lock();
        if let Some(existing) = current.as_ref() {
            if existing.generation() == handle.generation() {
                tracing::debug!(
                    generation = handle.generation(),
                    "handle explicitly invalidated"
                );
                *current = None;
            }
        }
    }

    /// Pool statistics for tests and observability.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            current_generation: self.current.lock().as_ref().map(|h| h.generation()),
            total_minted: self.total_minted.load(Ordering::Relaxed),
        }
    }
}
