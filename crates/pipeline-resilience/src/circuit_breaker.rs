//! Circuit breaker pattern implementation.
//!
//! The circuit breaker prevents cascading failures by stopping requests
//! to a failing upstream and allowing it time to recover.
//!
//! Failures are counted over a sliding time window. Once the window holds
//! `failure_threshold` failures the circuit opens and every call is rejected
//! until `reset_timeout` has elapsed. The next admission check moves the
//! circuit to half-open, where at most `half_open_requests` probes are let
//! through: any probe failure reopens it, `ceil(half_open_requests / 2)`
//! probe successes close it.
//!
//! The breaker never logs. State changes and outcomes are reported to
//! [`CircuitBreakerListener`]s; [`TracingListener`] forwards them to `tracing`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the upstream recovered
    HalfOpen,
}

impl CircuitState {
    /// Stable string form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric form for gauges
    #[must_use]
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,
    /// Time spent open before probing
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Probe slots while half-open
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(120),
            half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Probe successes needed to close from half-open
    #[must_use]
    pub fn success_quota(&self) -> u32 {
        self.half_open_requests.div_ceil(2).max(1)
    }
}

/// What happened on a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEventKind {
    /// State transition
    StateChange {
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// A call succeeded
    Success,
    /// A call failed
    Failure,
    /// A call was rejected without being attempted
    Rejected,
    /// A rejected call was answered by a fallback
    Fallback,
}

/// Observability event emitted by a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitEvent {
    /// Upstream target name
    pub target: String,
    /// Event kind
    pub kind: CircuitEventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Failures currently in the sliding window
    pub failure_count: u32,
}

/// Receives breaker events
pub trait CircuitBreakerListener: Send + Sync {
    /// Handle one event. Called outside the breaker's lock.
    fn on_event(&self, event: &CircuitEvent);
}

/// Forwards breaker events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl CircuitBreakerListener for TracingListener {
    fn on_event(&self, event: &CircuitEvent) {
        match event.kind {
            CircuitEventKind::StateChange { from, to } => match to {
                CircuitState::Open => warn!(
                    upstream = %event.target,
                    from = %from,
                    failure_count = event.failure_count,
                    "Circuit breaker opened"
                ),
                CircuitState::HalfOpen => info!(
                    upstream = %event.target,
                    "Circuit breaker half-open, probing"
                ),
                CircuitState::Closed => info!(
                    upstream = %event.target,
                    from = %from,
                    "Circuit breaker closed"
                ),
            },
            CircuitEventKind::Failure => debug!(
                upstream = %event.target,
                failure_count = event.failure_count,
                "Circuit breaker recorded failure"
            ),
            CircuitEventKind::Rejected => debug!(
                upstream = %event.target,
                "Circuit breaker rejected call"
            ),
            CircuitEventKind::Fallback => debug!(
                upstream = %event.target,
                "Circuit breaker served fallback"
            ),
            CircuitEventKind::Success => {}
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, call allowed
    Allowed,
    /// Half-open circuit, call admitted as a probe
    Probe,
    /// Open circuit, call rejected
    RejectedOpen,
    /// Half-open circuit with every probe slot taken
    RejectedSaturated,
}

impl Admission {
    /// Whether the call may proceed
    #[must_use]
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Allowed | Self::Probe)
    }
}

/// An admitted call.
///
/// Recording an outcome consumes the permit. A permit dropped without one,
/// for instance when the call's future is cancelled, gives its probe slot
/// back.
#[must_use = "dropping a permit releases it without recording an outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    /// How the call was admitted
    #[must_use]
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Record a failed call
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("target", &self.breaker.target)
            .field("admission", &self.admission)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}

/// Successful result of [`CircuitBreaker::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution<T> {
    /// Returned value
    pub value: T,
    /// The value came from the fallback, not the protected call
    pub from_fallback: bool,
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit open; the call was not attempted
    #[error("Circuit breaker open for {target}")]
    Open {
        /// Upstream target name
        target: String,
    },
    /// Circuit half-open and every probe slot is taken
    #[error("Circuit breaker half-open for {target}, probe slots exhausted")]
    HalfOpenSaturated {
        /// Upstream target name
        target: String,
    },
    /// The protected call failed
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Upstream target name
    pub target: String,
    /// Current state
    pub state: CircuitState,
    /// Failures in the sliding window
    pub failure_count: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Probes admitted since entering half-open
    pub half_open_probes: u32,
    /// Probe successes since entering half-open
    pub half_open_successes: u32,
    /// Calls recorded since creation
    pub total_requests: u64,
    /// Successful calls since creation
    pub total_successes: u64,
    /// Last recorded success
    pub last_success: Option<DateTime<Utc>>,
    /// Last recorded failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Milliseconds until an open circuit starts probing
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    half_open_probes: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    total_requests: u64,
    total_successes: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_successes: 0,
            half_open_probes: 0,
            half_open_successes: 0,
            opened_at: None,
            last_success: None,
            last_failure: None,
            total_requests: 0,
            total_successes: 0,
        }
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_count(&self) -> u32 {
        u32::try_from(self.failures.len()).unwrap_or(u32::MAX)
    }
}

/// Circuit breaker for a single upstream target
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(Inner::new()),
            listeners: Vec::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(target: impl Into<String>) -> Self {
        Self::new(target, CircuitBreakerConfig::default())
    }

    /// Attach a listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Get the target name
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying a due OPEN -> HALF_OPEN transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut events = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.refresh(&mut inner, Instant::now(), &mut events);
            inner.state
        };
        self.emit(events);
        state
    }

    /// Whether a call would be allowed right now.
    ///
    /// False only while strictly open. Does not consume a probe slot.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Admit a call, consuming a probe slot when half-open
    #[must_use]
    pub fn try_acquire(&self) -> Admission {
        let mut events = Vec::new();
        let admission = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut events);
            let admission = match inner.state {
                CircuitState::Closed => Admission::Allowed,
                CircuitState::Open => Admission::RejectedOpen,
                CircuitState::HalfOpen => {
                    if inner.half_open_probes < self.config.half_open_requests {
                        inner.half_open_probes += 1;
                        Admission::Probe
                    } else {
                        Admission::RejectedSaturated
                    }
                }
            };
            if !admission.is_admitted() {
                events.push(self.event(&inner, CircuitEventKind::Rejected));
            }
            admission
        };
        self.emit(events);
        admission
    }

    /// Admit a call and hold the admission in a [`Permit`]
    ///
    /// # Errors
    /// Returns the rejecting [`Admission`] when the circuit refuses the call
    pub fn acquire(&self) -> Result<Permit<'_>, Admission> {
        let admission = self.try_acquire();
        if admission.is_admitted() {
            Ok(Permit {
                breaker: self,
                admission,
                settled: false,
            })
        } else {
            Err(admission)
        }
    }

    /// Give back a probe slot for a call that produced no verdict
    pub fn release(&self, admission: Admission) {
        if admission != Admission::Probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut events);
            inner.total_requests += 1;
            inner.total_successes += 1;
            inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            inner.last_success = Some(Utc::now());
            events.push(self.event(&inner, CircuitEventKind::Success));

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_quota() {
                    self.transition(&mut inner, CircuitState::Closed, now, &mut events);
                }
            }
        }
        self.emit(events);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut events);
            inner.total_requests += 1;
            inner.consecutive_successes = 0;
            inner.last_failure = Some(Utc::now());
            inner.failures.push_back(now);
            inner.evict(now, self.config.failure_window);
            events.push(self.event(&inner, CircuitEventKind::Failure));

            match inner.state {
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open, now, &mut events);
                }
                CircuitState::Closed if inner.failure_count() >= self.config.failure_threshold => {
                    self.transition(&mut inner, CircuitState::Open, now, &mut events);
                }
                CircuitState::Closed | CircuitState::Open => {}
            }
        }
        self.emit(events);
    }

    /// Run `operation` under breaker protection.
    ///
    /// # Errors
    /// Returns a rejection when the circuit refuses the call, or the
    /// operation's own error (recorded as a failure)
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
    ) -> Result<Execution<T>, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.acquire() {
            Ok(permit) => Self::run(permit, operation).await,
            Err(admission) => Err(self.rejection(admission)),
        }
    }

    /// Run `operation`, answering from `fallback` when the circuit rejects.
    ///
    /// A fallback answer does not change breaker counters.
    ///
    /// # Errors
    /// Returns the operation's own error (recorded as a failure)
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<Execution<T>, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = T>,
    {
        let Ok(permit) = self.acquire() else {
            let event = {
                let inner = self.inner.lock();
                self.event(&inner, CircuitEventKind::Fallback)
            };
            self.emit(vec![event]);
            return Ok(Execution {
                value: fallback().await,
                from_fallback: true,
            });
        };
        Self::run(permit, operation).await
    }

    async fn run<F, Fut, T, E>(
        permit: Permit<'_>,
        operation: F,
    ) -> Result<Execution<T>, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(Execution {
                    value,
                    from_fallback: false,
                })
            }
            Err(error) => {
                permit.failure();
                Err(CircuitBreakerError::Inner(error))
            }
        }
    }

    fn rejection<E>(&self, admission: Admission) -> CircuitBreakerError<E> {
        let target = self.target.clone();
        match admission {
            Admission::RejectedSaturated => CircuitBreakerError::HalfOpenSaturated { target },
            Admission::Allowed | Admission::Probe | Admission::RejectedOpen => {
                CircuitBreakerError::Open { target }
            }
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Closed, Instant::now(), &mut events);
        }
        self.emit(events);
    }

    /// Force the circuit open (for testing or manual intervention)
    pub fn force_open(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Open, Instant::now(), &mut events);
        }
        self.emit(events);
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut events = Vec::new();
        let snapshot = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut events);
            inner.evict(now, self.config.failure_window);
            let retry_after_ms = match (inner.state, inner.opened_at) {
                (CircuitState::Open, Some(opened_at)) => Some(
                    self.config
                        .reset_timeout
                        .saturating_sub(now.duration_since(opened_at))
                        .as_millis() as u64,
                ),
                _ => None,
            };
            CircuitSnapshot {
                target: self.target.clone(),
                state: inner.state,
                failure_count: inner.failure_count(),
                consecutive_successes: inner.consecutive_successes,
                half_open_probes: inner.half_open_probes,
                half_open_successes: inner.half_open_successes,
                total_requests: inner.total_requests,
                total_successes: inner.total_successes,
                last_success: inner.last_success,
                last_failure: inner.last_failure,
                retry_after_ms,
            }
        };
        self.emit(events);
        snapshot
    }

    fn refresh(&self, inner: &mut Inner, now: Instant, events: &mut Vec<CircuitEvent>) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_some_and(|opened_at| now.duration_since(opened_at) >= self.config.reset_timeout);
        if due {
            self.transition(inner, CircuitState::HalfOpen, now, events);
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: CircuitState,
        now: Instant,
        events: &mut Vec<CircuitEvent>,
    ) {
        let from = inner.state;
        inner.state = to;
        inner.half_open_probes = 0;
        inner.half_open_successes = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.failures.clear();
            }
        }
        if from != to {
            events.push(self.event(inner, CircuitEventKind::StateChange { from, to }));
        }
    }

    fn event(&self, inner: &Inner, kind: CircuitEventKind) -> CircuitEvent {
        CircuitEvent {
            target: self.target.clone(),
            kind,
            timestamp: Utc::now(),
            failure_count: inner.failure_count(),
        }
    }

    fn emit(&self, events: Vec<CircuitEvent>) {
        for event in &events {
            for listener in &self.listeners {
                listener.on_event(event);
            }
        }
    }
}
