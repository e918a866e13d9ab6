//! Telemetry events emitted by the resilience middleware.
//!
//! Events flow through [`TelemetrySink`] implementations, which are plain
//! `tower::Service<PolicyEvent>`s so they compose with ordinary tower
//! combinators. Emission is best-effort: a sink that is not ready or that
//! fails never affects the request being processed.
//!
//! - **Rate limit**: `Denied`
//! - **Circuit breaker**: `Opened`, `HalfOpen`, `Closed`
//! - **Requests**: `Success`, `Failure`, `Rejected`
//!
//! ```rust
//! use tripwire::telemetry::{PolicyEvent, RequestOutcome};
//! use std::time::Duration;
//!
//! let event = PolicyEvent::Request(RequestOutcome::Success {
//!     resource: "user_service".into(),
//!     duration: Duration::from_millis(50),
//! });
//! assert_eq!(event.to_string(), "Request::Success(user_service, duration=50ms)");
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

use crate::circuit_breaker::{CircuitState, Transition};
use crate::rate_limit::DenyReason;

/// A telemetry sink that consumes policy events.
pub trait TelemetrySink:
    tower::Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: tower::Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Policy events emitted while admitting and forwarding calls.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Rate limiter events
    RateLimit(RateLimitEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// Request outcome events
    Request(RequestOutcome),
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A call was rejected before reaching any breaker.
    Denied {
        /// Suggested retry delay
        wait: Duration,
        reason: DenyReason,
    },
}

/// Circuit breaker state changes, tagged with the breaker's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Calls are now rejected until the half-open timeout elapses.
    Opened { breaker: String },
    /// A limited number of probe calls are let through.
    HalfOpen { breaker: String },
    /// Normal operation resumes.
    Closed { breaker: String },
}

impl CircuitBreakerEvent {
    /// Event describing `transition` of the breaker named `breaker`.
    pub fn from_transition(breaker: impl Into<String>, transition: Transition) -> Self {
        let breaker = breaker.into();
        match transition.to {
            CircuitState::Open => CircuitBreakerEvent::Opened { breaker },
            CircuitState::HalfOpen => CircuitBreakerEvent::HalfOpen { breaker },
            CircuitState::Closed => CircuitBreakerEvent::Closed { breaker },
        }
    }
}

/// How a call through the middleware ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Forwarded and classified as a success.
    Success { resource: String, duration: Duration },
    /// Forwarded and classified as a failure (including timeouts).
    Failure { resource: String, duration: Duration },
    /// Never forwarded: the circuit breaker denied admission.
    Rejected { resource: String },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Denied { wait, reason } => {
                write!(f, "Denied({}, wait={:?})", reason, wait)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { breaker } => write!(f, "Opened({})", breaker),
            CircuitBreakerEvent::HalfOpen { breaker } => write!(f, "HalfOpen({})", breaker),
            CircuitBreakerEvent::Closed { breaker } => write!(f, "Closed({})", breaker),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { resource, duration } => {
                write!(f, "Success({}, duration={:?})", resource, duration)
            }
            RequestOutcome::Failure { resource, duration } => {
                write!(f, "Failure({}, duration={:?})", resource, duration)
            }
            RequestOutcome::Rejected { resource } => write!(f, "Rejected({})", resource),
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events at INFO through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(event = %event, "policy_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A bounded in-memory sink; the oldest events are evicted once full.
///
/// ```rust
/// use tripwire::telemetry::{MemorySink, PolicyEvent, CircuitBreakerEvent};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
///     breaker: "user_service".into(),
/// });
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.guard().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut guard = self.guard();
        // Oldest events go first once the buffer is full.
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
