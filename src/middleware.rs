//! Tower middleware combining the shared rate limiter with per-resource
//! circuit breakers.
//!
//! For every call the service:
//! 1. takes a token from the limiter, rejecting with
//!    [`ResilienceError::RateLimited`] when none is available;
//! 2. resolves the breaker for the call's resource and asks it for admission,
//!    rejecting with [`ResilienceError::CircuitOpen`] when denied (no breaker
//!    configured means the call is admitted unprotected);
//! 3. forwards the call;
//! 4. classifies the result and records it on the breaker.
//!
//! With a call timeout set, steps 1-3 share one deadline. A limiter that has
//! not answered by then denies the call, and a call still pending gets
//! [`ResilienceError::Timeout`]. Recording gets its own window of the same
//! length so a timed-out call is still counted as a failure.
//!
//! ```rust
//! use std::sync::Arc;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//! use tripwire::{
//!     BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, InMemoryCounterStore,
//!     ResilienceLayer, TokenBucket, TokenBucketConfig,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(InMemoryCounterStore::new());
//! let limiter = TokenBucket::new(store.clone(), TokenBucketConfig::new("api", 10, 10).unwrap());
//! let registry = BreakerRegistry::new();
//! registry.register(CircuitBreaker::new("user_service", CircuitBreakerConfig::default(), store));
//!
//! let svc = ServiceBuilder::new()
//!     .layer(ResilienceLayer::new(Arc::new(limiter), registry))
//!     .service(service_fn(|path: String| async move {
//!         Ok::<_, std::io::Error>(format!("handled {path}"))
//!     }));
//!
//! let reply = svc.oneshot("/user/info".to_string()).await.unwrap();
//! assert_eq!(reply, "handled /user/info");
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

use crate::circuit_breaker_registry::{BreakerRegistry, PathPrefixNamer, ResourceNamer};
use crate::classify::{DefaultClassifier, FailureClassifier};
use crate::rate_limit::{Decision, DenyReason, RateLimiter};
use crate::telemetry::{
    emit_best_effort, CircuitBreakerEvent, NullSink, PolicyEvent, RateLimitEvent, RequestOutcome,
    TelemetrySink,
};
use crate::ResilienceError;

/// A layer that rate limits calls and guards them with circuit breakers.
pub struct ResilienceLayer<N = PathPrefixNamer, C = DefaultClassifier, T = NullSink> {
    limiter: Arc<dyn RateLimiter>,
    registry: BreakerRegistry,
    namer: Arc<N>,
    classifier: Arc<C>,
    sink: T,
    call_timeout: Option<Duration>,
}

impl ResilienceLayer {
    /// Layer with path-prefix naming, error-only classification and no telemetry.
    pub fn new(limiter: Arc<dyn RateLimiter>, registry: BreakerRegistry) -> Self {
        Self {
            limiter,
            registry,
            namer: Arc::new(PathPrefixNamer),
            classifier: Arc::new(DefaultClassifier),
            sink: NullSink,
            call_timeout: None,
        }
    }
}

impl<N, C, T> ResilienceLayer<N, C, T> {
    /// Derive resource names with `namer`.
    pub fn with_namer<N2>(self, namer: N2) -> ResilienceLayer<N2, C, T> {
        ResilienceLayer {
            limiter: self.limiter,
            registry: self.registry,
            namer: Arc::new(namer),
            classifier: self.classifier,
            sink: self.sink,
            call_timeout: self.call_timeout,
        }
    }

    /// Decide breaker failures with `classifier`.
    pub fn with_classifier<C2>(self, classifier: C2) -> ResilienceLayer<N, C2, T> {
        ResilienceLayer {
            limiter: self.limiter,
            registry: self.registry,
            namer: self.namer,
            classifier: Arc::new(classifier),
            sink: self.sink,
            call_timeout: self.call_timeout,
        }
    }

    /// Emit policy events to `sink`.
    pub fn with_sink<T2>(self, sink: T2) -> ResilienceLayer<N, C, T2> {
        ResilienceLayer {
            limiter: self.limiter,
            registry: self.registry,
            namer: self.namer,
            classifier: self.classifier,
            sink,
            call_timeout: self.call_timeout,
        }
    }

    /// Bound admission and the forwarded call by `timeout`.
    ///
    /// Timed-out calls are recorded as breaker failures.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &BreakerRegistry {
        &self.registry
    }
}

impl<N, C, T: Clone> Clone for ResilienceLayer<N, C, T> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            registry: self.registry.clone(),
            namer: self.namer.clone(),
            classifier: self.classifier.clone(),
            sink: self.sink.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<N, C, T> fmt::Debug for ResilienceLayer<N, C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceLayer")
            .field("limiter", &self.limiter)
            .field("registry", &self.registry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl<S, N, C, T: Clone> Layer<S> for ResilienceLayer<N, C, T> {
    type Service = ResilienceService<S, N, C, T>;

    fn layer(&self, service: S) -> Self::Service {
        ResilienceService { inner: service, layer: self.clone() }
    }
}

/// Middleware service produced by [`ResilienceLayer`].
pub struct ResilienceService<S, N = PathPrefixNamer, C = DefaultClassifier, T = NullSink> {
    inner: S,
    layer: ResilienceLayer<N, C, T>,
}

impl<S: Clone, N, C, T: Clone> Clone for ResilienceService<S, N, C, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: fmt::Debug, N, C, T> fmt::Debug for ResilienceService<S, N, C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceService")
            .field("inner", &self.inner)
            .field("layer", &self.layer)
            .finish()
    }
}

impl<S, Req, N, C, T> Service<Req> for ResilienceService<S, N, C, T>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    N: ResourceNamer<Req> + 'static,
    C: FailureClassifier<S::Response, S::Error> + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let resource = (*self.layer.namer).resource_name(&req);
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.layer.limiter.clone();
        let registry = self.layer.registry.clone();
        let classifier = self.layer.classifier.clone();
        let sink = self.layer.sink.clone();
        let call_timeout = self.layer.call_timeout;

        Box::pin(async move {
            let deadline = Deadline::start(call_timeout);

            let decision = deadline.run(limiter.acquire()).await.unwrap_or_else(|| {
                tracing::warn!(resource = %resource, "rate limiter missed the call deadline");
                Decision::Denied { wait: Duration::ZERO, reason: DenyReason::StoreUnavailable }
            });
            if let Decision::Denied { wait, reason } = decision {
                tracing::debug!(resource = %resource, %reason, ?wait, "rate limited");
                emit_best_effort(
                    sink.clone(),
                    PolicyEvent::RateLimit(RateLimitEvent::Denied { wait, reason }),
                )
                .await;
                return Err(ResilienceError::RateLimited { wait });
            }

            let Some(breaker) = registry.resolve(&resource) else {
                let outcome = deadline.run(inner.call(req)).await;
                return into_response(outcome, deadline);
            };

            let Some(admission) = deadline.run(breaker.allow_request()).await else {
                tracing::warn!(
                    resource = %resource,
                    breaker = %breaker.name(),
                    "circuit breaker admission missed the call deadline"
                );
                return Err(deadline.exceeded());
            };
            let Some(permit) = admission else {
                tracing::debug!(resource = %resource, breaker = %breaker.name(), "circuit open");
                emit_best_effort(
                    sink.clone(),
                    PolicyEvent::Request(RequestOutcome::Rejected { resource }),
                )
                .await;
                return Err(breaker.open_error());
            };
            if let Some(transition) = permit.transition() {
                emit_best_effort(
                    sink.clone(),
                    PolicyEvent::CircuitBreaker(CircuitBreakerEvent::from_transition(
                        breaker.name(),
                        transition,
                    )),
                )
                .await;
            }

            let start = Instant::now();
            let outcome = deadline.run(inner.call(req)).await;
            let duration = start.elapsed();
            let failed = match &outcome {
                Some(result) => classifier.is_failure(result),
                None => true,
            };

            let transition = match deadline.window(breaker.record_result(!failed)).await {
                Some(transition) => transition,
                None => {
                    tracing::warn!(
                        resource = %resource,
                        breaker = %breaker.name(),
                        "circuit breaker result not recorded in time"
                    );
                    None
                }
            };
            drop(permit);

            if let Some(transition) = transition {
                emit_best_effort(
                    sink.clone(),
                    PolicyEvent::CircuitBreaker(CircuitBreakerEvent::from_transition(
                        breaker.name(),
                        transition,
                    )),
                )
                .await;
            }
            let request = if failed {
                RequestOutcome::Failure { resource, duration }
            } else {
                RequestOutcome::Success { resource, duration }
            };
            emit_best_effort(sink, PolicyEvent::Request(request)).await;

            into_response(outcome, deadline)
        })
    }
}

/// Per-call deadline derived from the layer's call timeout.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self { started: Instant::now(), limit }
    }

    /// Drive `fut` until the deadline; `None` once it has passed.
    async fn run<F: Future>(self, fut: F) -> Option<F::Output> {
        match self.limit {
            Some(limit) => tokio::time::timeout_at(self.started + limit, fut).await.ok(),
            None => Some(fut.await),
        }
    }

    /// Drive `fut` for at most one call timeout from now.
    async fn window<F: Future>(self, fut: F) -> Option<F::Output> {
        match self.limit {
            Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
            None => Some(fut.await),
        }
    }

    fn exceeded<E>(self) -> ResilienceError<E> {
        ResilienceError::Timeout {
            elapsed: self.started.elapsed(),
            timeout: self.limit.unwrap_or_default(),
        }
    }
}

fn into_response<R, E>(
    outcome: Option<Result<R, E>>,
    deadline: Deadline,
) -> Result<R, ResilienceError<E>> {
    match outcome {
        Some(result) => result.map_err(ResilienceError::Inner),
        None => Err(deadline.exceeded()),
    }
}
