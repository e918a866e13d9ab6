//! Convenient re-exports for wiring tripwire into a service.
pub use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::{BreakerRegistry, PathPrefixNamer, ResourceNamer},
    classify::{FailureClassifier, StatusClassifier},
    config::{ConfigError, TripwireConfig},
    middleware::{ResilienceLayer, ResilienceService},
    rate_limit::{RateLimiter, TokenBucket, TokenBucketConfig},
    store::{CounterStore, InMemoryCounterStore, StoreError},
    telemetry::{LogSink, MemorySink, PolicyEvent},
    ResilienceError,
};
