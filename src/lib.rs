#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tripwire
//!
//! Admission control for API gateways: a token bucket rate limiter and
//! per-resource circuit breakers whose state lives in a shared counter store
//! (Redis in production), so every gateway instance enforces the same limits.
//!
//! ## Features
//!
//! - **Token bucket** limiter with whole-second refill, failing closed when the
//!   store is unreachable
//! - **Circuit breakers** driven by sliding-window failure counts, with bounded
//!   half-open probing
//! - **Breaker registry** with a `default` fallback and injectable resource naming
//! - **Tower middleware** tying both together, with outcome classification and
//!   telemetry events
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tripwire::{CircuitBreaker, CircuitBreakerConfig, InMemoryCounterStore, ResilienceError};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryCounterStore::new());
//!     let config = CircuitBreakerConfig::builder()
//!         .failure_threshold(1)
//!         .half_open_timeout(Duration::from_millis(300))
//!         .build()
//!         .unwrap();
//!     let breaker = CircuitBreaker::new("user_service", config, store);
//!
//!     let result = breaker
//!         .execute(|| async { Err::<(), _>(std::io::Error::other("downstream failed")) })
//!         .await;
//!     assert!(matches!(result, Err(ResilienceError::Inner(_))));
//!
//!     let rejected = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
//!     assert!(rejected.unwrap_err().is_circuit_open());
//! }
//! ```

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod prelude;
pub mod rate_limit;
pub mod store;
pub mod telemetry;

// Re-exports
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition, WindowCounters,
};
pub use circuit_breaker_registry::{
    BreakerRegistry, PathPrefixNamer, ResourceNamer, Routable, DEFAULT_BREAKER,
};
pub use classify::{DefaultClassifier, FailureClassifier, Reply, StatusClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{BreakerSettings, ConfigError, LimiterSettings, StoreSettings, TripwireConfig};
pub use error::ResilienceError;
pub use middleware::{ResilienceLayer, ResilienceService};
pub use rate_limit::{Decision, DenyReason, RateLimiter, TokenBucket, TokenBucketConfig};
pub use store::{CounterStore, InMemoryCounterStore, StoreError};
