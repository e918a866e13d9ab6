//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the core trait the middleware consults before forwarding.
//! - [`Decision`]: the result of a rate limit check (Allowed/Denied).
//! - [`TokenBucket`] (in `strategies`): a token bucket whose state lives in a
//!   shared [`CounterStore`](crate::store::CounterStore), so every process
//!   using the same limiter key draws from the same bucket.

use std::fmt;
use std::time::Duration;

pub mod strategies;

pub use strategies::{TokenBucket, TokenBucketConfig, DEFAULT_LIMITER_KEY, LIMITER_STATE_TTL};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The bucket holds less than one token.
    Exhausted,
    /// The counter store could not be consulted; the limiter fails closed.
    StoreUnavailable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Exhausted => f.write_str("token_bucket_empty"),
            DenyReason::StoreUnavailable => f.write_str("store_unavailable"),
        }
    }
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Tokens left after this acquisition.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u64,
    },
    /// The request is denied.
    Denied {
        /// How long the caller should wait before retrying.
        /// Useful for `Retry-After` headers.
        wait: Duration,
        /// Reason for denial.
        reason: DenyReason,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for rate limiting logic.
///
/// Decouples the middleware from the algorithm and from the storage backend.
/// Implementations never return errors: infrastructure faults are folded into
/// a [`Decision::Denied`] so the caller cannot accidentally fail open.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Try to take one permit.
    async fn acquire(&self) -> Decision;

    /// Boolean shorthand for [`acquire`](RateLimiter::acquire).
    async fn allow(&self) -> bool {
        self.acquire().await.is_allowed()
    }
}

