//! Error types surfaced by the resilience middleware
use std::fmt;
use std::time::Duration;

/// Application error code carried by rate-limit rejections.
pub const RATE_LIMITED_CODE: u16 = 110;

/// Unified error type for admission rejections and downstream failures.
///
/// Rejections (`RateLimited`, `CircuitOpen`) are raised before the downstream
/// is contacted and are never retried here; `Inner` carries the downstream
/// error unchanged.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The token bucket had no token for this call
    RateLimited { wait: Duration },
    /// The circuit breaker guarding `resource` denied admission
    CircuitOpen { resource: String, open_for: Duration },
    /// The forwarded call exceeded the configured deadline
    Timeout { elapsed: Duration, timeout: Duration },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { .. } => f.write_str("rate limit exceeded"),
            Self::CircuitOpen { .. } => f.write_str("circuit breaker is open"),
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if the rate limiter rejected the call
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Whether the call was rejected without reaching the downstream.
    pub fn is_rejection(&self) -> bool {
        self.is_rate_limited() || self.is_circuit_open()
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Suggested retry delay for rate-limit rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }
    /// Name of the resource whose breaker rejected the call.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { resource, .. } => Some(resource),
            _ => None,
        }
    }
    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
    /// HTTP status a gateway should answer with, or `None` for downstream
    /// errors, which are propagated as-is.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::CircuitOpen { .. } => Some(503),
            Self::Timeout { .. } => Some(504),
            Self::Inner(_) => None,
        }
    }
    /// Application error code placed in the response body.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(RATE_LIMITED_CODE),
            _ => None,
        }
    }
    /// Map the inner error, keeping rejections untouched.
    pub fn map_inner<F, T>(self, f: F) -> ResilienceError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::RateLimited { wait } => ResilienceError::RateLimited { wait },
            Self::CircuitOpen { resource, open_for } => {
                ResilienceError::CircuitOpen { resource, open_for }
            }
            Self::Timeout { elapsed, timeout } => ResilienceError::Timeout { elapsed, timeout },
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}
