//! Counter store abstraction shared by the limiter and the breakers.
//!
//! The store is a plain key-value service holding integers with optional
//! TTLs (Redis in production, [`InMemoryCounterStore`] in tests). It carries no
//! business logic: the limiter and breakers build their semantics on top of
//! these primitives, and every mutation is usable without a distributed lock.

use async_trait::async_trait;
use std::time::Duration;

pub mod memory;

pub use memory::InMemoryCounterStore;

/// Errors reported by a counter store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer within the configured deadline.
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
    /// A stored value was not an integer.
    #[error("value at '{key}' is not an integer")]
    NotAnInteger {
        /// Offending key.
        key: String,
    },
    /// Local state guarding the store was poisoned by a panicking thread.
    #[error("counter store state poisoned")]
    Poisoned,
}

/// Abstract storage interface for counters and timestamps.
///
/// Implementations must make `incr`/`decr` atomic; everything else may be a
/// plain read or write. Missing keys read as `None` and increment from zero.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Read an integer value.
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Overwrite a value and set its TTL.
    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically add one, returning the new value. Keeps any existing TTL.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically subtract one, returning the new value. Keeps any existing TTL.
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Remove keys; missing keys are ignored.
    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Set the TTL of an existing key; a missing key is a no-op.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Increment and (re)arm the TTL.
    ///
    /// The default issues two commands; backends that can should override it
    /// with a single transaction so a counter is never left without a TTL.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let value = self.incr(key).await?;
        self.expire(key, ttl).await?;
        Ok(value)
    }
}
