use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::rate_limit::{Decision, DenyReason, RateLimiter};
use crate::store::{CounterStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Limiter key used when none is configured.
pub const DEFAULT_LIMITER_KEY: &str = "token_bucket";

/// TTL on persisted bucket state; a dormant key resets instead of lingering.
pub const LIMITER_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry hint handed out while the store is unreachable.
const STORE_RETRY_HINT: Duration = Duration::from_secs(1);

/// Validated token bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketConfig {
    key: String,
    rate: u64,
    capacity: u64,
}

impl TokenBucketConfig {
    /// Validate `rate` (tokens per second) and `capacity`; both must be > 0.
    pub fn new(key: impl Into<String>, rate: u64, capacity: u64) -> Result<Self, ConfigError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ConfigError::EmptyName { what: "limiter key" });
        }
        if rate == 0 {
            return Err(ConfigError::InvalidRate { provided: rate });
        }
        if capacity == 0 || i64::try_from(capacity).is_err() {
            return Err(ConfigError::InvalidCapacity { provided: capacity });
        }
        Ok(Self { key, rate, capacity })
    }

    /// Store key prefix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tokens added per elapsed second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Maximum tokens held.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// A token bucket whose state lives in a shared [`CounterStore`].
///
/// Replenishes `rate` tokens per elapsed whole second, up to `capacity`.
/// Elapsed time is measured at one-second resolution, so calls inside the same
/// second never refill; the bucket errs towards under-admission there.
///
/// The local mutex only serializes callers within this process. Across
/// processes the read-refill-write sequence is not atomic: two instances may
/// both persist a refill for the same second, bounded by `capacity`, and a
/// decrement that lands below zero is handed back and denied.
#[derive(Debug)]
pub struct TokenBucket {
    store: Arc<dyn CounterStore>,
    config: TokenBucketConfig,
    tokens_key: String,
    last_time_key: String,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl TokenBucket {
    /// Create a bucket backed by `store`.
    pub fn new(store: Arc<dyn CounterStore>, config: TokenBucketConfig) -> Self {
        let tokens_key = format!("{}:tokens", config.key);
        let last_time_key = format!("{}:last_time", config.key);
        Self {
            store,
            config,
            tokens_key,
            last_time_key,
            clock: Arc::new(SystemClock),
            lock: Mutex::new(()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Key holding the persisted token count.
    pub fn tokens_key(&self) -> &str {
        &self.tokens_key
    }

    /// Key holding the Unix second of the last refill.
    pub fn last_time_key(&self) -> &str {
        &self.last_time_key
    }

    /// Refill from persisted state and take one token if available.
    ///
    /// Store faults are returned as errors; [`RateLimiter::acquire`] turns them
    /// into a denial.
    pub async fn try_acquire(&self) -> Result<Decision, StoreError> {
        let _guard = self.lock.lock().await;

        let now = self.clock.now_secs();
        let stored = self.store.get(&self.tokens_key).await?;
        let last = self.store.get(&self.last_time_key).await?;

        let last = last.map(|t| u64::try_from(t).unwrap_or(0)).unwrap_or(now);
        let elapsed = now.saturating_sub(last);
        let tokens = self.refill(stored, elapsed);
        // Never move the refill mark backwards, or a clock that steps back and
        // then forward again would be credited twice.
        let refill_mark = last.max(now);

        self.store.set_with_ttl(&self.tokens_key, tokens, LIMITER_STATE_TTL).await?;
        self.store
            .set_with_ttl(
                &self.last_time_key,
                i64::try_from(refill_mark).unwrap_or(i64::MAX),
                LIMITER_STATE_TTL,
            )
            .await?;

        if tokens < 1 {
            return Ok(self.exhausted());
        }

        let remaining = self.store.decr(&self.tokens_key).await?;
        if remaining < 0 {
            // Another instance drained the bucket between our refill and decrement.
            self.store.incr(&self.tokens_key).await?;
            return Ok(self.exhausted());
        }

        Ok(Decision::Allowed { remaining: u64::try_from(remaining).unwrap_or(0) })
    }

    fn refill(&self, stored: Option<i64>, elapsed_secs: u64) -> i64 {
        let capacity = self.capacity_i64();
        let current = stored.unwrap_or(capacity).clamp(0, capacity);
        let added = elapsed_secs.saturating_mul(self.config.rate);
        let added = i64::try_from(added).unwrap_or(i64::MAX);
        current.saturating_add(added).min(capacity)
    }

    fn capacity_i64(&self) -> i64 {
        // Validated to fit in `TokenBucketConfig::new`.
        i64::try_from(self.config.capacity).unwrap_or(i64::MAX)
    }

    fn exhausted(&self) -> Decision {
        // Refill happens on whole-second boundaries.
        let into_second = self.clock.now_millis() % 1_000;
        Decision::Denied {
            wait: Duration::from_millis(1_000 - into_second),
            reason: DenyReason::Exhausted,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self) -> Decision {
        match self.try_acquire().await {
            Ok(decision) => {
                tracing::debug!(limiter = %self.config.key, ?decision, "token bucket decision");
                decision
            }
            Err(error) => {
                tracing::warn!(
                    limiter = %self.config.key,
                    %error,
                    "counter store unavailable; rate limiter failing closed"
                );
                Decision::Denied { wait: STORE_RETRY_HINT, reason: DenyReason::StoreUnavailable }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;

    fn bucket(rate: u64, capacity: u64) -> (TokenBucket, InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let store = InMemoryCounterStore::new().with_clock(clock.clone());
        let config = TokenBucketConfig::new("test_bucket", rate, capacity).unwrap();
        let bucket = TokenBucket::new(Arc::new(store.clone()), config).with_clock(clock.clone());
        (bucket, store, clock)
    }

    #[test]
    fn rejects_zero_rate_and_capacity() {
        assert_eq!(
            TokenBucketConfig::new("k", 0, 5).unwrap_err(),
            ConfigError::InvalidRate { provided: 0 }
        );
        assert_eq!(
            TokenBucketConfig::new("k", 1, 0).unwrap_err(),
            ConfigError::InvalidCapacity { provided: 0 }
        );
        assert!(matches!(
            TokenBucketConfig::new("  ", 1, 1).unwrap_err(),
            ConfigError::EmptyName { .. }
        ));
    }

    #[tokio::test]
    async fn fresh_bucket_starts_full() {
        let (bucket, store, _clock) = bucket(1, 5);
        let decision = bucket.acquire().await;
        assert_eq!(decision, Decision::Allowed { remaining: 4 });
        assert_eq!(store.get(bucket.tokens_key()).await.unwrap(), Some(4));
        assert_eq!(store.ttl(bucket.tokens_key()), Some(LIMITER_STATE_TTL));
        assert_eq!(store.ttl(bucket.last_time_key()), Some(LIMITER_STATE_TTL));
    }

    #[tokio::test]
    async fn same_second_bursts_do_not_refill() {
        let (bucket, _store, clock) = bucket(10, 2);
        assert!(bucket.allow().await);
        assert!(bucket.allow().await);
        clock.advance(Duration::from_millis(999));
        assert!(!bucket.allow().await);
    }

    #[tokio::test]
    async fn denial_reports_wait_until_next_second() {
        let (bucket, _store, clock) = bucket(1, 1);
        assert!(bucket.allow().await);
        clock.advance(Duration::from_millis(250));
        match bucket.acquire().await {
            Decision::Denied { wait, reason } => {
                assert_eq!(reason, DenyReason::Exhausted);
                assert_eq!(wait, Duration::from_millis(750));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backward_clock_jump_does_not_inflate_tokens() {
        let (bucket, store, clock) = bucket(1, 3);
        for _ in 0..3 {
            assert!(bucket.allow().await);
        }
        let start = clock.now_millis();

        clock.set(start - 10_000);
        assert!(!bucket.allow().await, "stepping back must not refill");

        // Stepping forward to the starting time must not credit the 10s twice.
        clock.set(start);
        assert!(!bucket.allow().await);
        assert_eq!(store.get(bucket.tokens_key()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (bucket, store, _clock) = bucket(100, 100);
        store.set_offline(true);
        match bucket.acquire().await {
            Decision::Denied { reason, .. } => assert_eq!(reason, DenyReason::StoreUnavailable),
            other => panic!("expected fail-closed denial, got {other:?}"),
        }
        store.set_offline(false);
        assert!(bucket.allow().await);
    }

    #[tokio::test]
    async fn stale_negative_balance_is_clamped() {
        let (bucket, store, _clock) = bucket(1, 5);
        store.set_with_ttl(bucket.tokens_key(), -3, LIMITER_STATE_TTL).await.unwrap();
        store
            .set_with_ttl(bucket.last_time_key(), 1_700_000_000, LIMITER_STATE_TTL)
            .await
            .unwrap();
        assert!(!bucket.allow().await);
        assert_eq!(store.get(bucket.tokens_key()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn buckets_sharing_a_key_share_tokens() {
        let (first, store, clock) = bucket(1, 2);
        let second = TokenBucket::new(
            Arc::new(store.clone()),
            TokenBucketConfig::new("test_bucket", 1, 2).unwrap(),
        )
        .with_clock(clock.clone());

        assert!(first.allow().await);
        assert!(second.allow().await);
        assert!(!first.allow().await);
        assert!(!second.allow().await);
    }
}
