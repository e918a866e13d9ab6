//! Circuit breaker driven by sliding window counters in a shared store.
//!
//! State lives in this process (an atomic word plus the time of the last
//! transition); the `total`/`success`/`failure` counters that drive it live in
//! the [`CounterStore`] under `circuit_breaker:<name>:*`, so every instance
//! protecting the same resource sees the same failure ratio.

use crate::clock::{Clock, MonotonicClock};
use crate::config::ConfigError;
use crate::store::{CounterStore, StoreError};
use crate::ResilienceError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Prefix of every breaker counter key.
pub const COUNTER_KEY_PREFIX: &str = "circuit_breaker:";
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u64 = 2;
pub const DEFAULT_HALF_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(10);
pub const DEFAULT_FAILURE_RATIO: f64 = 0.5;
pub const DEFAULT_HALF_OPEN_MAX_CALLS: usize = 1;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the half-open timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// A state change performed by a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u64,
    success_threshold: u64,
    half_open_timeout: Duration,
    window_size: Duration,
    failure_ratio: f64,
    half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            half_open_timeout: DEFAULT_HALF_OPEN_TIMEOUT,
            window_size: DEFAULT_WINDOW_SIZE,
            failure_ratio: DEFAULT_FAILURE_RATIO,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// Minimum failures in the window before the breaker may open.
    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold
    }

    /// Successes needed while half-open before closing again.
    pub fn success_threshold(&self) -> u64 {
        self.success_threshold
    }

    /// Time spent open before probes are let through.
    pub fn half_open_timeout(&self) -> Duration {
        self.half_open_timeout
    }

    /// TTL of the window counters, refreshed on every recorded result.
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Minimum `failure / total` ratio needed to open.
    pub fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    /// Maximum concurrent probe calls while half-open.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "failure_threshold", provided: 0 });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "success_threshold", provided: 0 });
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::InvalidThreshold { field: "half_open_max_calls", provided: 0 });
        }
        if self.half_open_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "half_open_timeout" });
        }
        if self.window_size < Duration::from_secs(1) {
            // Store TTLs have whole-second granularity.
            return Err(ConfigError::ZeroDuration { field: "window_size" });
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ConfigError::InvalidFailureRatio { provided: self.failure_ratio });
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]; unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn half_open_timeout(mut self, timeout: Duration) -> Self {
        self.config.half_open_timeout = timeout;
        self
    }

    pub fn window_size(mut self, window: Duration) -> Self {
        self.config.window_size = window;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.config.failure_ratio = ratio;
        self
    }

    pub fn half_open_max_calls(mut self, limit: usize) -> Self {
        self.config.half_open_max_calls = limit;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Snapshot of a breaker's window counters; missing keys read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounters {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    last_change_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    half_open_epoch: AtomicU64,
}

impl BreakerState {
    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Admission ticket returned by [`CircuitBreaker::allow_request`].
///
/// Probe permits hold one of the limited half-open slots until dropped; keep
/// the permit alive until the call's result has been recorded.
#[derive(Debug)]
#[must_use = "dropping a probe permit frees its half-open slot"]
pub struct CallPermit {
    probe: Option<(Arc<BreakerState>, u64)>,
    transition: Option<Transition>,
}

impl CallPermit {
    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// The transition performed while admitting this call, if any.
    pub fn transition(&self) -> Option<Transition> {
        self.transition
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let Some((state, epoch)) = self.probe.take() {
            // Slots from an earlier half-open phase were already reset.
            if state.half_open_epoch.load(Ordering::Acquire) == epoch {
                let _ = state.half_open_calls.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |n| n.checked_sub(1),
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CounterKeys {
    total: String,
    success: String,
    failure: String,
}

impl CounterKeys {
    fn new(name: &str) -> Self {
        let base = format!("{COUNTER_KEY_PREFIX}{name}");
        Self {
            total: format!("{base}:total"),
            success: format!("{base}:success"),
            failure: format!("{base}:failure"),
        }
    }
}

/// Circuit breaker protecting one named downstream resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<BreakerState>,
    transition_lock: Mutex<()>,
    keys: CounterKeys,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `name` whose counters live in `store`.
    ///
    /// # Examples
    /// ```
    /// use std::sync::Arc;
    /// use tripwire::{CircuitBreaker, CircuitBreakerConfig, InMemoryCounterStore};
    ///
    /// let store = Arc::new(InMemoryCounterStore::new());
    /// let breaker = CircuitBreaker::new("user_service", CircuitBreakerConfig::default(), store);
    /// assert_eq!(breaker.state(), tripwire::CircuitState::Closed);
    /// ```
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let name = name.into();
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Self {
            keys: CounterKeys::new(&name),
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                last_change_millis: AtomicU64::new(clock.now_millis()),
                half_open_calls: AtomicUsize::new(0),
                half_open_epoch: AtomicU64::new(0),
            }),
            name,
            config,
            transition_lock: Mutex::new(()),
            store,
            clock,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.state.last_change_millis.store(self.clock.now_millis(), Ordering::Release);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.current()
    }

    /// Probe calls currently holding a half-open slot.
    pub fn half_open_in_flight(&self) -> usize {
        self.state.half_open_calls.load(Ordering::Acquire)
    }

    /// Read the window counters from the store.
    pub async fn counters(&self) -> Result<WindowCounters, StoreError> {
        Ok(WindowCounters {
            total: self.store.get(&self.keys.total).await?.unwrap_or(0),
            success: self.store.get(&self.keys.success).await?.unwrap_or(0),
            failure: self.store.get(&self.keys.failure).await?.unwrap_or(0),
        })
    }

    /// Admission check.
    ///
    /// - **Closed**: always admitted.
    /// - **Open**: denied until strictly more than `half_open_timeout` has passed
    ///   since the breaker opened; the first caller after that moves it to
    ///   half-open and becomes the first probe. Racing callers observe the new
    ///   state instead of repeating the transition.
    /// - **HalfOpen**: admitted while fewer than `half_open_max_calls` probes
    ///   are in flight.
    pub async fn allow_request(&self) -> Option<CallPermit> {
        loop {
            match self.state.current() {
                CircuitState::Closed => return Some(CallPermit { probe: None, transition: None }),
                CircuitState::Open => {
                    if !self.open_timeout_elapsed() {
                        return None;
                    }
                    if let Some(transition) =
                        self.transition(CircuitState::Open, CircuitState::HalfOpen)
                    {
                        let epoch = self.state.half_open_epoch.load(Ordering::Acquire);
                        // Built before the await so a cancelled admission frees the slot.
                        let permit = CallPermit {
                            probe: Some((self.state.clone(), epoch)),
                            transition: Some(transition),
                        };
                        self.clear_outcome_counters().await;
                        return Some(permit);
                    }
                    // Someone else moved the breaker on; re-check.
                }
                CircuitState::HalfOpen => {
                    let epoch = self.state.half_open_epoch.load(Ordering::Acquire);
                    let in_flight = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if in_flight >= self.config.half_open_max_calls {
                        let _ = self.state.half_open_calls.fetch_update(
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            |n| n.checked_sub(1),
                        );
                        tracing::debug!(
                            breaker = %self.name,
                            in_flight,
                            max = self.config.half_open_max_calls,
                            "half-open probe limit reached"
                        );
                        return None;
                    }
                    return Some(CallPermit {
                        probe: Some((self.state.clone(), epoch)),
                        transition: None,
                    });
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    ///
    /// Increments `total` and one of `success`/`failure`, refreshes the window
    /// TTL on all three counters, then applies the state rules. Store faults are
    /// logged and leave the state untouched.
    pub async fn record_result(&self, success: bool) -> Option<Transition> {
        match self.try_record(success).await {
            Ok(transition) => transition,
            Err(error) => {
                tracing::warn!(
                    breaker = %self.name,
                    success,
                    %error,
                    "failed to record circuit breaker result"
                );
                None
            }
        }
    }

    /// Run `operation` under breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` without running the operation if
    /// the breaker denies admission, `ResilienceError::Inner(E)` if it fails.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.allow_request().await.ok_or_else(|| self.open_error())?;
        let result = operation().await;
        self.record_result(result.is_ok()).await;
        drop(permit);
        result.map_err(ResilienceError::Inner)
    }

    /// The rejection returned to callers while the breaker denies admission.
    pub fn open_error<E>(&self) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            resource: self.name.clone(),
            open_for: Duration::from_millis(self.since_last_change()),
        }
    }

    async fn try_record(&self, success: bool) -> Result<Option<Transition>, StoreError> {
        let window = self.config.window_size;
        let (hit, other) = if success {
            (&self.keys.success, &self.keys.failure)
        } else {
            (&self.keys.failure, &self.keys.success)
        };

        let total = self.store.incr_with_ttl(&self.keys.total, window).await?;
        let count = self.store.incr_with_ttl(hit, window).await?;
        self.store.expire(other, window).await?;

        let transition = match (self.state.current(), success) {
            (CircuitState::HalfOpen, true) if count >= self.threshold(self.config.success_threshold) => {
                self.transition(CircuitState::HalfOpen, CircuitState::Closed)
            }
            (CircuitState::HalfOpen, false) => {
                self.transition(CircuitState::HalfOpen, CircuitState::Open)
            }
            (CircuitState::Closed, false) if self.should_trip(count, total) => {
                self.transition(CircuitState::Closed, CircuitState::Open)
            }
            _ => None,
        };

        if transition.is_some() {
            self.clear_outcome_counters().await;
        }
        Ok(transition)
    }

    fn should_trip(&self, failures: i64, total: i64) -> bool {
        total > 0
            && failures >= self.threshold(self.config.failure_threshold)
            && failures as f64 / total as f64 >= self.config.failure_ratio
    }

    fn threshold(&self, value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    fn since_last_change(&self) -> u64 {
        let last = self.state.last_change_millis.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(last)
    }

    fn open_timeout_elapsed(&self) -> bool {
        let timeout = u64::try_from(self.config.half_open_timeout.as_millis()).unwrap_or(u64::MAX);
        self.since_last_change() > timeout
    }

    /// Move `from` → `to` under the transition lock, re-checking the state so
    /// that racing callers perform the change at most once.
    fn transition(&self, from: CircuitState, to: CircuitState) -> Option<Transition> {
        let _guard = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.current() != from {
            return None;
        }
        if from == CircuitState::Open && !self.open_timeout_elapsed() {
            return None;
        }

        if to == CircuitState::HalfOpen {
            // Claim the first probe slot before publishing the new state.
            self.state.half_open_epoch.fetch_add(1, Ordering::AcqRel);
            self.state.half_open_calls.store(1, Ordering::Release);
        } else {
            self.state.half_open_calls.store(0, Ordering::Release);
        }
        self.state.last_change_millis.store(self.clock.now_millis(), Ordering::Release);
        self.state.state.store(to.to_u8(), Ordering::Release);

        tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state changed");
        Some(Transition { from, to })
    }

    async fn clear_outcome_counters(&self) {
        let keys = [self.keys.success.as_str(), self.keys.failure.as_str()];
        if let Err(error) = self.store.delete(&keys).await {
            tracing::warn!(breaker = %self.name, %error, "failed to reset circuit breaker counters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;
    use futures::future::join_all;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn breaker(
        config: CircuitBreakerConfig,
    ) -> (CircuitBreaker, InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::starting_at(10_000);
        let store = InMemoryCounterStore::new().with_clock(clock.clone());
        let breaker = CircuitBreaker::new("user_service", config, Arc::new(store.clone()))
            .with_clock(clock.clone());
        (breaker, store, clock)
    }

    fn gateway_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .success_threshold(2)
            .half_open_timeout(Duration::from_millis(300))
            .build()
            .expect("valid config")
    }

    async fn trip(breaker: &CircuitBreaker) {
        let permit = breaker.allow_request().await.expect("closed breaker admits");
        breaker.record_result(false).await;
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn rejects_invalid_configs() {
        let err = CircuitBreakerConfig::builder().failure_threshold(0).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidThreshold { field: "failure_threshold", provided: 0 });

        let err = CircuitBreakerConfig::builder().success_threshold(0).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidThreshold { field: "success_threshold", provided: 0 });

        let err = CircuitBreakerConfig::builder().half_open_timeout(Duration::ZERO).build();
        assert!(matches!(err, Err(ConfigError::ZeroDuration { field: "half_open_timeout" })));

        let err = CircuitBreakerConfig::builder().window_size(Duration::from_millis(10)).build();
        assert!(matches!(err, Err(ConfigError::ZeroDuration { field: "window_size" })));

        let err = CircuitBreakerConfig::builder().failure_ratio(1.5).build();
        assert!(matches!(err, Err(ConfigError::InvalidFailureRatio { .. })));

        let err = CircuitBreakerConfig::builder().half_open_max_calls(0).build();
        assert!(matches!(err, Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn default_config_matches_gateway_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold(), 5);
        assert_eq!(config.success_threshold(), 2);
        assert_eq!(config.half_open_timeout(), Duration::from_secs(30));
        assert_eq!(config.window_size(), Duration::from_secs(10));
        assert_eq!(config.half_open_max_calls(), 1);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn single_failure_opens_with_threshold_one() {
        let (breaker, _store, _clock) = breaker(gateway_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        let permit = breaker.allow_request().await.expect("closed");
        let transition = breaker.record_result(false).await;
        drop(permit);

        assert_eq!(
            transition,
            Some(Transition { from: CircuitState::Closed, to: CircuitState::Open })
        );
        assert!(breaker.allow_request().await.is_none());
    }

    #[tokio::test]
    async fn absolute_threshold_guards_early_failures() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build().unwrap();
        let (breaker, _store, _clock) = breaker(config);

        breaker.record_result(false).await;
        breaker.record_result(false).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "100% failures but only 2 of them");

        breaker.record_result(false).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failure_ratio_guards_healthy_traffic() {
        let config = CircuitBreakerConfig::builder().failure_threshold(2).build().unwrap();
        let (breaker, _store, _clock) = breaker(config);

        for _ in 0..5 {
            breaker.record_result(true).await;
        }
        breaker.record_result(false).await;
        breaker.record_result(false).await;
        breaker.record_result(false).await;
        // 3 failures out of 8 calls is below the 0.5 ratio.
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_result(false).await;
        breaker.record_result(false).await;
        // 5 of 10.
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_breaker_probes_only_after_timeout() {
        let (breaker, _store, clock) = breaker(gateway_config());
        trip(&breaker).await;

        clock.advance(Duration::from_millis(299));
        assert!(breaker.allow_request().await.is_none());
        clock.advance(Duration::from_millis(1));
        assert!(breaker.allow_request().await.is_none(), "exactly the timeout is not enough");

        clock.advance(Duration::from_millis(1));
        let permit = breaker.allow_request().await.expect("first call after timeout probes");
        assert!(permit.is_probe());
        assert_eq!(
            permit.transition(),
            Some(Transition { from: CircuitState::Open, to: CircuitState::HalfOpen })
        );
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold_and_resets_counters() {
        let (breaker, _store, clock) = breaker(gateway_config());
        trip(&breaker).await;
        clock.advance(Duration::from_millis(301));

        let permit = breaker.allow_request().await.expect("probe");
        assert_eq!(breaker.record_result(true).await, None);
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let before = breaker.counters().await.unwrap();
        let permit = breaker.allow_request().await.expect("second probe");
        let transition = breaker.record_result(true).await;
        drop(permit);

        assert_eq!(
            transition,
            Some(Transition { from: CircuitState::HalfOpen, to: CircuitState::Closed })
        );
        let after = breaker.counters().await.unwrap();
        assert_eq!(after.success, 0);
        assert_eq!(after.failure, 0);
        assert_eq!(after.total, before.total + 1, "total survives the reset");
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let (breaker, _store, clock) = breaker(gateway_config());
        trip(&breaker).await;
        clock.advance(Duration::from_millis(301));

        let permit = breaker.allow_request().await.expect("probe");
        let transition = breaker.record_result(false).await;
        drop(permit);

        assert_eq!(
            transition,
            Some(Transition { from: CircuitState::HalfOpen, to: CircuitState::Open })
        );
        assert!(breaker.allow_request().await.is_none(), "open timer restarted");
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let (breaker, _store, clock) = breaker(gateway_config());
        trip(&breaker).await;
        clock.advance(Duration::from_millis(301));

        let probe = breaker.allow_request().await.expect("probe");
        assert!(breaker.allow_request().await.is_none(), "only one probe in flight");
        assert_eq!(breaker.half_open_in_flight(), 1);

        drop(probe);
        assert_eq!(breaker.half_open_in_flight(), 0);
        let next = breaker.allow_request().await.expect("slot released");
        assert!(next.is_probe());
    }

    #[tokio::test]
    async fn stale_probe_permit_does_not_free_new_slots() {
        let (breaker, _store, clock) = breaker(gateway_config());
        trip(&breaker).await;
        clock.advance(Duration::from_millis(301));

        let stale = breaker.allow_request().await.expect("probe");
        breaker.record_result(false).await;
        clock.advance(Duration::from_millis(301));
        let fresh = breaker.allow_request().await.expect("new half-open phase");

        drop(stale);
        assert_eq!(breaker.half_open_in_flight(), 1);
        assert!(breaker.allow_request().await.is_none());
        drop(fresh);
    }

    #[tokio::test]
    async fn record_result_counts_each_call_once() {
        let (breaker, _store, _clock) = breaker(CircuitBreakerConfig::default());

        breaker.record_result(true).await;
        assert_eq!(
            breaker.counters().await.unwrap(),
            WindowCounters { total: 1, success: 1, failure: 0 }
        );
        breaker.record_result(false).await;
        assert_eq!(
            breaker.counters().await.unwrap(),
            WindowCounters { total: 2, success: 1, failure: 1 }
        );
    }

    #[tokio::test]
    async fn every_record_refreshes_the_window() {
        let (breaker, store, clock) = breaker(CircuitBreakerConfig::default());

        breaker.record_result(false).await;
        clock.advance(Duration::from_secs(8));
        breaker.record_result(true).await;
        clock.advance(Duration::from_secs(8));

        // 16s after the first failure, but the window rolled forward.
        assert_eq!(
            breaker.counters().await.unwrap(),
            WindowCounters { total: 2, success: 1, failure: 1 }
        );
        assert_eq!(store.ttl("circuit_breaker:user_service:failure"), Some(Duration::from_secs(2)));

        clock.advance(Duration::from_secs(2));
        assert_eq!(breaker.counters().await.unwrap(), WindowCounters::default());
    }

    #[tokio::test]
    async fn store_outage_leaves_state_alone() {
        let (breaker, store, _clock) = breaker(gateway_config());
        store.set_offline(true);
        assert_eq!(breaker.record_result(false).await, None);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request().await.is_some());
    }

    #[tokio::test]
    async fn concurrent_probes_transition_exactly_once() {
        let (breaker, _store, clock) = breaker(gateway_config());
        trip(&breaker).await;
        clock.advance(Duration::from_millis(301));

        let breaker = Arc::new(breaker);
        let tasks = 64;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let mut handles = Vec::with_capacity(tasks);
        for _ in 0..tasks {
            let b = breaker.clone();
            let g = barrier.clone();
            handles.push(tokio::spawn(async move {
                g.wait().await;
                // Hold the permit so its probe slot stays claimed.
                b.allow_request().await
            }));
        }

        let permits: Vec<CallPermit> =
            join_all(handles).await.into_iter().filter_map(|r| r.unwrap()).collect();
        let admitted = permits.len();
        let transitions = permits.iter().filter(|p| p.transition().is_some()).count();

        assert_eq!(transitions, 1);
        assert_eq!(admitted, 1, "half_open_max_calls defaults to one probe");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn execute_wraps_operation() {
        let (breaker, _store, _clock) = breaker(gateway_config());

        let ok = breaker.execute(|| async { Ok::<_, TestError>(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        let err = breaker.execute(|| async { Err::<(), _>(TestError("boom".into())) }).await;
        assert!(matches!(err, Err(ResilienceError::Inner(TestError(_)))));

        let flag = std::sync::atomic::AtomicBool::new(false);
        let ran = &flag;
        let rejected = breaker
            .execute(move || async move {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;
        assert!(rejected.unwrap_err().is_circuit_open());
        assert!(!ran.load(Ordering::SeqCst), "open breaker must not run the operation");
    }
}
