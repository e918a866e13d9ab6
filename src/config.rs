//! Startup configuration.
//!
//! Everything here is validated before any traffic is served; a bad value is a
//! [`ConfigError`] and the caller is expected to refuse to start.
//!
//! ```rust
//! use std::sync::Arc;
//! use tripwire::{InMemoryCounterStore, TripwireConfig};
//!
//! let config = TripwireConfig::from_json(r#"{
//!     "limiter": { "rate": 100, "capacity": 200 },
//!     "breakers": {
//!         "user_service": { "failure_threshold": 1, "half_open_timeout_ms": 300 },
//!         "index_service": { "name": "user_service", "failure_threshold": 1 },
//!         "default": {}
//!     },
//!     "call_timeout_ms": 2000
//! }"#).unwrap();
//!
//! let layer = config.layer(Arc::new(InMemoryCounterStore::new())).unwrap();
//! assert_eq!(layer.registry().len(), 3);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::middleware::ResilienceLayer;
use crate::rate_limit::{TokenBucket, TokenBucketConfig, DEFAULT_LIMITER_KEY};
use crate::store::CounterStore;

pub const DEFAULT_REDIS_HOST: &str = "127.0.0.1:6379";
/// Deadline for a single counter-store command unless configured otherwise.
pub const DEFAULT_STORE_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Invalid configuration, detected at construction time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{what} must not be empty")]
    EmptyName { what: &'static str },
    #[error("rate must be at least 1 token per second (got {provided})")]
    InvalidRate { provided: u64 },
    #[error("capacity must be between 1 and {} (got {provided})", i64::MAX)]
    InvalidCapacity { provided: u64 },
    #[error("{field} must be at least 1 (got {provided})")]
    InvalidThreshold { field: &'static str, provided: u64 },
    #[error("{field} is too short")]
    ZeroDuration { field: &'static str },
    #[error("failure_ratio must be in (0, 1] (got {provided})")]
    InvalidFailureRatio { provided: f64 },
    #[error("{var} is invalid: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
    #[error("breaker '{resource}': {reason}")]
    InvalidBreaker { resource: String, reason: Box<ConfigError> },
    #[error("malformed configuration: {0}")]
    Parse(String),
}

/// Token bucket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSettings {
    pub key: String,
    /// Tokens per second.
    pub rate: u64,
    pub capacity: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self { key: DEFAULT_LIMITER_KEY.to_string(), rate: 100, capacity: 100 }
    }
}

impl LimiterSettings {
    pub fn to_config(&self) -> Result<TokenBucketConfig, ConfigError> {
        TokenBucketConfig::new(self.key.clone(), self.rate, self.capacity)
    }
}

/// Per-resource breaker settings; omitted fields take the breaker defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    /// Breaker (and counter key) name; defaults to the resource name. Resources
    /// naming the same breaker share its store counters.
    pub name: Option<String>,
    pub failure_threshold: Option<u64>,
    pub success_threshold: Option<u64>,
    pub half_open_timeout_ms: Option<u64>,
    pub window_secs: Option<u64>,
    pub failure_ratio: Option<f64>,
    pub half_open_max_calls: Option<usize>,
}

impl BreakerSettings {
    pub fn to_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        let mut builder = CircuitBreakerConfig::builder();
        if let Some(v) = self.failure_threshold {
            builder = builder.failure_threshold(v);
        }
        if let Some(v) = self.success_threshold {
            builder = builder.success_threshold(v);
        }
        if let Some(ms) = self.half_open_timeout_ms {
            builder = builder.half_open_timeout(Duration::from_millis(ms));
        }
        if let Some(secs) = self.window_secs {
            builder = builder.window_size(Duration::from_secs(secs));
        }
        if let Some(v) = self.failure_ratio {
            builder = builder.failure_ratio(v);
        }
        if let Some(v) = self.half_open_max_calls {
            builder = builder.half_open_max_calls(v);
        }
        builder.build()
    }
}

/// Connection settings for the shared counter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// `host` or `host:port`.
    pub host: String,
    pub password: Option<String>,
    pub db: i64,
    /// Per-command deadline in milliseconds.
    pub op_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_REDIS_HOST.to_string(),
            password: None,
            db: 0,
            op_timeout_ms: duration_millis(DEFAULT_STORE_OP_TIMEOUT),
        }
    }
}

impl StoreSettings {
    /// Read `REDIS_HOST`, `REDIS_PASS` and `REDIS_DB`; unset variables keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(host) = lookup("REDIS_HOST").filter(|h| !h.trim().is_empty()) {
            settings.host = host.trim().to_string();
        }
        settings.password = lookup("REDIS_PASS").filter(|p| !p.is_empty());
        if let Some(db) = lookup("REDIS_DB").filter(|d| !d.trim().is_empty()) {
            settings.db = db.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidEnv { var: "REDIS_DB", reason: e.to_string() }
            })?;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyName { what: "store host" });
        }
        if self.db < 0 {
            return Err(ConfigError::InvalidEnv {
                var: "REDIS_DB",
                reason: format!("database index must not be negative (got {})", self.db),
            });
        }
        if self.op_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "op_timeout_ms" });
        }
        Ok(())
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TripwireConfig {
    pub limiter: LimiterSettings,
    /// Breakers keyed by resource name; a `default` entry catches the rest.
    pub breakers: BTreeMap<String, BreakerSettings>,
    /// Deadline for forwarded calls.
    pub call_timeout_ms: Option<u64>,
    pub store: StoreSettings,
}

impl TripwireConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limiter.to_config()?;
        for (resource, settings) in &self.breakers {
            Self::breaker_config(resource, settings)?;
        }
        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroDuration { field: "call_timeout_ms" });
        }
        self.store.validate()
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn build_limiter(&self, store: Arc<dyn CounterStore>) -> Result<TokenBucket, ConfigError> {
        Ok(TokenBucket::new(store, self.limiter.to_config()?))
    }

    pub fn build_registry(
        &self,
        store: Arc<dyn CounterStore>,
    ) -> Result<BreakerRegistry, ConfigError> {
        let registry = BreakerRegistry::new();
        for (resource, settings) in &self.breakers {
            let config = Self::breaker_config(resource, settings)?;
            let name = settings.name.clone().unwrap_or_else(|| resource.clone());
            tracing::debug!(resource = %resource, breaker = %name, ?config, "registering circuit breaker");
            registry
                .register_as(resource.clone(), Arc::new(CircuitBreaker::new(name, config, store.clone())));
        }
        Ok(registry)
    }

    /// Limiter, registry and call deadline wired into a middleware layer.
    pub fn layer(&self, store: Arc<dyn CounterStore>) -> Result<ResilienceLayer, ConfigError> {
        self.validate()?;
        let limiter = self.build_limiter(store.clone())?;
        let registry = self.build_registry(store)?;
        let layer = ResilienceLayer::new(Arc::new(limiter), registry);
        Ok(match self.call_timeout() {
            Some(timeout) => layer.with_call_timeout(timeout),
            None => layer,
        })
    }

    fn breaker_config(
        resource: &str,
        settings: &BreakerSettings,
    ) -> Result<CircuitBreakerConfig, ConfigError> {
        if resource.trim().is_empty() {
            return Err(ConfigError::EmptyName { what: "breaker resource" });
        }
        if settings.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ConfigError::EmptyName { what: "breaker name" });
        }
        settings.to_config().map_err(|reason| ConfigError::InvalidBreaker {
            resource: resource.to_string(),
            reason: Box::new(reason),
        })
    }
}
