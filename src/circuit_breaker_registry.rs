//! Registry mapping resource names to circuit breakers.
//!
//! Entries are created at startup for known resources plus an optional
//! [`DEFAULT_BREAKER`] entry, and are never removed at runtime. Lookups for
//! unknown resources fall back to the default; without a default the registry
//! reports "no protection configured" and the middleware admits the call.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use tracing::warn;

/// Name of the fallback breaker.
pub const DEFAULT_BREAKER: &str = "default";

/// Derives the resource name used to pick a breaker for a request.
pub trait ResourceNamer<Req>: Send + Sync {
    fn resource_name(&self, request: &Req) -> String;
}

impl<Req, F> ResourceNamer<Req> for F
where
    F: Fn(&Req) -> String + Send + Sync,
{
    fn resource_name(&self, request: &Req) -> String {
        self(request)
    }
}

/// Requests that expose a routing path.
pub trait Routable {
    fn route(&self) -> &str;
}

impl Routable for String {
    fn route(&self) -> &str {
        self
    }
}

impl Routable for &str {
    fn route(&self) -> &str {
        self
    }
}

/// Names a resource after the first path segment: `/user/info` → `user_service`.
///
/// The root path, and paths whose first segment is empty, map to
/// [`DEFAULT_BREAKER`]. Query strings and fragments are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathPrefixNamer;

impl PathPrefixNamer {
    pub fn name_for(path: &str) -> String {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        match path.trim_start_matches('/').split('/').next() {
            Some(segment) if !segment.is_empty() => format!("{segment}_service"),
            _ => DEFAULT_BREAKER.to_string(),
        }
    }
}

impl<Req: Routable> ResourceNamer<Req> for PathPrefixNamer {
    fn resource_name(&self, request: &Req) -> String {
        Self::name_for(request.route())
    }
}

/// In-memory registry backed by an RwLock; clones share the same map.
#[derive(Default, Clone, Debug)]
pub struct BreakerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its own name, returning the shared handle.
    pub fn register(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(breaker);
        self.register_as(breaker.name().to_string(), breaker.clone());
        breaker
    }

    /// Register `breaker` under `resource`, overwriting any existing entry.
    ///
    /// Several resources may share one breaker; the last registration for a
    /// resource wins.
    pub fn register_as(&self, resource: impl Into<String>, breaker: Arc<CircuitBreaker>) {
        let resource = resource.into();
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&resource) {
            warn!(
                target: "tripwire::circuit_breaker_registry",
                resource = %resource,
                "circuit breaker replaced; last registration wins"
            );
        }
        map.insert(resource, breaker);
    }

    /// Exact lookup without fallback.
    pub fn get(&self, resource: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(resource).cloned()
    }

    /// Breaker for `resource`, falling back to [`DEFAULT_BREAKER`].
    ///
    /// `None` means no protection is configured for this call.
    pub fn resolve(&self, resource: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let found = map.get(resource).or_else(|| map.get(DEFAULT_BREAKER)).cloned();
        if found.is_none() {
            tracing::debug!(resource, "no circuit breaker configured; admitting");
        }
        found
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breaker states keyed by resource, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
