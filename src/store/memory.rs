use super::{CounterStore, StoreError};
use crate::clock::{Clock, MonotonicClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<u64>,
}

/// In-process counter store with lazily evaluated TTLs.
///
/// Clones share the same data, which makes it a stand-in for a shared store
/// when several limiters or breakers are exercised in one test.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    offline: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self {
            data: Arc::default(),
            offline: Arc::default(),
            clock: Arc::new(MonotonicClock::default()),
        }
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate TTLs against `clock` instead of the process monotonic clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Simulate an outage: while offline every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining TTL of a live key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let guard = self.data.lock().ok()?;
        let entry = guard.get(key).filter(|e| !Self::expired(e, now))?;
        entry.expires_at.map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }

    fn expired(entry: &Entry, now: u64) -> bool {
        entry.expires_at.is_some_and(|at| now >= at)
    }

    fn deadline(&self, ttl: Duration) -> u64 {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock()?;
        let entry = guard.entry(key.to_string()).or_insert(Entry { value: 0, expires_at: None });
        if Self::expired(entry, now) {
            *entry = Entry { value: 0, expires_at: None };
        }
        entry.value = entry.value.saturating_add(delta);
        Ok(entry.value)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now_millis();
        let guard = self.lock()?;
        Ok(guard.get(key).filter(|e| !Self::expired(e, now)).map(|e| e.value))
    }

    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Some(self.deadline(ttl));
        let mut guard = self.lock()?;
        guard.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, -1)
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        for key in keys {
            guard.remove(*key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(ttl);
        let mut guard = self.lock()?;
        let expired = match guard.get(key) {
            Some(entry) => Self::expired(entry, now),
            None => return Ok(()),
        };
        if expired {
            guard.remove(key);
        } else if let Some(entry) = guard.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }
}
