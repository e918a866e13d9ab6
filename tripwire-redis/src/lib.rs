//! Redis counter store for `tripwire` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`, or connect from
//! [`StoreSettings`]; every gateway instance pointed at the same database
//! shares limiter tokens and breaker counters.
//!
//! Every command runs under a deadline ([`DEFAULT_STORE_OP_TIMEOUT`] unless
//! overridden), so a stalled server surfaces as [`StoreError::Timeout`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tripwire::config::DEFAULT_STORE_OP_TIMEOUT;
use tripwire::{CounterStore, StoreError, StoreSettings};

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Wrap an existing connection manager; commands use
    /// [`DEFAULT_STORE_OP_TIMEOUT`].
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, op_timeout: DEFAULT_STORE_OP_TIMEOUT }
    }

    /// Fail commands that take longer than `timeout` with [`StoreError::Timeout`].
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Connect using `settings` and verify the server answers `PING`.
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the settings are invalid, the
    /// server cannot be reached, or it does not answer the ping. Callers are
    /// expected to treat this as fatal at startup.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        settings.validate().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let client = redis::Client::open(connection_info(settings)?).map_err(unavailable)?;
        let conn = tokio::time::timeout(settings.op_timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(settings.op_timeout()))?
            .map_err(unavailable)?;

        let store = Self::new(conn).with_op_timeout(settings.op_timeout());
        store.ping().await?;

        tracing::info!(
            target: "tripwire::redis",
            host = %settings.host,
            db = settings.db,
            "connected to redis counter store"
        );
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = self
            .run("PING", async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        if pong != "PONG" {
            return Err(StoreError::Unavailable(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    async fn run<T, F>(&self, key: &str, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let result = tokio::time::timeout(self.op_timeout, command)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?;
        result.map_err(|e| {
            let error = classify(key, e);
            tracing::debug!(target: "tripwire::redis", key, %error, "redis command failed");
            error
        })
    }
}

/// Address from `host`, credentials and database set field by field so the
/// password never passes through a URL.
fn connection_info(settings: &StoreSettings) -> Result<ConnectionInfo, StoreError> {
    let mut info = format!("redis://{}", settings.host)
        .into_connection_info()
        .map_err(unavailable)?;
    info.redis.db = settings.db;
    info.redis.password = settings.password.clone();
    Ok(info)
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn classify(key: &str, e: RedisError) -> StoreError {
    let not_integer = e.kind() == redis::ErrorKind::TypeError
        || e.to_string().contains("not an integer");
    if not_integer {
        StoreError::NotAnInteger { key: key.to_string() }
    } else {
        unavailable(e)
    }
}

/// Redis rejects zero expirations, so round up to one millisecond.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        self.run(key, async move { conn.get(key).await }).await
    }

    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let millis = ttl_millis(ttl);
        self.run(key, async move {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.run(key, async move { conn.incr(key, 1i64).await }).await
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.run(key, async move { conn.decr(key, 1i64).await }).await
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let first = keys[0];
        self.run(first, async move {
            let _: i64 = conn.del(keys).await?;
            Ok(())
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let millis = ttl_millis(ttl);
        self.run(key, async move {
            let _: i64 = redis::cmd("PEXPIRE").arg(key).arg(millis).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// INCR and PEXPIRE in one MULTI/EXEC, so the counter never lacks a TTL.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let millis = ttl_millis(ttl);
        self.run(key, async move {
            let (value, _): (i64, i64) = redis::pipe()
                .atomic()
                .incr(key, 1i64)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(millis)
                .query_async(&mut conn)
                .await?;
            Ok(value)
        })
        .await
    }
}
