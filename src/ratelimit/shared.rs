//! Redis-backed window store shared by every limiter instance.
//!
//! ## Layout
//!
//! - Key: `{key_prefix}{identifier}`
//! - Value: sorted set, member `"{timestamp_ms}:{uuid}"`, score `timestamp_ms`
//! - TTL: `PEXPIRE` to the window on every record, so abandoned identifiers
//!   disappear server-side without a client sweep
//!
//! Purge, append and count run inside one `MULTI/EXEC` transaction. Issuing
//! them as separate round trips would let two instances read the same stale
//! cardinality and both admit a request that only one of them should.
//!
//! ## Failures
//!
//! The connection is established lazily, so a limiter can start while Redis is
//! down. Every call is bounded by `timeout`; connection errors, aborted
//! transactions and elapsed deadlines all come back as [`StoreError`], never as
//! an empty window.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::OnceCell;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{window_millis, WindowCount, WindowStore};
use super::quota::MAX_WINDOW;
use crate::error::{Result as WardenResult, StoreError};

/// Configuration for the Redis window store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Key prefix for window keys (default: "ratelimit:")
    pub key_prefix: String,
    /// Deadline for each Redis round trip, connection included (default: 250ms)
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratelimit:".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Sliding-window store on Redis sorted sets.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `url` with default configuration.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be parsed. No connection is made yet.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        Self::with_config(url, RedisStoreConfig::default())
    }

    /// Create a store for `url` with custom configuration.
    pub fn with_config(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            config,
        })
    }

    /// Create a store and verify the server answers.
    pub async fn connect(url: &str, config: RedisStoreConfig) -> WardenResult<Self> {
        let store = Self::with_config(url, config)?;
        store.probe().await?;
        Ok(store)
    }

    /// The store configuration.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}{}", self.config.key_prefix, identifier)
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        self.connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }

    async fn with_deadline<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.config.timeout)),
        }
    }
}

/// Upper score bound of events that have left the window, inclusive.
fn purge_bound(now: u64, window_ms: u64) -> String {
    match now.checked_sub(window_ms) {
        Some(cutoff) => cutoff.to_string(),
        None => "-inf".to_string(),
    }
}

/// Key TTL for a window, capped so `PEXPIRE` never overflows server-side.
fn ttl_millis(window_ms: u64) -> i64 {
    i64::try_from(window_ms.min(window_millis(MAX_WINDOW))).unwrap_or(i64::MAX)
}

fn to_window_count(count: u64, oldest: &[(String, f64)], window_ms: u64) -> WindowCount {
    if count == 0 {
        return WindowCount::EMPTY;
    }
    WindowCount {
        count,
        reset_at: oldest
            .first()
            .map(|(_, score)| (*score as u64).saturating_add(window_ms)),
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn record_and_count(
        &self,
        identifier: &str,
        window: Duration,
        now: u64,
    ) -> Result<WindowCount, StoreError> {
        let key = self.key(identifier);
        let window_ms = window_millis(window);
        let member = format!("{}:{}", now, Uuid::new_v4());
        let ttl_ms = ttl_millis(window_ms);

        let (count, oldest): (u64, Vec<(String, f64)>) = self
            .with_deadline(async {
                let mut conn = self.connection().await?;
                redis::pipe()
                    .atomic()
                    .zrembyscore(&key, "-inf", purge_bound(now, window_ms))
                    .ignore()
                    .zadd(&key, &member, now)
                    .ignore()
                    .zcard(&key)
                    .zrange_withscores(&key, 0, 0)
                    .pexpire(&key, ttl_ms)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        trace!(key = %key, count, "Recorded shared window event");
        Ok(to_window_count(count, &oldest, window_ms))
    }

    async fn peek(
        &self,
        identifier: &str,
        window: Duration,
        now: u64,
    ) -> Result<WindowCount, StoreError> {
        let key = self.key(identifier);
        let window_ms = window_millis(window);

        let (count, oldest): (u64, Vec<(String, f64)>) = self
            .with_deadline(async {
                let mut conn = self.connection().await?;
                redis::pipe()
                    .atomic()
                    .zrembyscore(&key, "-inf", purge_bound(now, window_ms))
                    .ignore()
                    .zcard(&key)
                    .zrange_withscores(&key, 0, 0)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(to_window_count(count, &oldest, window_ms))
    }

    async fn clear(&self, identifier: &str) -> Result<(), StoreError> {
        let key = self.key(identifier);
        let removed: i64 = self
            .with_deadline(async {
                let mut conn = self.connection().await?;
                conn.del(&key).await
            })
            .await?;

        debug!(key = %key, removed, "Cleared shared window");
        Ok(())
    }

    async fn sweep(&self, _now: u64) -> Result<usize, StoreError> {
        // Keys carry their own PEXPIRE
        Ok(0)
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let pong: String = self
            .with_deadline(async {
                let mut conn = self.connection().await?;
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
