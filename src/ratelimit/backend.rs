//! Window store trait for abstracting local and shared implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Result of counting an identifier's trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Events inside the window after purging
    pub count: u64,
    /// Epoch ms at which the oldest counted event rolls off.
    /// `None` when the window is empty.
    pub reset_at: Option<u64>,
}

impl WindowCount {
    /// An identifier with nothing in its window.
    pub const EMPTY: WindowCount = WindowCount {
        count: 0,
        reset_at: None,
    };
}

/// Convert a window to whole milliseconds, saturating.
pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// Trait for sliding-window stores.
///
/// This trait abstracts over the in-process `LocalStore` and the Redis-backed
/// `RedisStore` so the limiter can route each call to whichever is healthy.
/// Every method receives `now` from the limiter's clock.
#[async_trait]
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    /// Purge expired events, record one event at `now`, and count.
    ///
    /// Calling this consumes one unit of quota; call it once per request.
    async fn record_and_count(
        &self,
        identifier: &str,
        window: Duration,
        now: u64,
    ) -> Result<WindowCount, StoreError>;

    /// Purge expired events and count without recording.
    async fn peek(
        &self,
        identifier: &str,
        window: Duration,
        now: u64,
    ) -> Result<WindowCount, StoreError>;

    /// Drop all state for an identifier.
    async fn clear(&self, identifier: &str) -> Result<(), StoreError>;

    /// Evict fully expired identifiers. Returns how many were removed.
    async fn sweep(&self, now: u64) -> Result<usize, StoreError>;

    /// Cheap liveness check used when re-probing a failed backend.
    async fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
