//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::backend::{window_millis, WindowCount, WindowStore};
use super::health::{Backend, BackendHealth, HealthHook, ProbeBackoff, Supervisor};
use super::local::{LocalStore, DEFAULT_MAX_ENTRIES};
use super::quota::{Preset, Quota};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Default deadline for a shared-store call before it counts as unavailable.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The quota's request allowance
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Epoch ms at which the oldest counted request leaves the window
    pub reset_at: u64,
    /// How long a rejected caller should wait
    pub retry_after: Option<Duration>,
    /// Store that counted this request
    pub backend: Backend,
}

impl Decision {
    fn from_count(quota: &Quota, counted: WindowCount, now: u64, backend: Backend) -> Self {
        let limit = quota.max_requests();
        let allowed = limit > 0 && counted.count <= limit;
        let reset_at = counted
            .reset_at
            .unwrap_or_else(|| now.saturating_add(window_millis(quota.window())));
        let retry_after = if allowed {
            None
        } else {
            Some(Duration::from_millis(reset_at.saturating_sub(now)))
        };

        Self {
            allowed,
            limit,
            remaining: limit.saturating_sub(counted.count),
            reset_at,
            retry_after,
            backend,
        }
    }

    /// Standard rate limit response headers for this decision.
    ///
    /// `X-RateLimit-Reset` is in epoch seconds and `Retry-After` in seconds,
    /// both rounded up.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.div_ceil(1000).to_string()),
        ];
        if let Some(wait) = self.retry_after {
            let millis = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            headers.push(("Retry-After", millis.div_ceil(1000).to_string()));
        }
        headers
    }
}

/// Outcome of [`RateLimiter::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Requests counted in the current window
    pub count: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Epoch ms at which the oldest counted request leaves the window,
    /// `None` when nothing is counted
    pub reset_at: Option<u64>,
    /// Store that answered
    pub backend: Backend,
}

/// Sliding-window rate limiter over a shared store with a local fallback.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
/// Every call returns an answer: shared-store failures are absorbed by
/// switching to the local store until a background probe sees it recover.
/// While degraded, limits are enforced per process rather than fleet-wide.
#[derive(Debug)]
pub struct RateLimiter {
    local: Arc<LocalStore>,
    supervisor: Supervisor,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a local-only rate limiter with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a rate limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Count one request for `identifier` and decide whether it may proceed.
    ///
    /// The attempt is recorded whether or not it is allowed. A quota with
    /// `max_requests == 0` rejects every request.
    pub async fn check(&self, identifier: &str, quota: &Quota) -> Decision {
        let now = self.clock.now_millis();
        let (counted, backend) = self.record(identifier, quota.window(), now).await;
        let decision = Decision::from_count(quota, counted, now, backend);

        trace!(
            identifier = %identifier,
            count = counted.count,
            limit = decision.limit,
            backend = ?backend,
            "Checked rate limit"
        );
        if !decision.allowed {
            debug!(
                identifier = %identifier,
                count = counted.count,
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// [`check`](Self::check) with the default quota (100 requests per 15 minutes).
    pub async fn check_default(&self, identifier: &str) -> Decision {
        self.check(identifier, &Quota::default()).await
    }

    /// [`check`](Self::check) under a named preset, in that preset's own keyspace.
    pub async fn check_preset(&self, preset: Preset, identifier: &str) -> Decision {
        self.check(&preset.key(identifier), &preset.quota()).await
    }

    /// Report an identifier's usage without counting a request.
    pub async fn status(&self, identifier: &str, quota: &Quota) -> Status {
        let now = self.clock.now_millis();
        let window = quota.window();

        let (counted, backend) = match self.supervisor.route() {
            Some(shared) => {
                match self.bounded(shared.peek(identifier, window, now)).await {
                    Ok(counted) => {
                        self.supervisor.report_success();
                        (counted, Backend::Shared)
                    }
                    Err(error) => {
                        self.supervisor.report_failure(&error);
                        (self.local.count(identifier, window, now), Backend::Local)
                    }
                }
            }
            None => (self.local.count(identifier, window, now), Backend::Local),
        };

        Status {
            count: counted.count,
            remaining: quota.max_requests().saturating_sub(counted.count),
            reset_at: counted.reset_at,
            backend,
        }
    }

    /// Forget everything recorded for an identifier.
    ///
    /// The local window is always cleared. The shared window is cleared when
    /// the shared store is reachable.
    pub async fn reset(&self, identifier: &str) {
        self.local.remove(identifier);

        if let Some(shared) = self.supervisor.route() {
            match self.bounded(shared.clear(identifier)).await {
                Ok(()) => self.supervisor.report_success(),
                Err(error) => {
                    warn!(
                        identifier = %identifier,
                        error = %error,
                        "Could not clear shared window"
                    );
                    self.supervisor.report_failure(&error);
                }
            }
        }

        debug!(identifier = %identifier, "Reset rate limit window");
    }

    /// Evict expired windows. Returns the number of identifiers removed.
    ///
    /// Safe to run on a timer alongside in-flight checks.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let mut evicted = self.local.sweep_expired(now);

        if let Some(shared) = self.supervisor.route() {
            match self.bounded(shared.sweep(now)).await {
                Ok(removed) => evicted += removed,
                Err(error) => self.supervisor.report_failure(&error),
            }
        }

        evicted
    }

    /// Current shared-store health.
    pub fn health(&self) -> BackendHealth {
        self.supervisor.health()
    }

    /// Store that the next call would use.
    pub fn backend(&self) -> Backend {
        if self.supervisor.health().routes_to_shared() {
            Backend::Shared
        } else {
            Backend::Local
        }
    }

    /// Number of identifiers tracked by the local store.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    async fn record(&self, identifier: &str, window: Duration, now: u64) -> (WindowCount, Backend) {
        if let Some(shared) = self.supervisor.route() {
            let owned = identifier.to_string();
            // Detached so that dropping the caller's future still counts the attempt
            let task =
                tokio::spawn(async move { shared.record_and_count(&owned, window, now).await });

            let outcome = match tokio::time::timeout(self.store_timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(StoreError::Unavailable(join_error.to_string())),
                Err(_) => Err(StoreError::Timeout(self.store_timeout)),
            };

            match outcome {
                Ok(counted) => {
                    self.supervisor.report_success();
                    return (counted, Backend::Shared);
                }
                Err(error) => self.supervisor.report_failure(&error),
            }
        }

        (self.local.record(identifier, window, now), Backend::Local)
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    shared: Option<Arc<dyn WindowStore>>,
    clock: Option<Arc<dyn Clock>>,
    max_entries: Option<usize>,
    store_timeout: Option<Duration>,
    backoff: Option<ProbeBackoff>,
    hook: Option<HealthHook>,
}

impl RateLimiterBuilder {
    /// Use a shared window store, falling back to the local store when it fails.
    pub fn shared_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Use a specific clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Identifiers the local store tracks before sweeping lazily.
    pub fn max_local_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Deadline for each shared-store call.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Re-probe schedule while the shared store is down.
    pub fn probe_backoff(mut self, backoff: ProbeBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Observe shared-store health transitions.
    pub fn on_health_change(mut self, hook: HealthHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Build the rate limiter.
    pub fn build(self) -> RateLimiter {
        let local = Arc::new(LocalStore::with_capacity(
            self.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
        ));
        let store_timeout = self.store_timeout.unwrap_or(DEFAULT_STORE_TIMEOUT);
        let supervisor = Supervisor::new(
            self.shared,
            self.backoff.unwrap_or_default(),
            store_timeout,
            self.hook,
        );

        RateLimiter {
            local,
            supervisor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            store_timeout,
        }
    }
}
