//! Shared-store health tracking and re-probing.
//!
//! The supervisor decides, per call, whether the shared store may be used:
//!
//! ```text
//! Unknown -> Probing -> SharedHealthy
//!               |            |
//!               v            v
//!            SharedDown <----+
//!               |
//!               +--(background probe succeeds)--> SharedHealthy
//! ```
//!
//! While `SharedDown`, every call is served by the local store and a single
//! background task re-probes the shared store on an exponential backoff.
//! Windows tracked locally during an outage are not copied back on recovery;
//! each identifier starts a fresh window on the shared store.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::WindowStore;
use crate::error::StoreError;

/// Health of the shared window store as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    /// No shared store is configured
    LocalOnly,
    /// The shared store has not been used yet
    Unknown,
    /// First shared call is in flight
    Probing,
    /// Last shared call succeeded
    SharedHealthy,
    /// Last shared call failed; calls are served locally
    SharedDown,
}

impl BackendHealth {
    /// Whether calls in this state go to the shared store.
    pub fn routes_to_shared(&self) -> bool {
        matches!(
            self,
            BackendHealth::Unknown | BackendHealth::Probing | BackendHealth::SharedHealthy
        )
    }
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendHealth::LocalOnly => "local_only",
            BackendHealth::Unknown => "unknown",
            BackendHealth::Probing => "probing",
            BackendHealth::SharedHealthy => "shared_healthy",
            BackendHealth::SharedDown => "shared_down",
        };
        f.write_str(name)
    }
}

/// Which store answered a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Shared,
    Local,
}

/// Observer for health transitions, called with `(from, to)`.
pub type HealthHook = Arc<dyn Fn(BackendHealth, BackendHealth) + Send + Sync>;

/// Re-probe delay schedule: exponential from `base`, capped at `max`, plus
/// up to `jitter` of random spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for ProbeBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl ProbeBackoff {
    /// Delay before probe `attempt` (1-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let multiplier = 1u128 << exponent;
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let capped = nanos.min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay before probe `attempt` with random jitter added.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let spread = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        self.delay(attempt) + Duration::from_millis(extra)
    }
}

struct SupervisorInner {
    shared: Option<Arc<dyn WindowStore>>,
    state: Mutex<BackendHealth>,
    backoff: ProbeBackoff,
    probe_timeout: Duration,
    hook: Option<HealthHook>,
}

/// Routes calls between the shared and local store and owns the re-probe task.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("shared", &self.inner.shared)
            .field("state", &*self.inner.state.lock())
            .field("backoff", &self.inner.backoff)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor. Without a shared store it stays `LocalOnly`.
    ///
    /// Each background probe is abandoned after `probe_timeout` and counts
    /// as a failed attempt.
    pub fn new(
        shared: Option<Arc<dyn WindowStore>>,
        backoff: ProbeBackoff,
        probe_timeout: Duration,
        hook: Option<HealthHook>,
    ) -> Self {
        let initial = if shared.is_some() {
            BackendHealth::Unknown
        } else {
            BackendHealth::LocalOnly
        };
        Self {
            inner: Arc::new(SupervisorInner {
                shared,
                state: Mutex::new(initial),
                backoff,
                probe_timeout,
                hook,
            }),
        }
    }

    /// Current health.
    pub fn health(&self) -> BackendHealth {
        *self.inner.state.lock()
    }

    /// The shared store, if this call should use it.
    pub fn route(&self) -> Option<Arc<dyn WindowStore>> {
        let shared = self.inner.shared.as_ref()?;
        let previous = {
            let mut state = self.inner.state.lock();
            if !state.routes_to_shared() {
                return None;
            }
            if *state == BackendHealth::Unknown {
                *state = BackendHealth::Probing;
                Some(BackendHealth::Unknown)
            } else {
                None
            }
        };
        if let Some(from) = previous {
            self.announce(from, BackendHealth::Probing);
        }
        Some(shared.clone())
    }

    /// A shared call succeeded.
    pub fn report_success(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            match *state {
                BackendHealth::Unknown | BackendHealth::Probing => {
                    let from = *state;
                    *state = BackendHealth::SharedHealthy;
                    Some(from)
                }
                // A late success from a call issued before an outage was
                // detected does not end the outage; the probe task does.
                _ => None,
            }
        };
        if let Some(from) = previous {
            self.announce(from, BackendHealth::SharedHealthy);
        }
    }

    /// A shared call failed. Moves to `SharedDown` and starts the re-probe
    /// task, once per outage.
    pub fn report_failure(&self, error: &StoreError) {
        let previous = {
            let mut state = self.inner.state.lock();
            if !state.routes_to_shared() {
                return;
            }
            let from = *state;
            *state = BackendHealth::SharedDown;
            from
        };

        warn!(
            error = %error,
            from = %previous,
            "Shared window store unavailable, falling back to local store"
        );
        self.announce(previous, BackendHealth::SharedDown);
        self.spawn_reprobe();
    }

    fn announce(&self, from: BackendHealth, to: BackendHealth) {
        info!(from = %from, to = %to, "Window store health changed");
        if let Some(hook) = &self.inner.hook {
            hook(from, to);
        }
    }

    fn spawn_reprobe(&self) {
        let weak = Arc::downgrade(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(reprobe(weak));
            }
            Err(_) => warn!("No tokio runtime available; shared store will not be re-probed"),
        }
    }
}

/// Probe until the shared store answers or the supervisor is dropped.
///
/// No strong reference to the supervisor is held across an await.
async fn reprobe(weak: Weak<SupervisorInner>) {
    let mut attempt: u32 = 1;
    loop {
        let (delay, shared, probe_timeout) = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some(shared) = inner.shared.clone() else {
                return;
            };
            (inner.backoff.jittered_delay(attempt), shared, inner.probe_timeout)
        };
        tokio::time::sleep(delay).await;

        let outcome = match tokio::time::timeout(probe_timeout, shared.probe()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(probe_timeout)),
        };

        match outcome {
            Ok(()) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                {
                    let mut state = inner.state.lock();
                    *state = BackendHealth::SharedHealthy;
                }
                let supervisor = Supervisor { inner };
                supervisor.announce(BackendHealth::SharedDown, BackendHealth::SharedHealthy);
                info!(attempt, store = shared.name(), "Shared window store recovered");
                return;
            }
            Err(error) => {
                debug!(attempt, error = %error, "Shared window store probe failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
