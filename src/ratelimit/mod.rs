//! Sliding-window rate limiting over a shared store with a local fallback.

mod backend;
mod health;
mod limiter;
mod local;
mod quota;
mod shared;
mod sweeper;

pub use backend::{WindowCount, WindowStore};
pub use health::{Backend, BackendHealth, HealthHook, ProbeBackoff, Supervisor};
pub use limiter::{Decision, RateLimiter, RateLimiterBuilder, Status, DEFAULT_STORE_TIMEOUT};
pub use local::{LocalStore, DEFAULT_MAX_ENTRIES};
pub use quota::{Preset, Quota, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW};
pub use shared::{RedisStore, RedisStoreConfig};
pub use sweeper::{Sweeper, DEFAULT_SWEEP_INTERVAL};
