//! Ratewarden - Sliding-Window Rate Limiting
//!
//! This crate limits how many requests an identifier (client address, user id,
//! API key) may make within a trailing time window. Windows are kept in Redis
//! so every instance of a service enforces the same limit, with an in-process
//! store taking over whenever Redis is unreachable.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::WardenConfig;
pub use error::{Result, StoreError, WardenError};
pub use ratelimit::{Backend, BackendHealth, Decision, Preset, Quota, RateLimiter, Status};
