//! Validated request quotas and the built-in presets.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Default request allowance per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;
/// Default trailing window (15 minutes).
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(15 * 60 * 1000);
/// Longest accepted window (366 days). Keeps Redis key expiry in range.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// How many requests an identifier may make in a trailing window.
///
/// A `Quota` is validated when it is built, so the limiter never has to
/// reject one. Use the same quota for a given identifier for the whole of its
/// window: the count is always taken against the window of the current call,
/// and changing it mid-window counts the existing history under the new
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    max_requests: u64,
    window: Duration,
}

impl Quota {
    /// Create a quota.
    ///
    /// `max_requests` may be zero, which rejects every request. The window
    /// must be at least one millisecond and at most [`MAX_WINDOW`].
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if window.as_millis() == 0 {
            return Err(WardenError::InvalidArgument(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }
        if window > MAX_WINDOW {
            return Err(WardenError::InvalidArgument(format!(
                "window {:?} exceeds the maximum of {:?}",
                window, MAX_WINDOW
            )));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Create a quota from raw signed values, as they arrive from config or callers.
    ///
    /// Negative values are rejected, never clamped.
    pub fn from_millis(max_requests: i64, window_ms: i64) -> Result<Self> {
        let max_requests = u64::try_from(max_requests).map_err(|_| {
            WardenError::InvalidArgument(format!(
                "max_requests must not be negative, got {}",
                max_requests
            ))
        })?;
        let window_ms = u64::try_from(window_ms).map_err(|_| {
            WardenError::InvalidArgument(format!(
                "window_ms must not be negative, got {}",
                window_ms
            ))
        })?;
        Self::new(max_requests, Duration::from_millis(window_ms))
    }

    /// Maximum requests admitted per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Named quotas for the storefront's endpoint classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Sign-in and credential endpoints
    Auth,
    /// JSON API endpoints
    Api,
    /// GraphQL endpoint
    Graphql,
    /// Form submissions (quotes, contact)
    Forms,
    /// File uploads
    Uploads,
    /// Everything else
    General,
    /// Product search
    Search,
}

impl Preset {
    /// Every preset, in display order.
    pub const ALL: [Preset; 7] = [
        Preset::Auth,
        Preset::Api,
        Preset::Graphql,
        Preset::Forms,
        Preset::Uploads,
        Preset::General,
        Preset::Search,
    ];

    /// The quota this preset applies.
    pub fn quota(&self) -> Quota {
        let (max_requests, window_secs) = match self {
            Preset::Auth => (5, 15 * 60),
            Preset::Api => (60, 60),
            Preset::Graphql => (100, 60),
            Preset::Forms => (5, 60),
            Preset::Uploads => (10, 60 * 60),
            Preset::General => (100, 15 * 60),
            Preset::Search => (20, 60),
        };
        Quota {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Prefix that keeps this preset's windows apart from other presets'.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Preset::Auth => "auth",
            Preset::Api => "api",
            Preset::Graphql => "graphql",
            Preset::Forms => "forms",
            Preset::Uploads => "uploads",
            Preset::General => "general",
            Preset::Search => "search",
        }
    }

    /// Window key for an identifier under this preset.
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_prefix(), identifier)
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_prefix())
    }
}

impl FromStr for Preset {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .iter()
            .copied()
            .find(|p| p.key_prefix().eq_ignore_ascii_case(s))
            .ok_or_else(|| WardenError::InvalidArgument(format!("unknown preset: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quota() {
        let quota = Quota::default();
        assert_eq!(quota.max_requests(), 100);
        assert_eq!(quota.window(), Duration::from_millis(900_000));
    }

    #[test]
    fn test_zero_max_requests_allowed() {
        let quota = Quota::new(0, Duration::from_secs(1)).unwrap();
        assert_eq!(quota.max_requests(), 0);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(matches!(
            Quota::new(10, Duration::ZERO),
            Err(WardenError::InvalidArgument(_))
        ));
        assert!(matches!(
            Quota::new(10, Duration::from_micros(999)),
            Err(WardenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_window_ceiling() {
        assert!(Quota::new(10, MAX_WINDOW).is_ok());
        assert!(matches!(
            Quota::new(10, MAX_WINDOW + Duration::from_millis(1)),
            Err(WardenError::InvalidArgument(_))
        ));
        assert!(Quota::from_millis(10, i64::MAX).is_err());
    }

    #[test]
    fn test_negative_values_rejected() {
        assert!(matches!(
            Quota::from_millis(-1, 60_000),
            Err(WardenError::InvalidArgument(_))
        ));
        assert!(matches!(
            Quota::from_millis(10, -60_000),
            Err(WardenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_millis() {
        let quota = Quota::from_millis(3, 60_000).unwrap();
        assert_eq!(quota.max_requests(), 3);
        assert_eq!(quota.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_preset_quotas() {
        assert_eq!(Preset::Auth.quota().max_requests(), 5);
        assert_eq!(Preset::Auth.quota().window(), Duration::from_secs(900));
        assert_eq!(Preset::Uploads.quota().window(), Duration::from_secs(3600));
        assert_eq!(Preset::General.quota(), Quota::default());
    }

    #[test]
    fn test_preset_keys_are_namespaced() {
        assert_eq!(Preset::Search.key("10.0.0.1"), "search:10.0.0.1");
        assert_ne!(Preset::Api.key("u1"), Preset::Forms.key("u1"));
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("graphql".parse::<Preset>().unwrap(), Preset::Graphql);
        assert_eq!("FORMS".parse::<Preset>().unwrap(), Preset::Forms);
        assert!("bogus".parse::<Preset>().is_err());
    }
}
