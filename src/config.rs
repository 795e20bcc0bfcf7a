//! Configuration management for Ratewarden.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! `RATEWARDEN__*` environment variables (for example
//! `RATEWARDEN__REDIS__URL=redis://cache:6379/`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::ratelimit::{ProbeBackoff, Quota, RedisStoreConfig};

/// Main configuration for the limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Default quota
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shared store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Local store configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Re-probe schedule while the shared store is down
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Default quota configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: i64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_max_requests() -> i64 {
    100
}

fn default_window_ms() -> i64 {
    900_000
}

/// Redis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL. Without one the limiter runs local-only.
    pub url: Option<String>,

    /// Prefix for window keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Tracked identifiers before a lazy sweep
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Background sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_entries() -> usize {
    10000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Re-probe backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ms: default_jitter(),
        }
    }
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_jitter() -> u64 {
    250
}

impl WardenConfig {
    /// Parse configuration from YAML.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: WardenConfig =
            serde_yaml::from_str(contents).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load defaults, an optional YAML file, and `RATEWARDEN__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }
        let config: WardenConfig = builder
            .add_source(
                ::config::Environment::with_prefix("RATEWARDEN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.quota()?;
        if self.redis.timeout_ms == 0 {
            return Err(WardenError::Config(
                "redis.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.probe.base_delay_ms > self.probe.max_delay_ms {
            return Err(WardenError::Config(format!(
                "probe.base_delay_ms ({}) exceeds probe.max_delay_ms ({})",
                self.probe.base_delay_ms, self.probe.max_delay_ms
            )));
        }
        Ok(())
    }

    /// The configured default quota.
    pub fn quota(&self) -> Result<Quota> {
        Quota::from_millis(self.limits.max_requests, self.limits.window_ms)
    }

    /// Settings for the Redis store.
    pub fn redis_store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_prefix: self.redis.key_prefix.clone(),
            timeout: Duration::from_millis(self.redis.timeout_ms),
        }
    }

    /// Re-probe schedule.
    pub fn probe_backoff(&self) -> ProbeBackoff {
        ProbeBackoff {
            base: Duration::from_millis(self.probe.base_delay_ms),
            max: Duration::from_millis(self.probe.max_delay_ms),
            jitter: Duration::from_millis(self.probe.jitter_ms),
        }
    }

    /// Interval for the background sweeper.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.local.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();

        assert_eq!(config.limits.max_requests, 100);
        assert_eq!(config.limits.window_ms, 900_000);
        assert_eq!(config.redis.url, None);
        assert_eq!(config.redis.key_prefix, "ratelimit:");
        assert_eq!(config.local.max_entries, 10000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.quota().unwrap(), Quota::default());
        assert_eq!(config.probe_backoff(), ProbeBackoff::default());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
limits:
  max_requests: 5
  window_ms: 60000
redis:
  url: "redis://cache:6379/"
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limits.max_requests, 5);
        assert_eq!(config.quota().unwrap().window(), Duration::from_secs(60));
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.redis.timeout_ms, 250);
        assert_eq!(config.local.sweep_interval_secs, 60);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = WardenConfig::from_yaml("{}").unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_negative_limits_rejected() {
        let yaml = "limits:\n  max_requests: -1\n";
        assert!(matches!(
            WardenConfig::from_yaml(yaml),
            Err(WardenError::InvalidArgument(_))
        ));

        let yaml = "limits:\n  window_ms: 0\n";
        assert!(WardenConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_probe_bounds_validated() {
        let yaml = "probe:\n  base_delay_ms: 5000\n  max_delay_ms: 100\n";
        assert!(matches!(
            WardenConfig::from_yaml(yaml),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            WardenConfig::from_yaml("limits: [1, 2"),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "local:\n  sweep_interval_secs: 5\nredis:\n  key_prefix: \"rl:\"\n")
            .unwrap();

        let config = WardenConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.redis.key_prefix, "rl:");
    }

    #[test]
    fn test_from_file_missing() {
        let path = std::env::temp_dir().join(format!("ratewarden-missing-{}.yaml", uuid::Uuid::new_v4()));

        assert!(matches!(
            WardenConfig::from_file(path.to_str().unwrap()),
            Err(WardenError::Io(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "local:\n  max_entries: 42\n").unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.local.max_entries, 42);
        assert_eq!(config.limits.max_requests, 100);
    }

    #[test]
    fn test_redis_store_config() {
        let mut config = WardenConfig::default();
        config.redis.key_prefix = "rl:".to_string();
        config.redis.timeout_ms = 75;

        let store = config.redis_store_config();
        assert_eq!(store.key_prefix, "rl:");
        assert_eq!(store.timeout, Duration::from_millis(75));
    }
}
