use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::ratelimit::{Preset, Quota, RateLimiter, RedisStore, Sweeper};

/// Inspect and administer sliding-window rate limits.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results and logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count one request for an identifier and report the decision
    Check {
        identifier: String,
        #[command(flatten)]
        quota: QuotaArgs,
    },
    /// Report an identifier's usage without counting a request
    Status {
        identifier: String,
        #[command(flatten)]
        quota: QuotaArgs,
    },
    /// Forget everything recorded for an identifier
    Reset { identifier: String },
    /// Evict expired windows once
    Sweep,
    /// List the built-in presets
    Presets,
    /// Sweep expired windows on the configured interval until interrupted
    Watch,
}

#[derive(Debug, clap::Args)]
struct QuotaArgs {
    /// Requests allowed per window (defaults to the configured limit)
    #[arg(long = "max", allow_negative_numbers = true)]
    max_requests: Option<i64>,

    /// Window length in milliseconds (defaults to the configured window)
    #[arg(long, allow_negative_numbers = true)]
    window_ms: Option<i64>,

    /// Use a named preset instead of an explicit quota
    #[arg(long, conflicts_with_all = ["max_requests", "window_ms"])]
    preset: Option<Preset>,
}

impl QuotaArgs {
    /// Resolve to a window key and quota.
    fn resolve(&self, identifier: &str, config: &WardenConfig) -> anyhow::Result<(String, Quota)> {
        if let Some(preset) = self.preset {
            return Ok((preset.key(identifier), preset.quota()));
        }
        let quota = Quota::from_millis(
            self.max_requests.unwrap_or(config.limits.max_requests),
            self.window_ms.unwrap_or(config.limits.window_ms),
        )?;
        Ok((identifier.to_string(), quota))
    }
}

#[derive(Debug, Serialize)]
struct PresetRow {
    name: Preset,
    max_requests: u64,
    window_ms: u128,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = WardenConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(redis = config.redis.url.is_some(), "Configuration loaded");

    let limiter = Arc::new(build_limiter(&config)?);

    match cli.command {
        Command::Check { identifier, quota } => {
            let (key, quota) = quota.resolve(&identifier, &config)?;
            let decision = limiter.check(&key, &quota).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                println!(
                    "{}: {} ({} of {} remaining, backend {:?})",
                    key,
                    if decision.allowed { "allowed" } else { "denied" },
                    decision.remaining,
                    decision.limit,
                    decision.backend
                );
                for (name, value) in decision.headers() {
                    println!("  {}: {}", name, value);
                }
            }
        }
        Command::Status { identifier, quota } => {
            let (key, quota) = quota.resolve(&identifier, &config)?;
            let status = limiter.status(&key, &quota).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{}: {} counted, {} remaining, resets {}",
                    key,
                    status.count,
                    status.remaining,
                    status
                        .reset_at
                        .map(|ms| ms.to_string())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
        Command::Reset { identifier } => {
            limiter.reset(&identifier).await;
            if cli.json {
                println!("{}", serde_json::json!({ "reset": identifier }));
            } else {
                println!("{}: reset", identifier);
            }
        }
        Command::Sweep => {
            let evicted = limiter.cleanup().await;
            if cli.json {
                println!("{}", serde_json::json!({ "evicted": evicted }));
            } else {
                println!("evicted {} expired windows", evicted);
            }
        }
        Command::Presets => {
            let rows: Vec<PresetRow> = Preset::ALL
                .iter()
                .map(|preset| PresetRow {
                    name: *preset,
                    max_requests: preset.quota().max_requests(),
                    window_ms: preset.quota().window().as_millis(),
                })
                .collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!(
                        "{:<8} {:>4} requests / {} ms",
                        row.name.to_string(),
                        row.max_requests,
                        row.window_ms
                    );
                }
            }
        }
        Command::Watch => {
            let interval = config.sweep_interval();
            let sweeper = Sweeper::spawn(limiter.clone(), interval);
            info!(interval_secs = interval.as_secs(), "Watching rate limit windows");

            shutdown_signal().await;
            sweeper.shutdown().await;
            info!(tracked = limiter.local_len(), "Stopped watching");
        }
    }

    if limiter.health() == ratewarden::BackendHealth::SharedDown {
        warn!("Shared store was unreachable; results reflect this process only");
    }

    Ok(())
}

fn build_limiter(config: &WardenConfig) -> anyhow::Result<RateLimiter> {
    let mut builder = RateLimiter::builder()
        .max_local_entries(config.local.max_entries)
        .probe_backoff(config.probe_backoff());

    if let Some(url) = &config.redis.url {
        let store = RedisStore::with_config(url, config.redis_store_config())
            .with_context(|| format!("invalid redis url {}", url))?;
        builder = builder
            .shared_store(Arc::new(store))
            .store_timeout(config.redis_store_config().timeout * 2);
    }

    Ok(builder.build())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
