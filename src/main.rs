use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::Settings;
use ratewarden::ratelimit::{duration, LimitOptions, Ratelimiter};
use ratewarden::region::RegionContext;
use ratewarden::store::RedisStore;

/// Check and manage rate limits stored in Redis.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "ratewarden.yaml")]
    config: String,

    /// Log filter, e.g. `info` or `ratewarden=debug`
    #[arg(long, default_value = "info")]
    log: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume units for an identifier and print the decision
    Check {
        identifier: String,
        #[arg(long, default_value_t = 1)]
        rate: u64,
    },
    /// Retry until the identifier is allowed or the timeout passes
    Wait {
        identifier: String,
        /// How long to wait, e.g. `30 s`
        #[arg(long, default_value = "10 s")]
        timeout: String,
    },
    /// Print the units left for an identifier
    Remaining { identifier: String },
    /// Clear everything consumed by an identifier
    Reset { identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log).context("invalid log filter")?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let settings = Settings::from_file(&cli.config)?;
    info!(config = %cli.config, regions = settings.regions.len(), "Configuration loaded");

    let mut regions = Vec::with_capacity(settings.regions.len());
    for region in &settings.regions {
        let store = RedisStore::connect(&region.url, region.cache_scripts)
            .await
            .with_context(|| format!("failed to connect to region {}", region.name))?;
        regions.push(RegionContext::new(region.name.clone(), Arc::new(store)));
    }
    let limiter = Ratelimiter::new(settings.limiter_config(regions)?)?;

    let output = match cli.command {
        Command::Check { identifier, rate } => {
            let response = limiter
                .limit_with(&identifier, LimitOptions::rate(rate))
                .await?;
            let output = serde_json::to_value(&response)?;
            response.pending.wait().await;
            output
        }
        Command::Wait {
            identifier,
            timeout,
        } => {
            let timeout = duration::parse(&timeout)?;
            tokio::select! {
                response = limiter.block_until_ready(&identifier, timeout) => {
                    let response = response?;
                    let output = serde_json::to_value(&response)?;
                    response.pending.wait().await;
                    output
                }
                _ = shutdown_signal() => {
                    info!("Interrupted while waiting");
                    return Ok(());
                }
            }
        }
        Command::Remaining { identifier } => {
            let remaining = limiter.get_remaining(&identifier).await?;
            json!({ "identifier": identifier, "remaining": remaining })
        }
        Command::Reset { identifier } => {
            limiter.reset_used_tokens(&identifier).await?;
            json!({ "identifier": identifier, "reset": true })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
