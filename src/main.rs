//! # API Aggregator - Main Entry Point
//!
//! Loads configuration, installs logging and metrics, and runs the
//! [`AggregatorServer`] until SIGINT or SIGTERM.
//!
//! Configuration is read from `AGGREGATOR_CONFIG_PATH` (default
//! `config/aggregator.yaml`). A missing file means defaults; `AGGREGATOR_*`
//! environment variables override either.

use anyhow::Context;
use std::path::Path;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use api_aggregator::observability::{init_logging, install_prometheus};
use api_aggregator::{AggregatorConfig, AggregatorServer};

const DEFAULT_CONFIG_PATH: &str = "config/aggregator.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("AGGREGATOR_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_found = Path::new(&config_path).exists();

    let config = if config_found {
        AggregatorConfig::load(&config_path)
            .await
            .with_context(|| format!("failed to load configuration from {}", config_path))?
    } else {
        let mut config = AggregatorConfig::default();
        config.apply_env_overrides().context("invalid environment override")?;
        config
    };

    init_logging(&config.observability).context("failed to initialise logging")?;
    if !config_found {
        warn!(path = %config_path, "Configuration file not found, using defaults");
    }

    if let Some(address) = &config.observability.metrics_bind_address {
        install_prometheus(address).context("failed to start metrics exporter")?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting API aggregator");

    let server = AggregatorServer::new(config)
        .await
        .context("failed to build aggregator")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    if let Err(e) = server.run(shutdown).await {
        error!(error = %e, "API aggregator failed");
        return Err(e.into());
    }

    info!("API aggregator shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
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
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
    shutdown.cancel();
}
