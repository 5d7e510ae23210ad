//! slotshare epoch driver
//!
//! Exit codes: 0 on graceful shutdown, 2 on invalid configuration, 1 on a
//! fatal store or driver error.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use slotshare_driver::cli::{Cli, Command};
use slotshare_driver::clients::{HttpLedger, HttpPoolSource, HttpStakeSource};
use slotshare_driver::store::SqliteStore;
use slotshare_driver::{Config, DriverDeps, EpochDriver};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.command {
        Command::Run(args) => match Config::from_args(args) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(2);
            }
        },
    };

    // Initialize tracing; RUST_LOG overrides the configured level.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Driver exited with a fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        network = %config.network_url,
        db_path = %config.db_path.display(),
        epoch_length = config.epoch.length_blocks,
        "Starting slotshare driver"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening state database {}", config.db_path.display()))?;

    let deps = DriverDeps {
        stakes: Arc::new(HttpStakeSource::new(&config.network_url, config.request_timeout)?),
        pools: Arc::new(HttpPoolSource::new(config.request_timeout)?),
        ledger: Arc::new(HttpLedger::new(&config.network_url, config.request_timeout)?),
        store: Arc::new(store),
    };

    let driver = EpochDriver::new(config, deps).context("restoring driver state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(driver.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut handle => {
            return match result {
                Ok(result) => result.context("epoch driver"),
                Err(e) => Err(e).context("epoch driver task panicked"),
            };
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for the driver to stop...");
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(result)) => result.context("epoch driver")?,
        Ok(Err(e)) => return Err(e).context("epoch driver task panicked"),
        Err(_) => warn!("Driver did not stop within the grace period"),
    }

    info!("Shutdown complete");
    Ok(())
}
