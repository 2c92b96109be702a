#![warn(missing_docs)]

//! `bw-mgmt`: block device event monitor.

use anyhow::Result;
use blockwatch_mgmt::cli::Cli;
use blockwatch_mgmt::DaemonConfig;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        Some(DaemonConfig::from_file(&cli.config)?)
    } else {
        None
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.as_ref().map_or("info", |c| c.log_filter.as_str()))
    });
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("blockwatch management CLI starting...");

    let config = match config {
        Some(config) => config,
        None => {
            tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
            DaemonConfig::default()
        }
    };
    cli.run(config).await
}
