//! Command-line front end.

use crate::config::DaemonConfig;
use crate::control::ControlSurface;
use crate::monitor::Monitor;
use anyhow::Result;
use blockwatch_core::{
    DeviceProbe, InMemoryTree, MonitorSwitch, NetlinkSource, SyncContext,
};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line of `bw-mgmt`.
#[derive(Parser)]
#[command(name = "bw-mgmt")]
#[command(about = "blockwatch block device event monitor", long_about = None)]
pub struct Cli {
    /// Configuration file (`.toml` or `.json`).
    #[arg(short, long, env = "BW_CONFIG", default_value = "/etc/blockwatch/blockwatch.toml")]
    pub config: PathBuf,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// `bw-mgmt` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Reconcile kernel events into the model until interrupted.
    Monitor,
    /// Scan and list block devices.
    List {
        /// Print full device summaries as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Resolve a device spec (name, /dev/name, UUID=..., LABEL=...).
    Resolve {
        /// The spec to resolve.
        spec: String,
    },
    /// Print the effective configuration.
    CheckConfig,
}

impl Cli {
    /// Run the selected command with `config`.
    pub async fn run(self, config: DaemonConfig) -> Result<()> {
        match self.command {
            Command::Monitor => monitor(config).await,
            Command::List { json } => list(&config, json),
            Command::Resolve { ref spec } => resolve(&config, spec),
            Command::CheckConfig => check_config(&config),
        }
    }
}

fn scan(config: &DaemonConfig) -> ControlSurface<InMemoryTree> {
    let ctx = SyncContext::new(MonitorSwitch::new(false), &config.sync);
    let lock = Arc::new(Mutex::new(InMemoryTree::new(ctx)));
    let control = ControlSurface::new(lock, Arc::new(config.probe()) as Arc<dyn DeviceProbe>);
    control.reset();
    control
}

async fn monitor(config: DaemonConfig) -> Result<()> {
    let source = NetlinkSource::new(config.manager.clone());
    let monitor = Arc::new(Monitor::new(
        &config,
        Box::new(source),
        Arc::new(config.probe()),
    ));
    monitor.start()?;
    tracing::info!("monitoring block device events, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    let stopping = Arc::clone(&monitor);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    Ok(())
}

fn list(config: &DaemonConfig, json: bool) -> Result<()> {
    let control = scan(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&control.list_devices())?);
    } else {
        for name in control.list_device_names() {
            println!("{}", name);
        }
    }
    Ok(())
}

fn resolve(config: &DaemonConfig, spec: &str) -> Result<()> {
    let control = scan(config);
    let device = control.resolve_device(spec)?;
    println!("{}", serde_json::to_string_pretty(&device)?);
    Ok(())
}

fn check_config(config: &DaemonConfig) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
