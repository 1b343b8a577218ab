//! Command-line front end for the device registry.
//!
//! Runs against the simulated driver; real hardware bindings plug in through
//! `SdrDriver`.
//!
//! ```bash
//! sdr-registry --devices 1D3AC,AABB list
//! sdr-registry --devices AABB run --config relay.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdr_registry::{logging, AppConfig, DeviceRegistry, Endpoint, EndpointConfig, MockDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared SDR device registry")]
struct Cli {
    /// Serial numbers of the simulated devices
    #[arg(long, value_delimiter = ',', default_value = "1D3AC")]
    devices: Vec<String>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List discovered devices
    List,
    /// Connect and configure every endpoint in a config file
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a config file and print it back with defaults filled in
    Check {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn run_endpoint(registry: Arc<DeviceRegistry>, config: EndpointConfig) -> Result<Endpoint> {
    let (endpoint, report) = config
        .connect(registry)
        .with_context(|| format!("Endpoint '{}' failed to connect", config.name))?;
    for conflict in &report.conflicts {
        warn!(endpoint = %config.name, %conflict, "Endpoint shares device with a mismatched peer");
    }
    config
        .apply(&endpoint)
        .with_context(|| format!("Endpoint '{}' failed to configure", config.name))?;
    info!(endpoint = %config.name, device = %endpoint.index(), kind = %endpoint.kind(), "Endpoint ready");
    Ok(endpoint)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Command::Run { config } | Command::Check { config } => Some(
            AppConfig::load_from(config)
                .with_context(|| format!("Failed to load {}", config.display()))?,
        ),
        Command::List => None,
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().map(|c| c.application.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    logging::init(&level, cli.json)?;

    let driver = Arc::new(MockDriver::with_serials(&cli.devices));
    let registry = Arc::new(DeviceRegistry::new(driver));

    match cli.command {
        Command::List => {
            for (i, id) in registry.discover()?.iter().enumerate() {
                println!("{i}: {id}");
            }
        }
        Command::Check { .. } => {
            if let Some(config) = &config {
                print!("{}", config.to_toml()?);
            }
        }
        Command::Run { .. } => {
            let config = config.unwrap_or_default();
            info!(name = %config.application.name, endpoints = config.endpoints.len(), "Starting");

            let handles: Vec<_> = config
                .endpoints
                .into_iter()
                .map(|endpoint| {
                    let registry = registry.clone();
                    tokio::task::spawn_blocking(move || run_endpoint(registry, endpoint))
                })
                .collect();

            let mut endpoints = Vec::new();
            let mut failures = 0;
            for handle in handles {
                match handle.await {
                    Ok(Ok(endpoint)) => endpoints.push(endpoint),
                    Ok(Err(e)) => {
                        error!("{e:#}");
                        failures += 1;
                    }
                    Err(e) => {
                        error!("Endpoint worker panicked: {e}");
                        failures += 1;
                    }
                }
            }
            info!(
                connected = endpoints.len(),
                open_devices = registry.record_count(),
                failures,
                "All endpoints processed"
            );
            drop(endpoints);
        }
    }

    registry.shutdown();
    Ok(())
}
