//! `labctl` command-line front end.
//!
//! Loads the lab configuration, registers its devices, and runs one of:
//!
//! - `status`: connect every device and print the status map as JSON
//! - `exec <device> <command-json>`: connect one device, run one command,
//!   print the reply as JSON
//! - `run`: connect everything and keep the sessions alive until Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labctl::config::{ApplicationConfig, LabConfig};
use labctl::protocol::Command as DeviceCommand;
use labctl::registry::DeviceRegistry;
use labctl::transport::SerialTransportFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "labctl", version, about = "Control serial laboratory instruments")]
struct Cli {
    /// Path to the lab configuration file
    #[arg(short, long, default_value = "config/labctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Connect every configured device and print which ones came up
    Status,
    /// Run one command on one device
    Exec {
        /// Device name from the configuration
        device: String,
        /// Command as JSON, e.g. '{"op": "set_laser_power", "milliwatts": 50}'
        command: String,
    },
    /// Connect every device and supervise until Ctrl-C
    Run,
}

fn init_logging(app: &ApplicationConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("labctl={}", app.log_level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if app.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_all(registry: &DeviceRegistry) {
    for name in registry.names() {
        match registry.connect(&name).await {
            Ok(true) => info!(device = %name, "Device online"),
            Ok(false) => warn!(device = %name, "Device unavailable"),
            Err(e) => warn!(device = %name, error = %e, "Connect failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_logging(&config.application);
    info!(app = %config.application.name, devices = config.devices.len(), "Starting");

    let registry = DeviceRegistry::from_config(&config, Arc::new(SerialTransportFactory))
        .context("Failed to register configured devices")?;

    match cli.command {
        Action::Status => {
            connect_all(&registry).await;
            let status = registry.status_all();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Action::Exec { device, command } => {
            let command: DeviceCommand = serde_json::from_str(&command)
                .with_context(|| format!("Invalid command JSON: {command}"))?;
            registry
                .try_connect(&device)
                .await
                .with_context(|| format!("Failed to connect '{device}'"))?;

            let outcome = registry.execute(&device, &command).await;
            registry.disconnect_all().await;
            let reply =
                outcome.with_context(|| format!("'{}' failed on '{device}'", command.name()))?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Action::Run => {
            connect_all(&registry).await;
            for name in registry.names() {
                let session = registry.session(&name)?;
                let mut events = session.subscribe();
                tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(state) => info!(device = %name, %state, "Connection state changed"),
                            Err(RecvError::Lagged(missed)) => {
                                warn!(device = %name, missed, "Dropped state events")
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            registry.disconnect_all().await;
        }
    }

    Ok(())
}
