//! Hearthcast Server - headless control-plane daemon.
//!
//! Supervises the appliance's audio sources and routing topology and exposes
//! the HTTP/WebSocket control surface. Designed to run unattended under the
//! init system on an embedded Linux device.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hearthcast_core::{bootstrap_services, start_server};
use tokio::signal;

use crate::config::ServerConfig;

/// Hearthcast Server - audio appliance control plane.
#[derive(Parser, Debug)]
#[command(name = "hearthcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "HEARTHCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "HEARTHCAST_BIND_PORT")]
    port: Option<u16>,

    /// State directory for persistent data (routing intent, signal file).
    #[arg(short = 'd', long, env = "HEARTHCAST_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Hearthcast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    log::info!(
        "Configuration: bind_port={}, state_dir={}",
        config.bind_port,
        config.state_dir.display()
    );

    // Bootstrap services: wires the event bus, routing service, state
    // machine, and the default source adapters, then reconciles persisted
    // routing intent with the observed bus state.
    let services = bootstrap_services(config.to_core_config())
        .await
        .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    // Spawn the HTTP/WS server on the main runtime.
    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("Control surface started on port {}", config.bind_port);

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: deactivate the source, close observers, cancel
    // background tasks.
    services.shutdown().await;

    // Abort the server task (nothing useful left to serve)
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
