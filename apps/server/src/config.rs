//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP/WS control surface to.
    /// Override: `HEARTHCAST_BIND_PORT`
    pub bind_port: u16,

    /// Directory for persistent state (routing intent, signal file).
    /// Override: `HEARTHCAST_STATE_DIR`
    pub state_dir: PathBuf,

    /// Unit name of the multiroom bus server.
    pub bus_server_unit: String,

    /// Unit name of the local multiroom bus client.
    pub bus_client_unit: String,

    /// Settle delay between bus server and client start (milliseconds).
    pub bus_settle_delay_ms: u64,

    /// WebSocket heartbeat timeout (seconds).
    pub ws_heartbeat_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = hearthcast_core::Config::default();
        Self {
            bind_port: core.bind_port,
            state_dir: core.state_dir,
            bus_server_unit: core.bus_server_unit,
            bus_client_unit: core.bus_client_unit,
            bus_settle_delay_ms: core.bus_settle_delay_ms,
            ws_heartbeat_timeout_secs: core.ws_heartbeat_timeout_secs,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HEARTHCAST_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        // Note: HEARTHCAST_STATE_DIR is handled by clap via #[arg(env = ...)]
        // in main.rs
    }

    /// Converts to hearthcast-core's Config type.
    pub fn to_core_config(&self) -> hearthcast_core::Config {
        hearthcast_core::Config {
            bind_port: self.bind_port,
            state_dir: self.state_dir.clone(),
            bus_server_unit: self.bus_server_unit.clone(),
            bus_client_unit: self.bus_client_unit.clone(),
            bus_settle_delay_ms: self.bus_settle_delay_ms,
            ws_heartbeat_timeout_secs: self.ws_heartbeat_timeout_secs,
            ..Default::default()
        }
    }
}
