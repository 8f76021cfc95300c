//! Audio-source adapters backed by a host service.
//!
//! Each of the appliance's audio sources is implemented by an external
//! daemon managed by the init system. [`ServiceBackedPlugin`] captures the
//! shape all of those adapters share: start/stop the unit through a
//! [`ServiceController`], watch peer connectivity with a
//! [`ConnectionMonitor`], and push confirmed transitions to the state
//! machine. Per-source differences are data ([`ServiceBackedConfig`]), not
//! subclasses.
//!
//! Probes here are liveness probes (unit active, TCP connect); adapters do
//! not speak the daemons' own wire protocols.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::{HearthError, HearthResult};
use crate::plugin::monitor::{
    ConnectionMonitor, ConnectionObserver, MonitorConfig, ProbeFn, ProbeOutcome,
};
use crate::plugin::{AudioSourcePlugin, CommandResult, PluginStatus, StateUpdateSink, StopReport};
use crate::services::service_control::ServiceController;
use crate::state::{AudioSource, PluginOperationalState};

/// Per-source configuration of a [`ServiceBackedPlugin`].
#[derive(Debug, Clone)]
pub struct ServiceBackedConfig {
    /// The source this adapter implements.
    pub source: AudioSource,
    /// Human-readable name surfaced in metadata.
    pub display_name: String,
    /// Unit implementing the source's audio engine.
    pub unit: String,
    /// Local endpoint probed for liveness; `None` falls back to probing the
    /// unit's active state.
    pub probe_addr: Option<SocketAddr>,
    /// Health-monitor tuning.
    pub monitor: MonitorConfig,
}

impl ServiceBackedConfig {
    /// Default adapter configuration for a playable source.
    ///
    /// Returns `None` for [`AudioSource::None`], which has no adapter.
    #[must_use]
    pub fn for_source(source: AudioSource) -> Option<Self> {
        let config = match source {
            AudioSource::None => return None,
            AudioSource::StreamingClient => Self {
                source,
                display_name: "Streaming client".into(),
                unit: "librespot.service".into(),
                probe_addr: Some(SocketAddr::from(([127, 0, 0, 1], 24879))),
                monitor: MonitorConfig::default(),
            },
            AudioSource::BluetoothReceiver => Self {
                source,
                display_name: "Bluetooth receiver".into(),
                unit: "bluealsa-aplay.service".into(),
                probe_addr: None,
                monitor: MonitorConfig {
                    // Bluetooth drops are abrupt; two misses is enough.
                    failure_threshold: 2,
                    ..MonitorConfig::default()
                },
            },
            AudioSource::NetworkReceiver => Self {
                source,
                display_name: "Network receiver".into(),
                unit: "squeezelite.service".into(),
                probe_addr: None,
                monitor: MonitorConfig::default(),
            },
            AudioSource::MultiroomClient => Self {
                source,
                display_name: "Multiroom client".into(),
                unit: "snapclient.service".into(),
                probe_addr: Some(SocketAddr::from(([127, 0, 0, 1], 1704))),
                monitor: MonitorConfig::default(),
            },
            AudioSource::InternetRadio => Self {
                source,
                display_name: "Internet radio".into(),
                unit: "mpd.service".into(),
                probe_addr: Some(SocketAddr::from(([127, 0, 0, 1], 6600))),
                monitor: MonitorConfig {
                    // "Playing" flaps during buffering; require two
                    // consecutive positive checks before trusting it.
                    success_threshold: 2,
                    ..MonitorConfig::default()
                },
            },
        };
        Some(config)
    }

    /// Default configurations for every playable source.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        AudioSource::PLAYABLE
            .iter()
            .filter_map(|source| Self::for_source(*source))
            .collect()
    }
}

/// Observer that relays monitor transitions into the state machine.
///
/// Kept as a separate struct so the plugin needs no self-referential Arc.
struct MonitorRelay {
    source: AudioSource,
    display_name: String,
    unit: String,
    controller: Arc<dyn ServiceController>,
    sink: Arc<dyn StateUpdateSink>,
}

#[async_trait]
impl ConnectionObserver for MonitorRelay {
    fn connection_changed(&self, connected: bool) {
        let (state, metadata) = if connected {
            let mut metadata = Map::new();
            metadata.insert("device".into(), Value::from(self.display_name.clone()));
            (PluginOperationalState::Connected, metadata)
        } else {
            (PluginOperationalState::Ready, Map::new())
        };
        self.sink
            .update_plugin_state(self.source, state, metadata, None);
    }

    async fn attempt_reconnect(&self) -> bool {
        log::info!("[{}] Restarting {} to recover peer", self.source, self.unit);
        self.controller.start(&self.unit).await.is_ok()
    }
}

/// Plugin adapter supervising one external audio-engine unit.
pub struct ServiceBackedPlugin {
    config: ServiceBackedConfig,
    controller: Arc<dyn ServiceController>,
    sink: Arc<dyn StateUpdateSink>,
    monitor: ConnectionMonitor,
    initialized: AtomicBool,
}

impl ServiceBackedPlugin {
    /// Creates an adapter from its configuration and collaborators.
    pub fn new(
        config: ServiceBackedConfig,
        controller: Arc<dyn ServiceController>,
        sink: Arc<dyn StateUpdateSink>,
    ) -> Arc<Self> {
        let monitor = ConnectionMonitor::new(config.monitor.clone());
        Arc::new(Self {
            config,
            controller,
            sink,
            monitor,
            initialized: AtomicBool::new(false),
        })
    }

    fn probe(&self) -> ProbeFn {
        let unit = self.config.unit.clone();
        let addr = self.config.probe_addr;
        let controller = Arc::clone(&self.controller);
        Arc::new(move || {
            let unit = unit.clone();
            let controller = Arc::clone(&controller);
            Box::pin(async move {
                if let Some(addr) = addr {
                    // Peer liveness: can we reach the engine's local endpoint.
                    match tokio::time::timeout(
                        Duration::from_secs(2),
                        tokio::net::TcpStream::connect(addr),
                    )
                    .await
                    {
                        Ok(Ok(_)) => Ok(ProbeOutcome::Connected),
                        Ok(Err(_)) | Err(_) => Ok(ProbeOutcome::Disconnected),
                    }
                } else {
                    match controller.is_active(&unit).await {
                        Ok(true) => Ok(ProbeOutcome::Connected),
                        Ok(false) => Ok(ProbeOutcome::Disconnected),
                        Err(e) => Err(e.to_string()),
                    }
                }
            })
        })
    }

    fn relay(&self) -> Arc<MonitorRelay> {
        Arc::new(MonitorRelay {
            source: self.config.source,
            display_name: self.config.display_name.clone(),
            unit: self.config.unit.clone(),
            controller: Arc::clone(&self.controller),
            sink: Arc::clone(&self.sink),
        })
    }
}

#[async_trait]
impl AudioSourcePlugin for ServiceBackedPlugin {
    fn source(&self) -> AudioSource {
        self.config.source
    }

    async fn initialize(&self) -> HearthResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Verify the unit is queryable before we ever try to start it.
        self.controller
            .is_active(&self.config.unit)
            .await
            .map_err(|e| {
                HearthError::PluginInitialization(format!(
                    "{} not controllable: {e}",
                    self.config.unit
                ))
            })?;
        self.initialized.store(true, Ordering::SeqCst);
        log::info!("[{}] Initialized ({})", self.config.source, self.config.unit);
        Ok(())
    }

    async fn start(&self) -> HearthResult<()> {
        if let Err(e) = self.controller.start(&self.config.unit).await {
            // Leave nothing half-started behind.
            if let Err(stop_err) = self.controller.stop(&self.config.unit).await {
                log::warn!(
                    "[{}] Cleanup stop after failed start also failed: {}",
                    self.config.source,
                    stop_err
                );
            }
            return Err(HearthError::PluginStart(e.to_string()));
        }

        self.sink.update_plugin_state(
            self.config.source,
            PluginOperationalState::Ready,
            Map::new(),
            None,
        );
        self.monitor.start(self.probe(), self.relay());
        log::info!("[{}] Started ({})", self.config.source, self.config.unit);
        Ok(())
    }

    async fn stop(&self) -> StopReport {
        let mut report = StopReport::clean();

        // Monitor first, so no callback can fire mid-teardown.
        self.monitor.stop().await;

        if let Err(e) = self.controller.stop(&self.config.unit).await {
            report.record(&self.config.unit, e);
        }
        log::info!("[{}] Stopped", self.config.source);
        report
    }

    async fn get_status(&self) -> PluginStatus {
        match self.controller.is_active(&self.config.unit).await {
            Ok(active) => {
                // The aggregate owns Connected; this snapshot only knows
                // whether the engine process is up.
                let state = if active {
                    PluginOperationalState::Ready
                } else {
                    PluginOperationalState::Inactive
                };
                let mut status = PluginStatus::new(self.config.source, state);
                status
                    .extra
                    .insert("unit".into(), Value::from(self.config.unit.clone()));
                status.extra.insert("service_active".into(), Value::from(active));
                status
            }
            Err(e) => PluginStatus::degraded(self.config.source, e.to_string()),
        }
    }

    async fn handle_command(&self, command: &str, _args: &Value) -> CommandResult {
        match command {
            "restart" => {
                if let Err(e) = self.controller.stop(&self.config.unit).await {
                    log::warn!("[{}] Stop during restart failed: {}", self.config.source, e);
                }
                match self.controller.start(&self.config.unit).await {
                    Ok(()) => CommandResult::ok(),
                    Err(e) => CommandResult::failed(e.to_string()),
                }
            }
            "status" => match self.controller.is_active(&self.config.unit).await {
                Ok(active) => {
                    let mut data = Map::new();
                    data.insert("service_active".into(), json!(active));
                    CommandResult::ok_with(data)
                }
                Err(e) => CommandResult::failed(e.to_string()),
            },
            other => CommandResult::unknown_command(other),
        }
    }
}
