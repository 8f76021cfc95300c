//! Core state types and application configuration.
//!
//! This module defines the single [`SystemAudioState`] aggregate that answers
//! "what is currently producing sound", the closed enumerations it is built
//! from, and the [`Config`] struct shared by the library and the server
//! binary.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Audio Sources
// ─────────────────────────────────────────────────────────────────────────────

/// The interchangeable audio sources the appliance can play from.
///
/// Identifies which plugin, if any, currently owns audio output. At most one
/// source is active at any time; `None` means the appliance is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    /// No source is active.
    None,
    /// Streaming client (e.g. a connect-style session from a phone app).
    StreamingClient,
    /// Bluetooth A2DP receiver.
    BluetoothReceiver,
    /// Network audio receiver (LMS/AirPlay style peer).
    NetworkReceiver,
    /// Client endpoint of the multiroom audio bus.
    MultiroomClient,
    /// Internet radio player.
    InternetRadio,
}

impl AudioSource {
    /// All sources that can own audio output (excludes `None`).
    pub const PLAYABLE: [AudioSource; 5] = [
        AudioSource::StreamingClient,
        AudioSource::BluetoothReceiver,
        AudioSource::NetworkReceiver,
        AudioSource::MultiroomClient,
        AudioSource::InternetRadio,
    ];

    /// Returns the wire name of this source.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::StreamingClient => "streaming_client",
            Self::BluetoothReceiver => "bluetooth_receiver",
            Self::NetworkReceiver => "network_receiver",
            Self::MultiroomClient => "multiroom_client",
            Self::InternetRadio => "internet_radio",
        }
    }

    /// Whether this is the empty source.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AudioSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "streaming_client" => Ok(Self::StreamingClient),
            "bluetooth_receiver" => Ok(Self::BluetoothReceiver),
            "network_receiver" => Ok(Self::NetworkReceiver),
            "multiroom_client" => Ok(Self::MultiroomClient),
            "internet_radio" => Ok(Self::InternetRadio),
            other => Err(format!("unknown audio source: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Operational State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the plugin that owns the active source.
///
/// `Inactive → Ready → Connected`, with `Error` reachable from any state.
/// `Error` is recoverable only via a fresh stop+start cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginOperationalState {
    /// Stopped; not producing audio.
    #[default]
    Inactive,
    /// External process/service is running, awaiting a peer connection.
    Ready,
    /// Actively producing or consuming audio.
    Connected,
    /// Terminal-for-this-attempt failure; detail lives in the aggregate.
    Error,
}

impl fmt::Display for PluginOperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Ready => "ready",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// System Audio State
// ─────────────────────────────────────────────────────────────────────────────

/// The single root aggregate for "what is currently producing sound".
///
/// Created once at process start with defaults, mutated throughout the
/// process lifetime, never persisted (routing intent is persisted separately
/// by the routing service).
///
/// # Invariants
///
/// - `active_source == None` implies `plugin_state == Inactive` and empty
///   `metadata`.
/// - Only the state machine, under its transition lock, mutates
///   `active_source`; plugin-owned fields (`plugin_state`, `metadata`,
///   `error`) are updated only for the source that currently owns the slot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemAudioState {
    /// Which source currently owns audio output.
    pub active_source: AudioSource,
    /// Lifecycle state of the active source's plugin.
    pub plugin_state: PluginOperationalState,
    /// Whether a transition is currently in flight.
    pub transitioning: bool,
    /// Source-specific details (device name, track info, ...).
    pub metadata: Map<String, Value>,
    /// Failure detail when `plugin_state == Error`.
    pub error: Option<String>,
    /// Cached mirror of the routing service's multiroom flag.
    ///
    /// Routing state is owned by the routing service; this copy exists for
    /// serialization convenience and is re-synchronized on every snapshot.
    pub multiroom_enabled: bool,
    /// Cached mirror of the routing service's equalizer flag.
    pub equalizer_enabled: bool,
}

impl Default for SystemAudioState {
    fn default() -> Self {
        Self {
            active_source: AudioSource::None,
            plugin_state: PluginOperationalState::Inactive,
            transitioning: false,
            metadata: Map::new(),
            error: None,
            multiroom_enabled: false,
            equalizer_enabled: false,
        }
    }
}

impl SystemAudioState {
    /// Resets every field the active source owns to the empty defaults.
    ///
    /// Routing mirrors are left untouched; they track the routing service,
    /// not the active source.
    pub fn reset_source(&mut self) {
        self.active_source = AudioSource::None;
        self.plugin_state = PluginOperationalState::Inactive;
        self.transitioning = false;
        self.metadata.clear();
        self.error = None;
    }

    /// Checks the `None ⇒ Inactive + empty metadata` invariant.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        if self.active_source.is_none() {
            self.plugin_state == PluginOperationalState::Inactive && self.metadata.is_empty()
        } else {
            true
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the Hearthcast control plane.
///
/// All fields have sensible defaults for an embedded appliance deployment.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    // Server
    /// Port for the HTTP/WS control surface.
    pub bind_port: u16,

    // Persistence
    /// Service-owned state directory (routing intent, environment signals).
    pub state_dir: PathBuf,

    // Multiroom bus
    /// Unit name of the multiroom bus server.
    pub bus_server_unit: String,

    /// Unit name of the local multiroom bus client.
    pub bus_client_unit: String,

    /// Settle delay between bus server and client start (milliseconds).
    pub bus_settle_delay_ms: u64,

    /// Attempts when polling for bus availability before auto-configuring
    /// group topology.
    pub bus_configure_poll_attempts: u32,

    /// Interval between bus availability polls (milliseconds).
    pub bus_configure_poll_interval_ms: u64,

    // WebSocket
    /// WebSocket heartbeat timeout (seconds).
    pub ws_heartbeat_timeout_secs: u64,

    /// Interval between WebSocket heartbeat checks (seconds).
    pub ws_heartbeat_check_interval_secs: u64,

    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_port: 8077,
            state_dir: PathBuf::from("/var/lib/hearthcast"),
            bus_server_unit: "snapserver.service".to_string(),
            bus_client_unit: "snapclient.service".to_string(),
            bus_settle_delay_ms: 500,
            bus_configure_poll_attempts: 10,
            bus_configure_poll_interval_ms: 1000,
            ws_heartbeat_timeout_secs: 30,
            ws_heartbeat_check_interval_secs: 1,
            event_channel_capacity: 100,
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be >= 1".to_string());
        }
        if self.bus_server_unit.is_empty() || self.bus_client_unit.is_empty() {
            return Err("multiroom bus unit names must not be empty".to_string());
        }
        Ok(())
    }
}
