//! Plugin contract for audio-source adapters.
//!
//! Every audio source is driven through the same narrow interface:
//! [`AudioSourcePlugin`]. Adapters compose the reusable
//! [`ConnectionMonitor`](monitor::ConnectionMonitor) for peer-health tracking
//! rather than inheriting shared behavior, and push their own state changes
//! to the state machine through [`StateUpdateSink`]; the machine never polls
//! plugin internals.

pub mod monitor;
pub mod service_backed;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::HearthResult;
use crate::state::{AudioSource, PluginOperationalState};

// ─────────────────────────────────────────────────────────────────────────────
// Status and Command Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// Best-effort synchronous status snapshot of a plugin.
///
/// Common fields are typed; genuinely source-specific details go in `extra`.
/// A status query never fails; errors are reported through `message`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    /// The source this plugin adapts.
    pub source: AudioSource,
    /// Current lifecycle state as the plugin sees it.
    pub state: PluginOperationalState,
    /// Human-readable detail, set when the query hit an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Source-specific fields (device name, station, peer address, ...).
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl PluginStatus {
    /// Creates a status snapshot with no detail fields.
    pub fn new(source: AudioSource, state: PluginOperationalState) -> Self {
        Self {
            source,
            state,
            message: None,
            extra: Map::new(),
        }
    }

    /// Creates an error-carrying status for a failed query.
    pub fn degraded(source: AudioSource, message: impl Into<String>) -> Self {
        Self {
            source,
            state: PluginOperationalState::Error,
            message: Some(message.into()),
            extra: Map::new(),
        }
    }
}

/// Structured result of a plugin command.
///
/// Unknown commands return a failure result, never an error that escapes the
/// contract.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// Whether the command was accepted and executed.
    pub success: bool,
    /// Detail for failures or informational responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Command-specific response payload.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl CommandResult {
    /// A bare success.
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            data: Map::new(),
        }
    }

    /// A success carrying a response payload.
    pub fn ok_with(data: Map<String, Value>) -> Self {
        Self {
            success: true,
            message: None,
            data,
        }
    }

    /// A structured failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: Map::new(),
        }
    }

    /// The structured failure for a command the plugin does not implement.
    pub fn unknown_command(command: &str) -> Self {
        Self::failed(format!("unknown command: {command}"))
    }
}

/// Aggregated, non-fatal cleanup report from a plugin stop.
///
/// Stop never blocks the caller on failure; instead every issue encountered
/// while releasing resources is recorded here for diagnostics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StopReport {
    /// Cleanup problems, in the order they occurred.
    pub issues: Vec<String>,
}

impl StopReport {
    /// A clean stop with no issues.
    pub fn clean() -> Self {
        Self::default()
    }

    /// Records a cleanup problem.
    pub fn record(&mut self, context: &str, detail: impl std::fmt::Display) {
        self.issues.push(format!("{context}: {detail}"));
    }

    /// Whether the stop completed without recorded issues.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Contract
// ─────────────────────────────────────────────────────────────────────────────

/// The uniform lifecycle contract every audio-source adapter satisfies.
///
/// Contract rules:
/// - `initialize` is idempotent and succeeds at most once per process
///   lifetime; later calls are no-ops.
/// - `start` leaves no dangling subprocess or connection behind on failure.
/// - `stop` is always safe to call, cancels and awaits the plugin's monitor
///   before returning, and reports problems instead of failing.
/// - `get_status` never blocks beyond a short bounded timeout.
/// - Plugins notify the state machine of their own state via
///   [`StateUpdateSink`]; the machine never polls.
#[async_trait]
pub trait AudioSourcePlugin: Send + Sync {
    /// The source this plugin adapts.
    fn source(&self) -> AudioSource;

    /// Prepares resources without producing audio.
    async fn initialize(&self) -> HearthResult<()>;

    /// Brings the external process/service to at least Ready and starts the
    /// connection monitor.
    async fn start(&self) -> HearthResult<()>;

    /// Stops the monitor and releases external resources.
    async fn stop(&self) -> StopReport;

    /// Synchronous best-effort status snapshot.
    async fn get_status(&self) -> PluginStatus;

    /// Source-specific remote-control surface.
    async fn handle_command(&self, command: &str, args: &Value) -> CommandResult;
}

/// Push interface plugins use to report state for the source they adapt.
///
/// Implemented by the state machine. Updates for a source that is not
/// currently active are dropped there, preserving the single-writer
/// invariant on the aggregate.
pub trait StateUpdateSink: Send + Sync {
    /// Reports a plugin state change with optional metadata and error detail.
    fn update_plugin_state(
        &self,
        source: AudioSource,
        new_state: PluginOperationalState,
        metadata: Map<String, Value>,
        error: Option<String>,
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Mapping from [`AudioSource`] to its plugin.
///
/// Populated once at startup and read-only thereafter; the state machine
/// never creates or destroys plugin instances, only starts and stops them.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<AudioSource, Arc<dyn AudioSourcePlugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin for its source.
    ///
    /// Returns the previously registered plugin if one existed.
    pub fn insert(
        &mut self,
        plugin: Arc<dyn AudioSourcePlugin>,
    ) -> Option<Arc<dyn AudioSourcePlugin>> {
        self.plugins.insert(plugin.source(), plugin)
    }

    /// Looks up the plugin for a source.
    #[must_use]
    pub fn get(&self, source: AudioSource) -> Option<Arc<dyn AudioSourcePlugin>> {
        self.plugins.get(&source).map(Arc::clone)
    }

    /// Iterates over all registered plugins in source order.
    pub fn iter(&self) -> impl Iterator<Item = (AudioSource, &Arc<dyn AudioSourcePlugin>)> {
        self.plugins.iter().map(|(source, plugin)| (*source, plugin))
    }

    /// The registered sources, in order.
    pub fn sources(&self) -> Vec<AudioSource> {
        self.plugins.keys().copied().collect()
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test Fakes
// ─────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::FakePlugin;
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn registry_lookup_and_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.insert(FakePlugin::new(AudioSource::InternetRadio, calls.clone()));
        registry.insert(FakePlugin::new(AudioSource::StreamingClient, calls));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(AudioSource::StreamingClient).is_some());
        assert!(registry.get(AudioSource::BluetoothReceiver).is_none());
        // BTreeMap keeps enum declaration order
        assert_eq!(
            registry.sources(),
            vec![AudioSource::StreamingClient, AudioSource::InternetRadio]
        );
    }

    #[tokio::test]
    async fn unknown_command_is_a_structured_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plugin = FakePlugin::new(AudioSource::BluetoothReceiver, calls);

        let result = plugin.handle_command("teleport", &json!({})).await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("teleport"));
    }

    #[test]
    fn stop_report_aggregates_issues() {
        let mut report = StopReport::clean();
        assert!(report.is_clean());

        report.record("monitor", "task did not finish");
        report.record("service", "unit stop timed out");

        assert!(!report.is_clean());
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].starts_with("monitor:"));
    }
}
