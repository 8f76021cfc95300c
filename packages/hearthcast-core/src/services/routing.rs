//! Direct-vs-multiroom audio routing.
//!
//! The routing service owns the one piece of state that must survive process
//! restarts: whether audio goes straight to local hardware or through the
//! multiroom bus, plus the equalizer toggle. It coordinates start/stop of
//! the external bus services, pushes the downstream environment signals, and
//! persists every successfully applied change atomically.
//!
//! Call direction is one-way: the routing service notifies the state machine
//! through [`RoutingListener`]; it never reads machine internals. The active
//! plugin is restarted through an injected lookup callback for the same
//! reason.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{HearthError, HearthResult};
use crate::plugin::AudioSourcePlugin;
use crate::services::service_control::ServiceController;
use crate::services::signals::SignalSink;
use crate::state::{AudioSource, Config};

/// Name of the persisted routing file under the state directory.
pub const ROUTING_STATE_FILE: &str = "routing.json";

// ─────────────────────────────────────────────────────────────────────────────
// Persisted State
// ─────────────────────────────────────────────────────────────────────────────

/// The last *successfully applied* routing configuration.
///
/// On disk and in memory this may transiently diverge only during an
/// in-flight change; both converge before the call returns (success or
/// rollback), and the file is only ever replaced atomically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    /// Audio fans out to the multiroom bus instead of local hardware.
    #[serde(default)]
    pub multiroom_enabled: bool,
    /// The equalizer stage is in the output path.
    #[serde(default)]
    pub equalizer_enabled: bool,
}

impl RoutingState {
    /// Loads the persisted state, falling back to defaults on first run or
    /// parse failure.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(ROUTING_STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!(
                    "[Routing] Corrupt state file {}, using defaults: {}",
                    path.display(),
                    e
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persists the state using atomic replace (temp file + rename).
    pub fn save(&self, state_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(ROUTING_STATE_FILE);
        let temp_path = state_dir.join("routing.json.tmp");
        let contents = serde_json::to_string_pretty(self)?;

        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, &path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator Seams
// ─────────────────────────────────────────────────────────────────────────────

/// Receives confirmations of applied routing changes.
///
/// Implemented by the state machine, which mirrors the values into the
/// serialized aggregate and emits the corresponding events.
pub trait RoutingListener: Send + Sync {
    /// A multiroom mode change was applied.
    fn multiroom_changed(&self, enabled: bool);

    /// An equalizer change was applied.
    fn equalizer_changed(&self, enabled: bool);
}

/// Resolves a source to its plugin without exposing machine internals.
pub type PluginLookup = Arc<dyn Fn(AudioSource) -> Option<Arc<dyn AudioSourcePlugin>> + Send + Sync>;

/// Configures the bus group topology once the bus is reachable.
///
/// The concrete implementation speaks the bus server's own protocol and
/// lives outside the core; the default does nothing.
#[async_trait]
pub trait TopologyConfigurator: Send + Sync {
    /// One best-effort configuration pass.
    async fn configure(&self) -> HearthResult<()>;
}

/// Default configurator for deployments without topology management.
pub struct NoopTopologyConfigurator;

#[async_trait]
impl TopologyConfigurator for NoopTopologyConfigurator {
    async fn configure(&self) -> HearthResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a routing apply operation.
///
/// `warnings` carries non-fatal problems (plugin restart, persistence) that
/// did not roll the change back.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// Whether anything actually changed (false for a no-op request).
    pub changed: bool,
    /// Non-fatal problems encountered after the point of no return.
    pub warnings: Vec<String>,
}

impl ApplyOutcome {
    fn unchanged() -> Self {
        Self {
            changed: false,
            warnings: Vec::new(),
        }
    }
}

/// Observed (not intended) state of the multiroom bus services.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStatus {
    /// The bus server unit is active.
    pub server_active: bool,
    /// The local bus client unit is active.
    pub client_active: bool,
}

/// Probe result for one supervised unit.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceAvailability {
    /// Unit name.
    pub unit: String,
    /// Whether the unit is currently active.
    pub active: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Service
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning and unit names for the routing service.
#[derive(Debug, Clone)]
pub struct RoutingServiceConfig {
    /// Service-owned state directory.
    pub state_dir: std::path::PathBuf,
    /// Multiroom bus server unit.
    pub server_unit: String,
    /// Local multiroom bus client unit.
    pub client_unit: String,
    /// Delay between server and client start.
    pub settle_delay: Duration,
    /// Poll attempts while waiting for the bus before topology configuration.
    pub configure_poll_attempts: u32,
    /// Interval between those polls.
    pub configure_poll_interval: Duration,
}

impl RoutingServiceConfig {
    /// Extracts the routing-relevant parts of the application config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            state_dir: config.state_dir.clone(),
            server_unit: config.bus_server_unit.clone(),
            client_unit: config.bus_client_unit.clone(),
            settle_delay: Duration::from_millis(config.bus_settle_delay_ms),
            configure_poll_attempts: config.bus_configure_poll_attempts,
            configure_poll_interval: Duration::from_millis(config.bus_configure_poll_interval_ms),
        }
    }
}

/// Owns the direct-vs-multiroom decision and the equalizer toggle.
pub struct AudioRoutingService {
    config: RoutingServiceConfig,
    controller: Arc<dyn ServiceController>,
    signals: Arc<dyn SignalSink>,
    topology: Arc<dyn TopologyConfigurator>,
    state: RwLock<RoutingState>,
    listener: RwLock<Option<Weak<dyn RoutingListener>>>,
    plugin_lookup: RwLock<Option<PluginLookup>>,
    /// Serializes apply operations; held across service start/stop awaits.
    apply_lock: tokio::sync::Mutex<()>,
    configure_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl AudioRoutingService {
    /// Creates the service. Call [`initialize`](Self::initialize) before use.
    pub fn new(
        config: RoutingServiceConfig,
        controller: Arc<dyn ServiceController>,
        signals: Arc<dyn SignalSink>,
        topology: Arc<dyn TopologyConfigurator>,
    ) -> Self {
        Self {
            config,
            controller,
            signals,
            topology,
            state: RwLock::new(RoutingState::default()),
            listener: RwLock::new(None),
            plugin_lookup: RwLock::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
            configure_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers the state-machine listener. Held weakly to keep the call
    /// graph one-way.
    pub fn set_state_listener(&self, listener: Weak<dyn RoutingListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Registers the plugin lookup callback used for restarts.
    pub fn set_plugin_lookup(&self, lookup: PluginLookup) {
        *self.plugin_lookup.write() = Some(lookup);
    }

    /// Returns the current in-memory routing state.
    #[must_use]
    pub fn state(&self) -> RoutingState {
        *self.state.read()
    }

    /// Loads persisted intent, applies signals, and reconciles with the
    /// observed bus state.
    ///
    /// A crash between "persist" and "apply" self-heals here: if the file
    /// says multiroom but the bus is down the services are started, and vice
    /// versa. Reconciliation only issues service calls when the probed state
    /// disagrees with the persisted intent.
    pub async fn initialize(&self) {
        let loaded = RoutingState::load(&self.config.state_dir);
        *self.state.write() = loaded;
        log::info!(
            "[Routing] Initialized: multiroom={}, equalizer={}",
            loaded.multiroom_enabled,
            loaded.equalizer_enabled
        );

        if let Err(e) = self.signals.set_routing(loaded.multiroom_enabled) {
            log::warn!("[Routing] Failed to push routing signal: {}", e);
        }
        if let Err(e) = self.signals.set_equalizer(loaded.equalizer_enabled) {
            log::warn!("[Routing] Failed to push equalizer signal: {}", e);
        }

        let server_active = self
            .controller
            .is_active(&self.config.server_unit)
            .await
            .unwrap_or(false);
        if loaded.multiroom_enabled && !server_active {
            log::info!("[Routing] Persisted multiroom but bus is down, starting it");
            if let Err(e) = self.start_bus().await {
                log::warn!("[Routing] Bus reconciliation failed: {}", e);
            }
        } else if !loaded.multiroom_enabled && server_active {
            log::info!("[Routing] Persisted direct but bus is up, stopping it");
            self.stop_bus().await;
        }
    }

    /// Switches between direct and multiroom routing.
    ///
    /// No-op success if already in the requested mode. On bus start failure
    /// the previous mode is fully restored (in-memory state and signal) and
    /// nothing is persisted. On success the active plugin is restarted so it
    /// re-attaches to the new topology, the state is persisted, the listener
    /// is notified, and bus topology auto-configuration is kicked off in the
    /// background.
    pub async fn set_multiroom_enabled(
        &self,
        enabled: bool,
        active_source: AudioSource,
    ) -> HearthResult<ApplyOutcome> {
        let _guard = self.apply_lock.lock().await;

        if self.state.read().multiroom_enabled == enabled {
            log::debug!("[Routing] Multiroom already {}", enabled);
            return Ok(ApplyOutcome::unchanged());
        }
        let previous = *self.state.read();

        self.state.write().multiroom_enabled = enabled;
        if let Err(e) = self.signals.set_routing(enabled) {
            *self.state.write() = previous;
            return Err(HearthError::RoutingApply(format!(
                "routing signal push failed: {e}"
            )));
        }

        if enabled {
            if let Err(e) = self.start_bus().await {
                *self.state.write() = previous;
                if let Err(se) = self.signals.set_routing(previous.multiroom_enabled) {
                    log::warn!("[Routing] Failed to restore routing signal: {}", se);
                }
                return Err(HearthError::RoutingApply(e.to_string()));
            }
        } else {
            self.stop_bus().await;
        }

        let mut warnings = Vec::new();
        self.restart_active_plugin(active_source, &mut warnings).await;
        self.persist(&mut warnings);
        self.notify_multiroom(enabled);
        if enabled {
            self.spawn_auto_configure();
        }

        log::info!("[Routing] Multiroom {}", if enabled { "enabled" } else { "disabled" });
        Ok(ApplyOutcome {
            changed: true,
            warnings,
        })
    }

    /// Toggles the equalizer stage.
    ///
    /// Same no-op/rollback discipline as the multiroom switch, but with no
    /// bus services involved: only the signal push and a conditional restart
    /// of the active plugin.
    pub async fn set_equalizer_enabled(
        &self,
        enabled: bool,
        active_source: AudioSource,
    ) -> HearthResult<ApplyOutcome> {
        let _guard = self.apply_lock.lock().await;

        if self.state.read().equalizer_enabled == enabled {
            log::debug!("[Routing] Equalizer already {}", enabled);
            return Ok(ApplyOutcome::unchanged());
        }
        let previous = *self.state.read();

        self.state.write().equalizer_enabled = enabled;
        if let Err(e) = self.signals.set_equalizer(enabled) {
            *self.state.write() = previous;
            return Err(HearthError::RoutingApply(format!(
                "equalizer signal push failed: {e}"
            )));
        }

        let mut warnings = Vec::new();
        self.restart_active_plugin(active_source, &mut warnings).await;
        self.persist(&mut warnings);
        self.notify_equalizer(enabled);

        log::info!("[Routing] Equalizer {}", if enabled { "enabled" } else { "disabled" });
        Ok(ApplyOutcome {
            changed: true,
            warnings,
        })
    }

    /// Observed state of the multiroom bus services.
    ///
    /// Reports what is actually running, independent of the persisted
    /// intent; callers use this to decide whether a mode is operative.
    pub async fn snapcast_status(&self) -> BusStatus {
        BusStatus {
            server_active: self
                .controller
                .is_active(&self.config.server_unit)
                .await
                .unwrap_or(false),
            client_active: self
                .controller
                .is_active(&self.config.client_unit)
                .await
                .unwrap_or(false),
        }
    }

    /// Probes every unit the routing service supervises.
    pub async fn available_services(&self) -> Vec<ServiceAvailability> {
        let mut services = Vec::new();
        for unit in [&self.config.server_unit, &self.config.client_unit] {
            let active = self.controller.is_active(unit).await.unwrap_or(false);
            services.push(ServiceAvailability {
                unit: unit.clone(),
                active,
            });
        }
        services
    }

    /// Cancels the background topology task and awaits it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.configure_task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }

    // ── internals ────────────────────────────────────────────────────────────

    async fn start_bus(&self) -> HearthResult<()> {
        self.controller.start(&self.config.server_unit).await?;
        // Give the server a moment to open its socket before the client
        // tries to attach.
        tokio::time::sleep(self.config.settle_delay).await;
        if let Err(e) = self.controller.start(&self.config.client_unit).await {
            if let Err(se) = self.controller.stop(&self.config.server_unit).await {
                log::warn!("[Routing] Cleanup stop of bus server failed: {}", se);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stops the bus services. Stop failures are logged, not fatal; a
    /// stopped-but-unconfirmed service must not block the mode switch.
    async fn stop_bus(&self) {
        for unit in [&self.config.client_unit, &self.config.server_unit] {
            if let Err(e) = self.controller.stop(unit).await {
                log::warn!("[Routing] Failed to stop {}: {}", unit, e);
            }
        }
    }

    async fn restart_active_plugin(&self, active: AudioSource, warnings: &mut Vec<String>) {
        if active.is_none() {
            return;
        }
        let lookup = self.plugin_lookup.read().clone();
        let Some(lookup) = lookup else {
            return;
        };
        let Some(plugin) = lookup(active) else {
            return;
        };

        log::info!("[Routing] Restarting {} for new topology", active);
        let report = plugin.stop().await;
        for issue in &report.issues {
            log::warn!("[Routing] Restart stop issue: {}", issue);
        }
        if let Err(e) = plugin.start().await {
            // Routing stays committed: the bus change itself succeeded and
            // the plugin fault is surfaced through its own state push.
            log::warn!("[Routing] Active plugin restart failed: {}", e);
            warnings.push(format!("active plugin restart failed: {e}"));
        }
    }

    fn persist(&self, warnings: &mut Vec<String>) {
        let state = *self.state.read();
        if let Err(e) = state.save(&self.config.state_dir) {
            // Keep the in-memory change; it just won't survive a restart.
            log::warn!("[Routing] Failed to persist routing state: {}", e);
            warnings.push(format!("persistence failed: {e}"));
        }
    }

    fn notify_multiroom(&self, enabled: bool) {
        if let Some(listener) = self.listener.read().as_ref().and_then(Weak::upgrade) {
            listener.multiroom_changed(enabled);
        }
    }

    fn notify_equalizer(&self, enabled: bool) {
        if let Some(listener) = self.listener.read().as_ref().and_then(Weak::upgrade) {
            listener.equalizer_changed(enabled);
        }
    }

    /// Polls for bus availability, then configures group topology once.
    ///
    /// Bounded and best-effort: failure never rolls back the mode switch.
    fn spawn_auto_configure(&self) {
        let controller = Arc::clone(&self.controller);
        let topology = Arc::clone(&self.topology);
        let server_unit = self.config.server_unit.clone();
        let attempts = self.config.configure_poll_attempts;
        let interval = self.config.configure_poll_interval;
        let cancel = self.cancel.child_token();

        let mut slot = self.configure_task.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            for _ in 0..attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Ok(true) = controller.is_active(&server_unit).await {
                    match topology.configure().await {
                        Ok(()) => log::info!("[Routing] Bus topology configured"),
                        Err(e) => log::warn!("[Routing] Topology configuration failed: {}", e),
                    }
                    return;
                }
            }
            log::warn!("[Routing] Bus never became available, skipping topology configuration");
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::FakePlugin;
    use crate::services::service_control::testing::FakeServiceController;
    use crate::services::signals::testing::RecordingSignalSink;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingListener {
        changes: Mutex<Vec<String>>,
    }

    impl RoutingListener for RecordingListener {
        fn multiroom_changed(&self, enabled: bool) {
            self.changes.lock().push(format!("multiroom={enabled}"));
        }

        fn equalizer_changed(&self, enabled: bool) {
            self.changes.lock().push(format!("equalizer={enabled}"));
        }
    }

    struct Fixture {
        service: AudioRoutingService,
        controller: Arc<FakeServiceController>,
        signals: Arc<RecordingSignalSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fixture_in(dir)
    }

    fn fixture_in(dir: tempfile::TempDir) -> Fixture {
        let controller = Arc::new(FakeServiceController::new());
        let signals = Arc::new(RecordingSignalSink::default());
        let config = RoutingServiceConfig {
            state_dir: dir.path().to_path_buf(),
            server_unit: "snapserver.service".into(),
            client_unit: "snapclient.service".into(),
            settle_delay: Duration::from_millis(10),
            configure_poll_attempts: 3,
            configure_poll_interval: Duration::from_millis(10),
        };
        let service = AudioRoutingService::new(
            config,
            controller.clone(),
            signals.clone(),
            Arc::new(NoopTopologyConfigurator),
        );
        Fixture {
            service,
            controller,
            signals,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enable_starts_server_then_client_and_persists() {
        let f = fixture();

        let outcome = f
            .service
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap();

        assert!(outcome.changed);
        assert!(outcome.warnings.is_empty());
        assert_eq!(
            f.controller.start_stop_calls(),
            vec!["start:snapserver.service", "start:snapclient.service"]
        );
        assert!(f.service.state().multiroom_enabled);
        let persisted = RoutingState::load(f._dir.path());
        assert!(persisted.multiroom_enabled);
        assert_eq!(f.signals.pushed.lock().as_slice(), &["routing=multiroom"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_client_start_rolls_back_everything() {
        let f = fixture();
        f.controller.fail_start_of("snapclient.service");

        let err = f
            .service
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "routing_apply_failed");
        // In-memory and persisted state both equal the pre-call value.
        assert!(!f.service.state().multiroom_enabled);
        assert!(!RoutingState::load(f._dir.path()).multiroom_enabled);
        // Signal was pushed, then restored.
        assert_eq!(
            f.signals.pushed.lock().as_slice(),
            &["routing=multiroom", "routing=direct"]
        );
        // The half-started server was cleaned up.
        assert!(f
            .controller
            .start_stop_calls()
            .contains(&"stop:snapserver.service".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_request_is_a_no_op() {
        let f = fixture();
        f.service
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap();
        let calls_before = f.controller.start_stop_calls().len();

        let outcome = f
            .service
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap();

        assert!(!outcome.changed);
        assert_eq!(f.controller.start_stop_calls().len(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_survives_stop_failures() {
        let f = fixture();
        f.service
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap();
        f.controller.fail_stop.lock().insert("snapserver.service".into());

        let outcome = f
            .service
            .set_multiroom_enabled(false, AudioSource::None)
            .await
            .unwrap();

        assert!(outcome.changed);
        assert!(!f.service.state().multiroom_enabled);
        assert!(!RoutingState::load(f._dir.path()).multiroom_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_state_survives_restart_without_service_calls() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().to_path_buf();
        {
            let f = fixture_in(dir);
            f.service
                .set_multiroom_enabled(true, AudioSource::None)
                .await
                .unwrap();
            f.service.shutdown().await;
        }

        // Fresh instance, bus already running as persisted intent says.
        let controller = Arc::new(FakeServiceController::new());
        controller.set_active("snapserver.service", true);
        controller.set_active("snapclient.service", true);
        let service = AudioRoutingService::new(
            RoutingServiceConfig {
                state_dir,
                server_unit: "snapserver.service".into(),
                client_unit: "snapclient.service".into(),
                settle_delay: Duration::from_millis(10),
                configure_poll_attempts: 3,
                configure_poll_interval: Duration::from_millis(10),
            },
            controller.clone(),
            Arc::new(RecordingSignalSink::default()),
            Arc::new(NoopTopologyConfigurator),
        );

        service.initialize().await;

        assert!(service.state().multiroom_enabled);
        // Probed state agrees with intent: no start/stop issued.
        assert!(controller.start_stop_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_starts_bus_when_intent_says_multiroom() {
        let dir = tempfile::tempdir().unwrap();
        RoutingState {
            multiroom_enabled: true,
            equalizer_enabled: false,
        }
        .save(dir.path())
        .unwrap();
        let f = fixture_in(dir);

        f.service.initialize().await;

        assert_eq!(
            f.controller.start_stop_calls(),
            vec!["start:snapserver.service", "start:snapclient.service"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_stops_stray_bus_in_direct_mode() {
        let f = fixture();
        f.controller.set_active("snapserver.service", true);

        f.service.initialize().await;

        assert_eq!(
            f.controller.start_stop_calls(),
            vec!["stop:snapclient.service", "stop:snapserver.service"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_restarts_active_plugin() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plugin = FakePlugin::new(AudioSource::StreamingClient, calls.clone());
        let lookup_plugin = plugin.clone();
        f.service.set_plugin_lookup(Arc::new(move |source| {
            (source == AudioSource::StreamingClient)
                .then(|| lookup_plugin.clone() as Arc<dyn AudioSourcePlugin>)
        }));

        f.service
            .set_multiroom_enabled(true, AudioSource::StreamingClient)
            .await
            .unwrap();

        assert_eq!(
            calls.lock().as_slice(),
            &["streaming_client:stop", "streaming_client:start"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_restart_failure_leaves_routing_committed() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plugin = FakePlugin::new(AudioSource::InternetRadio, calls);
        plugin.fail_start.store(true, Ordering::SeqCst);
        let lookup_plugin = plugin.clone();
        f.service.set_plugin_lookup(Arc::new(move |_| {
            Some(lookup_plugin.clone() as Arc<dyn AudioSourcePlugin>)
        }));

        let outcome = f
            .service
            .set_multiroom_enabled(true, AudioSource::InternetRadio)
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.warnings.len(), 1);
        // Committed in memory and on disk despite the plugin fault.
        assert!(f.service.state().multiroom_enabled);
        assert!(RoutingState::load(f._dir.path()).multiroom_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn equalizer_change_notifies_listener_and_persists() {
        let f = fixture();
        let listener = Arc::new(RecordingListener {
            changes: Mutex::new(Vec::new()),
        });
        let listener_dyn: Arc<dyn RoutingListener> = listener.clone();
        f.service.set_state_listener(Arc::downgrade(&listener_dyn));

        f.service
            .set_equalizer_enabled(true, AudioSource::None)
            .await
            .unwrap();

        assert_eq!(listener.changes.lock().as_slice(), &["equalizer=true"]);
        assert!(RoutingState::load(f._dir.path()).equalizer_enabled);
        assert_eq!(f.signals.pushed.lock().as_slice(), &["equalizer=on"]);
    }

    #[tokio::test(start_paused = true)]
    async fn equalizer_signal_failure_rolls_back() {
        let f = fixture();
        f.signals.fail_next.store(true, Ordering::SeqCst);

        let err = f
            .service
            .set_equalizer_enabled(true, AudioSource::None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "routing_apply_failed");
        assert!(!f.service.state().equalizer_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn topology_is_configured_once_bus_is_available() {
        struct SignallingTopology {
            configured: AtomicBool,
            tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        }

        #[async_trait]
        impl TopologyConfigurator for SignallingTopology {
            async fn configure(&self) -> HearthResult<()> {
                self.configured.store(true, Ordering::SeqCst);
                if let Some(tx) = self.tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeServiceController::new());
        let signals = Arc::new(RecordingSignalSink::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let topology = Arc::new(SignallingTopology {
            configured: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });
        let service = AudioRoutingService::new(
            RoutingServiceConfig {
                state_dir: dir.path().to_path_buf(),
                server_unit: "snapserver.service".into(),
                client_unit: "snapclient.service".into(),
                settle_delay: Duration::from_millis(10),
                configure_poll_attempts: 10,
                configure_poll_interval: Duration::from_millis(10),
            },
            controller,
            signals,
            topology.clone(),
        );

        service
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap();

        rx.await.unwrap();
        assert!(topology.configured.load(Ordering::SeqCst));
        service.shutdown().await;
    }

    #[test]
    fn corrupt_state_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ROUTING_STATE_FILE), "{not json").unwrap();

        let state = RoutingState::load(dir.path());
        assert_eq!(state, RoutingState::default());
    }
}
