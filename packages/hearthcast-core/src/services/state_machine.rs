//! The unified audio state machine.
//!
//! Owns the single `active source` slot and drives plugin lifecycles safely
//! under concurrent requests. All transitions are serialized by one
//! process-wide lock held across the plugin stop/start awaits: a slow plugin
//! delays other transition requests by design (correctness over latency), so
//! plugin operations enforce their own internal timeouts.
//!
//! Plugins push their state in through [`StateUpdateSink`]; the routing
//! service pushes confirmed routing changes in through [`RoutingListener`].
//! Both arrive here so that every mutation of the aggregate goes through one
//! writer.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};

use crate::error::{HearthError, HearthResult};
use crate::events::{EventBus, EventCategory, EventType, StandardEvent};
use crate::plugin::{AudioSourcePlugin, CommandResult, PluginRegistry, StateUpdateSink};
use crate::services::routing::{AudioRoutingService, RoutingListener};
use crate::state::{AudioSource, PluginOperationalState, SystemAudioState};

/// Guarantees "at most one active audio source" and drives its lifecycle.
pub struct AudioStateMachine {
    state: RwLock<SystemAudioState>,
    /// Serializes transitions; a second concurrent call blocks until the
    /// first completes. Callers apply their own timeouts.
    transition_lock: tokio::sync::Mutex<()>,
    plugins: RwLock<PluginRegistry>,
    /// Sources whose plugin has completed its one-time initialization.
    initialized: Mutex<HashSet<AudioSource>>,
    bus: Arc<EventBus>,
    routing: Arc<AudioRoutingService>,
}

impl AudioStateMachine {
    /// Creates the machine with an empty registry and default state.
    pub fn new(bus: Arc<EventBus>, routing: Arc<AudioRoutingService>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(SystemAudioState::default()),
            transition_lock: tokio::sync::Mutex::new(()),
            plugins: RwLock::new(PluginRegistry::new()),
            initialized: Mutex::new(HashSet::new()),
            bus,
            routing,
        })
    }

    /// Registers a plugin for its source.
    ///
    /// One-time setup: must complete before the machine is exposed to
    /// external triggers; not safe against concurrent transitions.
    pub fn register_plugin(&self, plugin: Arc<dyn AudioSourcePlugin>) -> HearthResult<()> {
        let source = plugin.source();
        if source.is_none() {
            return Err(HearthError::InvalidRequest(
                "cannot register a plugin for the empty source".into(),
            ));
        }
        let mut plugins = self.plugins.write();
        if plugins.get(source).is_some() {
            return Err(HearthError::InvalidRequest(format!(
                "plugin already registered for {source}"
            )));
        }
        plugins.insert(plugin);
        log::info!("[StateMachine] Registered plugin for {}", source);
        Ok(())
    }

    /// Looks up a registered plugin.
    #[must_use]
    pub fn plugin(&self, source: AudioSource) -> Option<Arc<dyn AudioSourcePlugin>> {
        self.plugins.read().get(source)
    }

    /// The registered sources, in declaration order.
    pub fn registered_sources(&self) -> Vec<AudioSource> {
        self.plugins.read().sources()
    }

    /// Returns a snapshot of the aggregate.
    ///
    /// Routing fields are re-synchronized from the routing service first;
    /// routing state is the source of truth and the aggregate only caches a
    /// copy for serialization convenience.
    pub fn current_state(&self) -> SystemAudioState {
        let routing = self.routing.state();
        let mut state = self.state.write();
        state.multiroom_enabled = routing.multiroom_enabled;
        state.equalizer_enabled = routing.equalizer_enabled;
        state.clone()
    }

    /// Switches the active source to `target`.
    ///
    /// No-op success if `target` is already active and not in `Error`. Fails
    /// with `UnknownSource` for an unregistered target. Any failure during
    /// the stop/start sequence triggers an emergency stop and surfaces as a
    /// `Transition` error plus a single `Error` event; the failed target
    /// never becomes active.
    pub async fn transition_to_source(&self, target: AudioSource) -> HearthResult<()> {
        let _guard = self.transition_lock.lock().await;

        {
            let state = self.state.read();
            if state.active_source == target
                && state.plugin_state != PluginOperationalState::Error
            {
                log::debug!("[StateMachine] {} already active, nothing to do", target);
                return Ok(());
            }
        }
        if !target.is_none() && self.plugins.read().get(target).is_none() {
            return Err(HearthError::UnknownSource(target.to_string()));
        }

        match self.run_transition(target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.emergency_stop(target, &e).await;
                Err(HearthError::Transition {
                    attempted: target.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Routes a command to the plugin adapting `source`.
    ///
    /// Successful playback and volume commands are additionally surfaced as
    /// audio events for external observers.
    pub async fn handle_command(
        &self,
        source: AudioSource,
        command: &str,
        args: &Value,
    ) -> HearthResult<CommandResult> {
        let plugin = self.plugins.read().get(source);
        let Some(plugin) = plugin else {
            return Err(HearthError::UnknownSource(source.to_string()));
        };

        let result = plugin.handle_command(command, args).await;
        if result.success {
            match command {
                "play" | "pause" | "stop" | "next" | "previous" => {
                    self.publish(StandardEvent::new(
                        EventCategory::Audio,
                        EventType::PlaybackStatus,
                        source.name(),
                        json!({ "command": command }),
                    ));
                }
                "volume" | "set_volume" => {
                    self.publish(StandardEvent::new(
                        EventCategory::Audio,
                        EventType::VolumeChanged,
                        source.name(),
                        args.clone(),
                    ));
                }
                _ => {}
            }
        }
        Ok(result)
    }

    // ── internals ────────────────────────────────────────────────────────────

    async fn run_transition(&self, target: AudioSource) -> HearthResult<()> {
        let from = self.state.read().active_source;
        self.state.write().transitioning = true;
        self.publish(StandardEvent::new(
            EventCategory::System,
            EventType::TransitionStart,
            target.name(),
            json!({ "from": from.name(), "to": target.name() }),
        ));

        if !from.is_none() {
            let plugin = self.plugins.read().get(from);
            if let Some(plugin) = plugin {
                let report = plugin.stop().await;
                for issue in &report.issues {
                    log::warn!("[StateMachine] Stop issue for {}: {}", from, issue);
                }
            }
            let mut state = self.state.write();
            state.active_source = AudioSource::None;
            state.plugin_state = PluginOperationalState::Inactive;
            state.metadata.clear();
            state.error = None;
        }

        if !target.is_none() {
            let plugin = self.plugins.read().get(target);
            let plugin =
                plugin.ok_or_else(|| HearthError::UnknownSource(target.to_string()))?;
            self.ensure_initialized(&plugin, target).await?;

            {
                // Activate before start so the plugin's own state pushes are
                // accepted rather than dropped as stale.
                let mut state = self.state.write();
                state.active_source = target;
                state.plugin_state = PluginOperationalState::Inactive;
            }
            if let Err(e) = plugin.start().await {
                // The failed target never becomes active.
                self.state.write().reset_source();
                return Err(e);
            }
        }

        self.state.write().transitioning = false;
        self.publish(StandardEvent::new(
            EventCategory::System,
            EventType::TransitionComplete,
            target.name(),
            json!({ "active_source": target.name() }),
        ));
        Ok(())
    }

    async fn ensure_initialized(
        &self,
        plugin: &Arc<dyn AudioSourcePlugin>,
        target: AudioSource,
    ) -> HearthResult<()> {
        if self.initialized.lock().contains(&target) {
            return Ok(());
        }
        plugin.initialize().await?;
        self.initialized.lock().insert(target);
        Ok(())
    }

    /// Force-stops every registered plugin and resets the aggregate.
    ///
    /// The bulkhead after an unrecoverable transition failure: best-effort,
    /// never fails itself, and leaves the system in the well-defined empty
    /// state. Emits exactly one `Error` event for the failed transition.
    async fn emergency_stop(&self, attempted: AudioSource, error: &HearthError) {
        log::error!(
            "[StateMachine] Transition to {} failed, performing emergency stop: {}",
            attempted,
            error
        );

        let plugins: Vec<(AudioSource, Arc<dyn AudioSourcePlugin>)> = self
            .plugins
            .read()
            .iter()
            .map(|(source, plugin)| (source, Arc::clone(plugin)))
            .collect();
        for (source, plugin) in plugins {
            let report = plugin.stop().await;
            for issue in &report.issues {
                log::warn!(
                    "[StateMachine] Emergency stop issue for {}: {}",
                    source,
                    issue
                );
            }
        }

        self.state.write().reset_source();
        self.publish(StandardEvent::new(
            EventCategory::System,
            EventType::Error,
            attempted.name(),
            json!({
                "attempted_source": attempted.name(),
                "error": error.to_string(),
            }),
        ));
    }

    fn publish(&self, event: StandardEvent) {
        self.bus.publish(&event);
    }
}

impl StateUpdateSink for AudioStateMachine {
    /// Applies a state push from a plugin.
    ///
    /// Only honored for the source that currently owns the active slot;
    /// plugin monitors run on independent timers and may emit after a
    /// transition has already moved on, so stale updates are dropped, not
    /// queued.
    fn update_plugin_state(
        &self,
        source: AudioSource,
        new_state: PluginOperationalState,
        metadata: Map<String, Value>,
        error: Option<String>,
    ) {
        let old_state = {
            let mut state = self.state.write();
            if state.active_source != source {
                log::debug!(
                    "[StateMachine] Dropping stale update from {} (active: {})",
                    source,
                    state.active_source
                );
                return;
            }
            let old = state.plugin_state;
            state.plugin_state = new_state;
            for (key, value) in metadata.clone() {
                state.metadata.insert(key, value);
            }
            state.error = if new_state == PluginOperationalState::Error {
                error.or_else(|| Some("unspecified plugin error".into()))
            } else {
                None
            };
            old
        };

        self.publish(StandardEvent::new(
            EventCategory::Plugin,
            EventType::PluginStateChanged,
            source.name(),
            json!({
                "old_state": old_state,
                "new_state": new_state,
            }),
        ));

        let was_connected = old_state == PluginOperationalState::Connected;
        let is_connected = new_state == PluginOperationalState::Connected;
        if was_connected != is_connected {
            self.publish(StandardEvent::new(
                EventCategory::Plugin,
                EventType::PluginConnection,
                source.name(),
                json!({ "connected": is_connected }),
            ));
        }
        if !metadata.is_empty() {
            self.publish(StandardEvent::new(
                EventCategory::Plugin,
                EventType::PluginMetadata,
                source.name(),
                Value::Object(metadata),
            ));
        }
    }
}

impl RoutingListener for AudioStateMachine {
    /// Mirrors a confirmed multiroom change into the aggregate.
    ///
    /// Pure state mirror: never calls back into the routing service, keeping
    /// the call direction one-way.
    fn multiroom_changed(&self, enabled: bool) {
        self.state.write().multiroom_enabled = enabled;
        self.publish(StandardEvent::new(
            EventCategory::System,
            EventType::StateChanged,
            "routing",
            json!({ "multiroom_enabled": enabled }),
        ));
    }

    /// Mirrors a confirmed equalizer change into the aggregate.
    fn equalizer_changed(&self, enabled: bool) {
        self.state.write().equalizer_enabled = enabled;
        self.publish(StandardEvent::new(
            EventCategory::System,
            EventType::StateChanged,
            "routing",
            json!({ "equalizer_enabled": enabled }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::FakePlugin;
    use crate::services::routing::{NoopTopologyConfigurator, RoutingServiceConfig};
    use crate::services::service_control::testing::FakeServiceController;
    use crate::services::signals::testing::RecordingSignalSink;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        machine: Arc<AudioStateMachine>,
        routing: Arc<AudioRoutingService>,
        events: Arc<Mutex<Vec<StandardEvent>>>,
        calls: Arc<Mutex<Vec<String>>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let routing = Arc::new(AudioRoutingService::new(
            RoutingServiceConfig {
                state_dir: dir.path().to_path_buf(),
                server_unit: "snapserver.service".into(),
                client_unit: "snapclient.service".into(),
                settle_delay: Duration::from_millis(1),
                configure_poll_attempts: 1,
                configure_poll_interval: Duration::from_millis(1),
            },
            Arc::new(FakeServiceController::new()),
            Arc::new(RecordingSignalSink::default()),
            Arc::new(NoopTopologyConfigurator),
        ));
        let machine = AudioStateMachine::new(bus.clone(), routing.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        for category in [
            EventCategory::System,
            EventCategory::Plugin,
            EventCategory::Audio,
            EventCategory::User,
        ] {
            let sink = events.clone();
            bus.subscribe_to_category(
                category,
                Arc::new(move |event: &StandardEvent| {
                    sink.lock().push(event.clone());
                    Ok(())
                }),
            );
        }

        Fixture {
            machine,
            routing,
            events,
            calls: Arc::new(Mutex::new(Vec::new())),
            _dir: dir,
        }
    }

    impl Fixture {
        fn register(&self, source: AudioSource) -> Arc<FakePlugin> {
            let plugin = FakePlugin::new(source, self.calls.clone());
            self.machine.register_plugin(plugin.clone()).unwrap();
            plugin
        }

        fn events_of_type(&self, event_type: EventType) -> Vec<StandardEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.event_type == event_type)
                .cloned()
                .collect()
        }
    }

    #[tokio::test]
    async fn transition_activates_target_and_emits_pair() {
        let f = fixture();
        f.register(AudioSource::StreamingClient);

        f.machine
            .transition_to_source(AudioSource::StreamingClient)
            .await
            .unwrap();

        let state = f.machine.current_state();
        assert_eq!(state.active_source, AudioSource::StreamingClient);
        assert!(!state.transitioning);
        assert_eq!(
            *f.calls.lock(),
            vec!["streaming_client:initialize", "streaming_client:start"]
        );
        assert_eq!(f.events_of_type(EventType::TransitionStart).len(), 1);
        assert_eq!(f.events_of_type(EventType::TransitionComplete).len(), 1);
    }

    #[tokio::test]
    async fn switching_stops_old_source_before_starting_new() {
        let f = fixture();
        f.register(AudioSource::StreamingClient);
        f.register(AudioSource::BluetoothReceiver);

        f.machine
            .transition_to_source(AudioSource::StreamingClient)
            .await
            .unwrap();
        f.machine
            .transition_to_source(AudioSource::BluetoothReceiver)
            .await
            .unwrap();

        assert_eq!(
            *f.calls.lock(),
            vec![
                "streaming_client:initialize",
                "streaming_client:start",
                "streaming_client:stop",
                "bluetooth_receiver:initialize",
                "bluetooth_receiver:start",
            ]
        );
        assert_eq!(
            f.machine.current_state().active_source,
            AudioSource::BluetoothReceiver
        );
    }

    #[tokio::test]
    async fn repeated_transition_is_idempotent() {
        let f = fixture();
        let plugin = f.register(AudioSource::InternetRadio);

        f.machine
            .transition_to_source(AudioSource::InternetRadio)
            .await
            .unwrap();
        f.machine
            .transition_to_source(AudioSource::InternetRadio)
            .await
            .unwrap();

        // Second call is a no-op: no extra events, no extra lifecycle calls.
        assert_eq!(f.events_of_type(EventType::TransitionStart).len(), 1);
        assert_eq!(f.events_of_type(EventType::TransitionComplete).len(), 1);
        assert_eq!(plugin.initialize_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_source_is_rejected_without_events() {
        let f = fixture();

        let err = f
            .machine
            .transition_to_source(AudioSource::NetworkReceiver)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "unknown_source");
        assert!(f.events.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_start_triggers_emergency_stop() {
        let f = fixture();
        f.register(AudioSource::StreamingClient);
        let failing = f.register(AudioSource::BluetoothReceiver);
        failing.fail_start.store(true, Ordering::SeqCst);

        let err = f
            .machine
            .transition_to_source(AudioSource::BluetoothReceiver)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "transition_failed");
        let state = f.machine.current_state();
        assert_eq!(state.active_source, AudioSource::None);
        assert!(state.invariant_holds());
        assert!(!state.transitioning);

        // Exactly one Error event, carrying the attempted target.
        let errors = f.events_of_type(EventType::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["attempted_source"], "bluetooth_receiver");

        // Every registered plugin was asked to stop.
        let calls = f.calls.lock();
        assert!(calls.contains(&"streaming_client:stop".to_string()));
        assert!(calls.contains(&"bluetooth_receiver:stop".to_string()));
    }

    #[tokio::test]
    async fn failed_initialize_never_activates_the_target() {
        let f = fixture();
        let failing = f.register(AudioSource::NetworkReceiver);
        failing.fail_initialize.store(true, Ordering::SeqCst);

        let err = f
            .machine
            .transition_to_source(AudioSource::NetworkReceiver)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "transition_failed");
        assert_eq!(f.machine.current_state().active_source, AudioSource::None);
        assert_eq!(f.events_of_type(EventType::Error).len(), 1);
        // Initialization is retried on the next attempt since it never
        // succeeded.
        failing.fail_initialize.store(false, Ordering::SeqCst);
        f.machine
            .transition_to_source(AudioSource::NetworkReceiver)
            .await
            .unwrap();
        assert_eq!(failing.initialize_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transition_to_none_deactivates() {
        let f = fixture();
        f.register(AudioSource::MultiroomClient);
        f.machine
            .transition_to_source(AudioSource::MultiroomClient)
            .await
            .unwrap();

        f.machine
            .transition_to_source(AudioSource::None)
            .await
            .unwrap();

        let state = f.machine.current_state();
        assert_eq!(state.active_source, AudioSource::None);
        assert!(state.invariant_holds());
        assert!(f.calls.lock().contains(&"multiroom_client:stop".to_string()));
    }

    #[tokio::test]
    async fn stale_update_from_inactive_source_is_dropped() {
        let f = fixture();
        f.register(AudioSource::StreamingClient);
        f.register(AudioSource::BluetoothReceiver);
        f.machine
            .transition_to_source(AudioSource::StreamingClient)
            .await
            .unwrap();

        let mut metadata = Map::new();
        metadata.insert("device".into(), Value::from("stale phone"));
        f.machine.update_plugin_state(
            AudioSource::BluetoothReceiver,
            PluginOperationalState::Connected,
            metadata,
            None,
        );

        let state = f.machine.current_state();
        assert_eq!(state.plugin_state, PluginOperationalState::Inactive);
        assert!(state.metadata.is_empty());
        assert!(f.events_of_type(EventType::PluginStateChanged).is_empty());
    }

    #[tokio::test]
    async fn accepted_update_merges_metadata_and_emits() {
        let f = fixture();
        f.register(AudioSource::InternetRadio);
        f.machine
            .transition_to_source(AudioSource::InternetRadio)
            .await
            .unwrap();

        let mut metadata = Map::new();
        metadata.insert("station".into(), Value::from("fip"));
        f.machine.update_plugin_state(
            AudioSource::InternetRadio,
            PluginOperationalState::Connected,
            metadata,
            None,
        );

        let state = f.machine.current_state();
        assert_eq!(state.plugin_state, PluginOperationalState::Connected);
        assert_eq!(state.metadata["station"], "fip");
        assert!(state.error.is_none());

        let changed = f.events_of_type(EventType::PluginStateChanged);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].data["new_state"], "connected");
        assert_eq!(f.events_of_type(EventType::PluginConnection).len(), 1);
        assert_eq!(f.events_of_type(EventType::PluginMetadata).len(), 1);
    }

    #[tokio::test]
    async fn error_state_recovers_via_fresh_transition() {
        let f = fixture();
        f.register(AudioSource::StreamingClient);
        f.machine
            .transition_to_source(AudioSource::StreamingClient)
            .await
            .unwrap();

        f.machine.update_plugin_state(
            AudioSource::StreamingClient,
            PluginOperationalState::Error,
            Map::new(),
            Some("session dropped".into()),
        );
        assert_eq!(
            f.machine.current_state().error.as_deref(),
            Some("session dropped")
        );

        // Same target, but Error state: a full stop+start cycle runs.
        f.machine
            .transition_to_source(AudioSource::StreamingClient)
            .await
            .unwrap();

        let state = f.machine.current_state();
        assert_eq!(state.plugin_state, PluginOperationalState::Inactive);
        assert!(state.error.is_none());
        let calls = f.calls.lock();
        let stops = calls.iter().filter(|c| c.ends_with(":stop")).count();
        let starts = calls.iter().filter(|c| c.ends_with(":start")).count();
        assert_eq!(stops, 1);
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn routing_changes_are_mirrored_and_emitted() {
        let f = fixture();
        let machine_dyn: Arc<dyn RoutingListener> = f.machine.clone();
        f.routing.set_state_listener(Arc::downgrade(&machine_dyn));

        f.routing
            .set_multiroom_enabled(true, AudioSource::None)
            .await
            .unwrap();

        let state = f.machine.current_state();
        assert!(state.multiroom_enabled);
        let changed = f.events_of_type(EventType::StateChanged);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].data["multiroom_enabled"], true);

        f.routing.shutdown().await;
    }

    #[tokio::test]
    async fn commands_route_to_registered_plugins() {
        let f = fixture();
        f.register(AudioSource::BluetoothReceiver);

        let result = f
            .machine
            .handle_command(AudioSource::BluetoothReceiver, "ping", &Value::Null)
            .await
            .unwrap();
        assert!(result.success);

        let err = f
            .machine
            .handle_command(AudioSource::InternetRadio, "ping", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_source");
    }
}
