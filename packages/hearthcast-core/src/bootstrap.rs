//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. There is no global
//! container: every component receives the collaborators it needs by
//! reference, which keeps the dependency graph visible and makes test setup
//! a matter of injecting fakes here.

use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::api::{AppState, WsConnectionManager};
use crate::error::{HearthError, HearthResult};
use crate::events::{BroadcastEventBridge, EventBus};
use crate::plugin::service_backed::{ServiceBackedConfig, ServiceBackedPlugin};
use crate::plugin::StateUpdateSink;
use crate::services::{
    AudioRoutingService, AudioStateMachine, EnvFileSignalSink, NoopTopologyConfigurator,
    RoutingListener, RoutingServiceConfig, ServiceController, SignalSink,
    SystemdServiceController, TopologyConfigurator,
};
use crate::state::{AudioSource, Config};

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// The in-process event bus.
    pub bus: Arc<EventBus>,
    /// Bridge forwarding bus events to the WebSocket broadcast channel.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// The routing service.
    pub routing: Arc<AudioRoutingService>,
    /// The unified audio state machine.
    pub machine: Arc<AudioStateMachine>,
    /// Manages WebSocket connections.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Application configuration.
    pub config: Arc<Config>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Builds the API layer's shared state.
    pub fn app_state(&self) -> AppState {
        AppState {
            machine: Arc::clone(&self.machine),
            routing: Arc::clone(&self.routing),
            event_bridge: Arc::clone(&self.event_bridge),
            ws_manager: Arc::clone(&self.ws_manager),
            config: Arc::clone(&self.config),
        }
    }

    /// Initiates graceful shutdown of all services.
    ///
    /// Stops the active source (which cancels its monitor), closes observer
    /// connections, and cancels outstanding background tasks.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        if let Err(e) = self.machine.transition_to_source(AudioSource::None).await {
            log::warn!(
                "[Bootstrap] Failed to deactivate source during shutdown: {}",
                e
            );
        }

        let closed = self.ws_manager.close_all();
        if closed > 0 {
            log::info!("[Bootstrap] Closed {} WebSocket connection(s)", closed);
        }

        self.routing.shutdown().await;
        self.cancel_token.cancel();

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps all services with production collaborators.
///
/// Uses `systemctl` for service control and the env-file signal sink under
/// the configured state directory.
pub async fn bootstrap_services(config: Config) -> HearthResult<BootstrappedServices> {
    let controller: Arc<dyn ServiceController> = Arc::new(SystemdServiceController::default());
    let signals: Arc<dyn SignalSink> = Arc::new(EnvFileSignalSink::new(&config.state_dir));
    bootstrap_services_with(
        config,
        controller,
        signals,
        Arc::new(NoopTopologyConfigurator),
    )
    .await
}

/// Bootstraps all services with explicit collaborators.
///
/// The wiring order matters - services are created in dependency order:
///
/// 1. Event bus and its broadcast bridge
/// 2. Routing service (service control + signal sink)
/// 3. State machine (bus + routing)
/// 4. Backward wiring: routing's listener and plugin lookup (held weakly,
///    the call graph stays one-way)
/// 5. Default service-backed plugin adapters
/// 6. Routing initialization (load persisted intent, reconcile with the
///    observed bus state)
pub async fn bootstrap_services_with(
    config: Config,
    controller: Arc<dyn ServiceController>,
    signals: Arc<dyn SignalSink>,
    topology: Arc<dyn TopologyConfigurator>,
) -> HearthResult<BootstrappedServices> {
    config.validate().map_err(HearthError::InvalidRequest)?;
    let config = Arc::new(config);

    let bus = Arc::new(EventBus::new());
    let event_bridge = Arc::new(BroadcastEventBridge::new(config.event_channel_capacity));
    event_bridge.attach(&bus);

    let routing = Arc::new(AudioRoutingService::new(
        RoutingServiceConfig::from_config(&config),
        Arc::clone(&controller),
        signals,
        topology,
    ));

    let machine = AudioStateMachine::new(Arc::clone(&bus), Arc::clone(&routing));
    let machine_as_listener: Arc<dyn RoutingListener> = machine.clone();
    let listener: Weak<dyn RoutingListener> = Arc::downgrade(&machine_as_listener);
    routing.set_state_listener(listener);
    {
        let machine = Arc::downgrade(&machine);
        routing.set_plugin_lookup(Arc::new(move |source| {
            machine.upgrade().and_then(|m| m.plugin(source))
        }));
    }

    let sink: Arc<dyn StateUpdateSink> = machine.clone();
    for adapter in ServiceBackedConfig::defaults() {
        let plugin = ServiceBackedPlugin::new(adapter, Arc::clone(&controller), Arc::clone(&sink));
        machine.register_plugin(plugin)?;
    }

    routing.initialize().await;

    log::info!(
        "[Bootstrap] Services wired: {} plugin(s) registered",
        machine.registered_sources().len()
    );

    Ok(BootstrappedServices {
        bus,
        event_bridge,
        routing,
        machine,
        ws_manager: Arc::new(WsConnectionManager::new()),
        config,
        cancel_token: CancellationToken::new(),
    })
}
