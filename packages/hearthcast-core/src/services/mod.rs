//! Application services layer.
//!
//! This module contains the business logic services that orchestrate
//! between the API layer and the supervised external audio engines.

pub mod routing;
pub mod service_control;
pub mod signals;
pub mod state_machine;

pub use routing::{
    ApplyOutcome, AudioRoutingService, BusStatus, NoopTopologyConfigurator, PluginLookup,
    RoutingListener, RoutingServiceConfig, RoutingState, ServiceAvailability,
    TopologyConfigurator,
};
pub use service_control::{ServiceController, SystemdServiceController};
pub use signals::{EnvFileSignalSink, SignalSink};
pub use state_machine::AudioStateMachine;
