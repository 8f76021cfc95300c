//! Hearthcast Core - control plane for a single-node audio appliance.
//!
//! The appliance plays from exactly one of several interchangeable audio
//! sources (streaming client, Bluetooth receiver, network receiver,
//! multiroom client, internet radio) while routing audio either directly to
//! local hardware or out to a multiroom audio bus. This crate keeps a
//! consistent view of "what is currently producing sound" and supervises
//! the external daemons that implement the actual audio I/O.
//!
//! # Architecture
//!
//! The crate is organized into several modules, leaf to root:
//!
//! - [`events`]: typed event envelope, in-process fan-out, transport bridge
//! - [`plugin`]: the adapter contract, the reusable connection-health
//!   monitor, and the service-backed adapter building block
//! - [`services`]: the audio routing service and the unified state machine
//! - [`api`]: HTTP/WebSocket control surface (thin handlers)
//! - [`bootstrap`]: the composition root wiring everything together
//!
//! # Abstraction Traits
//!
//! Seams that decouple core logic from the host environment:
//!
//! - [`ServiceController`](services::ServiceController): init-system control
//!   of supervised daemons
//! - [`SignalSink`](services::SignalSink): the downstream environment signals
//! - [`StateUpdateSink`](plugin::StateUpdateSink): plugin state pushes into
//!   the state machine
//! - [`RoutingListener`](services::RoutingListener): routing confirmations
//!   back into the state machine
//!
//! Each trait has a default implementation suitable for an embedded Linux
//! deployment; tests inject fakes.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod error;
pub mod events;
pub mod plugin;
pub mod services;
pub mod state;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError, WsConnectionManager};
pub use bootstrap::{bootstrap_services, bootstrap_services_with, BootstrappedServices};
pub use error::{ErrorCode, HearthError, HearthResult};
pub use events::{
    BroadcastEventBridge, EventBus, EventCategory, EventType, StandardEvent,
};
pub use plugin::{
    AudioSourcePlugin, CommandResult, PluginRegistry, PluginStatus, StateUpdateSink, StopReport,
};
pub use services::{
    AudioRoutingService, AudioStateMachine, RoutingState, ServiceController,
    SystemdServiceController,
};
pub use state::{AudioSource, Config, PluginOperationalState, SystemAudioState};
