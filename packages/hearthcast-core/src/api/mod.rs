//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to services.
//! It provides the router construction and server startup functionality.

use std::sync::Arc;

use thiserror::Error;

use crate::events::BroadcastEventBridge;
use crate::services::{AudioRoutingService, AudioStateMachine};
use crate::state::Config;

pub mod http;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind or serve on the configured port.
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to services; all business logic lives
/// in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// The unified audio state machine.
    pub machine: Arc<AudioStateMachine>,
    /// The routing service.
    pub routing: Arc<AudioRoutingService>,
    /// Event bridge whose broadcast channel feeds WebSocket observers.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// Manages WebSocket connections.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Application configuration.
    pub config: Arc<Config>,
}

/// Binds the configured port and serves the control surface until the
/// process shuts down.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.bind_port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    log::info!("[API] Listening on {}", addr);

    let router = http::create_router(state);
    axum::serve(listener, router).await?;
    Ok(())
}
