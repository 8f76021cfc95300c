//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for business logic.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::{HearthError, HearthResult};
use crate::plugin::{CommandResult, PluginStatus};
use crate::services::ServiceAvailability;
use crate::state::{AudioSource, SystemAudioState};

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TransitionRequest {
    source: String,
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/state", get(get_current_state))
        .route("/api/source", post(transition_source))
        .route("/api/source/{name}/status", get(get_source_status))
        .route("/api/source/{name}/command", post(handle_source_command))
        .route("/api/routing", get(get_routing))
        .route("/api/routing/multiroom", post(set_multiroom))
        .route("/api/routing/equalizer", post(set_equalizer))
        .route("/api/routing/services", get(list_services))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_current_state(State(state): State<AppState>) -> Json<SystemAudioState> {
    Json(state.machine.current_state())
}

fn parse_source(name: &str) -> HearthResult<AudioSource> {
    name.parse()
        .map_err(|e: String| HearthError::InvalidRequest(e))
}

async fn transition_source(
    State(state): State<AppState>,
    Json(request): Json<TransitionRequest>,
) -> HearthResult<Json<Value>> {
    let source = parse_source(&request.source)?;
    state.machine.transition_to_source(source).await?;
    Ok(Json(json!({
        "success": true,
        "active_source": source.name(),
    })))
}

async fn get_source_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HearthResult<Json<PluginStatus>> {
    let source = parse_source(&name)?;
    let plugin = state
        .machine
        .plugin(source)
        .ok_or_else(|| HearthError::UnknownSource(source.to_string()))?;
    Ok(Json(plugin.get_status().await))
}

async fn handle_source_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<CommandRequest>,
) -> HearthResult<Json<CommandResult>> {
    let source = parse_source(&name)?;
    let result = state
        .machine
        .handle_command(source, &request.command, &request.data)
        .await?;
    Ok(Json(result))
}

async fn get_routing(State(state): State<AppState>) -> Json<Value> {
    let routing = state.routing.state();
    // Persisted intent and probed reality are both reported: callers decide
    // whether a mode is actually operative from the latter.
    let bus = state.routing.snapcast_status().await;
    Json(json!({
        "multiroom_enabled": routing.multiroom_enabled,
        "equalizer_enabled": routing.equalizer_enabled,
        "bus": bus,
    }))
}

async fn set_multiroom(
    State(state): State<AppState>,
    Json(request): Json<ToggleRequest>,
) -> HearthResult<Json<Value>> {
    let active = state.machine.current_state().active_source;
    let outcome = state
        .routing
        .set_multiroom_enabled(request.enabled, active)
        .await?;
    Ok(Json(json!({
        "success": true,
        "changed": outcome.changed,
        "warnings": outcome.warnings,
    })))
}

async fn set_equalizer(
    State(state): State<AppState>,
    Json(request): Json<ToggleRequest>,
) -> HearthResult<Json<Value>> {
    let active = state.machine.current_state().active_source;
    let outcome = state
        .routing
        .set_equalizer_enabled(request.enabled, active)
        .await?;
    Ok(Json(json!({
        "success": true,
        "changed": outcome.changed,
        "warnings": outcome.warnings,
    })))
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceAvailability>> {
    Json(state.routing.available_services().await)
}
