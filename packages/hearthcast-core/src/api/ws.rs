//! WebSocket push channel for external observers.
//!
//! Every connected observer receives an initial full-state snapshot, then
//! every [`StandardEvent`] serialized in the stable wire format. Observers
//! whose delivery fails are pruned; a lagging observer is resynchronized
//! with a fresh snapshot instead of silently missing events.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::api::AppState;
use crate::events::{EventCategory, EventType, StandardEvent};

/// Upgrades the connection and hands it to the observer loop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Builds the full-state snapshot event sent on connect and on resync.
fn snapshot_event(state: &AppState) -> StandardEvent {
    let data = serde_json::to_value(state.machine.current_state()).unwrap_or_default();
    StandardEvent::new(
        EventCategory::System,
        EventType::StateChanged,
        "system",
        data,
    )
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &StandardEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|e| {
        log::error!("[WS] Failed to serialize event: {}", e);
    })?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let conn_guard = state.ws_manager.register();
    let cancel_token = conn_guard.cancel_token().clone();
    let mut broadcast_rx = state.event_bridge.subscribe();

    // Initial full-state snapshot, before any event can flow.
    if send_event(&mut sender, &snapshot_event(&state)).await.is_err() {
        log::warn!("[WS] Failed to send initial state, client disconnected");
        return;
    }

    let mut last_activity = Instant::now();
    let heartbeat_timeout = Duration::from_secs(state.config.ws_heartbeat_timeout_secs);
    // Interval instead of sleep to reduce timer allocations and prevent
    // drift; Delay mode skips missed ticks rather than bursting.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(
        state.config.ws_heartbeat_check_interval_secs,
    ));
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Force-close request from the connection manager
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection force-closed: ws-{}", conn_guard.id());
                break;
            }
            // Incoming traffic only keeps the connection alive; the push
            // channel is one-way.
            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            // Forward broadcasted events
            event = broadcast_rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            // Delivery failed: prune this observer.
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!(
                            "[WS] Observer ws-{} lagged, missed {} event(s); resyncing",
                            conn_guard.id(),
                            missed
                        );
                        if send_event(&mut sender, &snapshot_event(&state)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            // Heartbeat timeout check
            _ = heartbeat_interval.tick() => {
                if last_activity.elapsed() > heartbeat_timeout {
                    log::warn!("[WS] Heartbeat timeout for ws-{}", conn_guard.id());
                    break;
                }
            }
        }
    }

    // ConnectionGuard Drop handles unregistration.
}
