//! Bridge from the in-process bus to the broadcast transport.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between the event bus
//! and transport concerns: it subscribes to every category and forwards each
//! event into a `tokio::sync::broadcast` channel that WebSocket handlers
//! subscribe to. Observers whose receiver falls away are pruned by the
//! transport side; the bridge itself never blocks on delivery.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::bus::EventBus;
use super::{EventCategory, StandardEvent};

/// Forwards every published event to a broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<StandardEvent>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes the bridge to all categories of the bus.
    ///
    /// After this call every event published on `bus` is forwarded to the
    /// broadcast channel. Send failures only mean there are currently no
    /// receivers; they are logged at trace level and ignored.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        for category in [
            EventCategory::System,
            EventCategory::Plugin,
            EventCategory::Audio,
            EventCategory::User,
        ] {
            let bridge = Arc::clone(self);
            bus.subscribe_to_category(
                category,
                Arc::new(move |event| {
                    if let Err(e) = bridge.tx.send(event.clone()) {
                        log::trace!("[EventBridge] No broadcast receivers: {}", e);
                    }
                    Ok(())
                }),
            );
        }
    }

    /// Returns a new receiver for the broadcast channel.
    ///
    /// WebSocket handlers use this to subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<StandardEvent> {
        self.tx.subscribe()
    }

    /// Returns a reference to the broadcast sender.
    pub fn sender(&self) -> &broadcast::Sender<StandardEvent> {
        &self.tx
    }
}
