//! In-process event fan-out.
//!
//! The [`EventBus`] delivers every published [`StandardEvent`] to subscribers
//! registered for the event's category and, separately, to subscribers
//! registered for its specific type. A misbehaving subscriber cannot break
//! the bus: callback errors are logged and delivery continues.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use super::{EventCategory, EventType, StandardEvent};

/// Error a subscriber callback may report.
///
/// Returned errors are logged by the bus; they never interrupt delivery to
/// the remaining subscribers.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EventDeliveryError(pub String);

/// A registered event callback.
pub type Subscriber = Arc<dyn Fn(&StandardEvent) -> Result<(), EventDeliveryError> + Send + Sync>;

/// Fan-out hub for [`StandardEvent`]s.
///
/// Registration is append-only; a callback registered twice is invoked
/// twice. Delivery order within each list is registration order: category
/// subscribers first, then type subscribers.
#[derive(Default)]
pub struct EventBus {
    category_subs: RwLock<HashMap<EventCategory, Vec<Subscriber>>>,
    type_subs: RwLock<HashMap<EventType, Vec<Subscriber>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for every event in a category.
    pub fn subscribe_to_category(&self, category: EventCategory, subscriber: Subscriber) {
        self.category_subs
            .write()
            .entry(category)
            .or_default()
            .push(subscriber);
    }

    /// Registers a callback for one specific event type.
    pub fn subscribe_to_type(&self, event_type: EventType, subscriber: Subscriber) {
        self.type_subs
            .write()
            .entry(event_type)
            .or_default()
            .push(subscriber);
    }

    /// Delivers an event to all matching subscribers.
    ///
    /// Category subscribers and type subscribers both fire; a subscriber to
    /// a category sees every type within it. Returns the number of callbacks
    /// invoked.
    pub fn publish(&self, event: &StandardEvent) -> usize {
        tracing::debug!(
            category = %event.category,
            event_type = %event.event_type,
            source = %event.source,
            "publish"
        );
        // Clone the callback lists out before invoking so a subscriber that
        // publishes from inside its callback cannot deadlock on the lock.
        let category_list: Vec<Subscriber> = self
            .category_subs
            .read()
            .get(&event.category)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();
        let type_list: Vec<Subscriber> = self
            .type_subs
            .read()
            .get(&event.event_type)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();

        let mut delivered = 0;
        for subscriber in category_list.iter().chain(type_list.iter()) {
            if let Err(e) = subscriber(event) {
                log::warn!(
                    "[EventBus] Subscriber failed for {}/{}: {}",
                    event.category,
                    event.event_type,
                    e
                );
            }
            delivered += 1;
        }
        delivered
    }
}
