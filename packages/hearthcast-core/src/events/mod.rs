//! Event system for state-change notification.
//!
//! This module provides:
//! - [`StandardEvent`], the categorized, typed notification envelope
//! - [`EventBus`] for in-process fan-out to registered subscribers
//! - [`BroadcastEventBridge`] for forwarding every event to transport
//!
//! Events are transport DTOs, never internal state: they are immutable once
//! constructed and carry a creation timestamp in float seconds.

mod bridge;
mod bus;

pub use bridge::BroadcastEventBridge;
pub use bus::{EventBus, EventDeliveryError, Subscriber};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::utils::now_secs;

/// Coarse event category; subscribers may register for a whole category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Control-plane lifecycle: transitions, routing changes, failures.
    System,
    /// Plugin lifecycle and connection state.
    Plugin,
    /// Audio-level signals (volume, playback status).
    Audio,
    /// Events originating from a user-facing control surface.
    User,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Plugin => "plugin",
            Self::Audio => "audio",
            Self::User => "user",
        };
        f.write_str(s)
    }
}

/// Fine-grained event tag within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A top-level state field changed (routing mode, equalizer, ...).
    StateChanged,
    /// A source transition began.
    TransitionStart,
    /// A source transition completed successfully.
    TransitionComplete,
    /// An unrecoverable failure; for transitions, emitted after emergency stop.
    Error,
    /// The active plugin's operational state changed.
    PluginStateChanged,
    /// The active plugin pushed new source-specific metadata.
    PluginMetadata,
    /// A plugin's peer connection came up or went down.
    PluginConnection,
    /// Output volume changed.
    VolumeChanged,
    /// Playback started/paused/stopped on the active source.
    PlaybackStatus,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StateChanged => "state_changed",
            Self::TransitionStart => "transition_start",
            Self::TransitionComplete => "transition_complete",
            Self::Error => "error",
            Self::PluginStateChanged => "plugin_state_changed",
            Self::PluginMetadata => "plugin_metadata",
            Self::PluginConnection => "plugin_connection",
            Self::VolumeChanged => "volume_changed",
            Self::PlaybackStatus => "playback_status",
        };
        f.write_str(s)
    }
}

/// The notification envelope delivered for every observable state change.
///
/// Wire format (JSON), stable field set:
///
/// ```json
/// { "category": "system", "type": "transition_start",
///   "source": "bluetooth_receiver", "data": { ... }, "timestamp": 1723.5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardEvent {
    /// Coarse category, one of `system|plugin|audio|user`.
    pub category: EventCategory,
    /// Fine-grained tag within the category.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Originating component or audio source name.
    pub source: String,
    /// Event-specific payload.
    pub data: Value,
    /// Creation time, Unix seconds.
    pub timestamp: f64,
}

impl StandardEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        category: EventCategory,
        event_type: EventType,
        source: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            category,
            event_type,
            source: source.into(),
            data,
            timestamp: now_secs(),
        }
    }
}
