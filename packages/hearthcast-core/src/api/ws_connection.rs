//! WebSocket connection tracking.
//!
//! - [`WsConnectionManager`] tracks all active observer connections
//! - [`ConnectionGuard`] is an RAII guard for automatic cleanup on disconnect
//!
//! Force-close uses hierarchical cancellation tokens: cancelling the global
//! token signals every connection handler to terminate, after which a fresh
//! token is installed so new connections can still be accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

struct ConnectionState {
    connected_at: Instant,
}

/// Manages all active WebSocket observer connections.
pub struct WsConnectionManager {
    connections: DashMap<u64, ConnectionState>,
    next_id: AtomicU64,
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    /// Creates a new connection manager.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection and returns a guard for RAII cleanup.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.global_cancel.read().child_token();

        self.connections.insert(
            id,
            ConnectionState {
                connected_at: Instant::now(),
            },
        );
        log::info!(
            "[WS] Observer connected: ws-{} (total: {})",
            id,
            self.connections.len()
        );

        ConnectionGuard {
            id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: u64) {
        if let Some((_, state)) = self.connections.remove(&id) {
            log::info!(
                "[WS] Observer disconnected: ws-{} after {:?} (remaining: {})",
                id,
                state.connected_at.elapsed(),
                self.connections.len()
            );
        }
    }

    /// Returns the number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Force-closes all connections.
    ///
    /// Returns the number of connections signaled to close.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped.
pub struct ConnectionGuard {
    id: u64,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    /// The connection's numeric id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token cancelled when the manager force-closes connections.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drop_track_counts() {
        let manager = Arc::new(WsConnectionManager::new());
        let guard_a = manager.register();
        let guard_b = manager.register();
        assert_eq!(manager.connection_count(), 2);
        assert_ne!(guard_a.id(), guard_b.id());

        drop(guard_a);
        assert_eq!(manager.connection_count(), 1);
        drop(guard_b);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn close_all_cancels_existing_but_not_new_connections() {
        let manager = Arc::new(WsConnectionManager::new());
        let old = manager.register();

        assert_eq!(manager.close_all(), 1);
        assert!(old.cancel_token().is_cancelled());

        let fresh = manager.register();
        assert!(!fresh.cancel_token().is_cancelled());
    }
}
