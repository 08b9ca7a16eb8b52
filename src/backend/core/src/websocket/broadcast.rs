//! Connection registry and fan-out.

use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorCode, MeteoError};

use super::message::PushMessage;

/// Buffered messages per connection before a consumer counts as stalled.
pub const CONNECTION_BUFFER: usize = 64;

/// Registry of live websocket connections with best-effort fan-out.
///
/// Delivery gives no ordering or receipt guarantees across clients: a
/// closed or stalled connection is skipped and the broadcast continues.
pub struct Broadcaster {
    connections: DashMap<Uuid, mpsc::Sender<Message>>,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub active_connections: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub skipped: u64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            broadcasts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Register a connection's outbound channel, returning its id.
    pub fn register(&self, sender: mpsc::Sender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.connections.insert(id, sender);
        gauge!("meteo_ws_connections").set(self.connections.len() as f64);
        debug!(connection_id = %id, "WebSocket connection registered");
        id
    }

    /// Drop a connection from the registry.
    pub fn unregister(&self, id: Uuid) {
        self.connections.remove(&id);
        gauge!("meteo_ws_connections").set(self.connections.len() as f64);
        debug!(connection_id = %id, "WebSocket connection unregistered");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Fan a message out to every live connection.
    ///
    /// Serialization happens once per broadcast. Connections whose
    /// channel is closed or full are skipped, never retried.
    pub async fn send(&self, message: &PushMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                // Broadcast failures are logged, never propagated.
                MeteoError::with_internal(
                    ErrorCode::BroadcastFailed,
                    "Failed to serialize push message",
                    format!("kind {}: {}", message.kind, e),
                )
                .log();
                return;
            }
        };

        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0u64;
        let mut skipped = 0u64;
        for entry in self.connections.iter() {
            match entry.value().try_send(Message::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => skipped += 1,
            }
        }

        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
        counter!("meteo_ws_messages_delivered_total").increment(delivered);
        counter!("meteo_ws_messages_skipped_total").increment(skipped);

        debug!(kind = %message.kind, delivered, skipped, "Broadcast complete");
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            active_connections: self.connections.len(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
