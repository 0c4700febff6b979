#![forbid(unsafe_code)]

// Connection directory - routes unicast signaling by connection id

use super::protocol::ServerMessage;
use crate::room::Outbound;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queues of every live connection, keyed by connection id.
///
/// Each receiver has exactly one ordered queue. A sender's handler task
/// forwards its messages one at a time, so messages from one sender to one
/// receiver arrive in the order they were sent.
#[derive(Clone, Default)]
pub struct ConnectionDirectory {
    inner: Arc<StdRwLock<HashMap<String, Outbound>>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: &str, sender: Outbound) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(connection_id.to_string(), sender);
    }

    pub fn unregister(&self, connection_id: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(connection_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a message for one connection. Returns false when the target is
    /// unknown, gone, or too far behind to accept it.
    pub fn unicast(&self, to_connection_id: &str, message: &ServerMessage) -> bool {
        let sender = {
            let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match map.get(to_connection_id) {
                Some(sender) => sender.clone(),
                None => {
                    debug!("Dropping {:?} for unknown connection {}", message_kind(message), to_connection_id);
                    return false;
                }
            }
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize relayed message: {}", e);
                return false;
            }
        };

        match sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for connection {}, dropping relayed message", to_connection_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for connection {} (disconnected)", to_connection_id);
                false
            }
        }
    }
}

fn message_kind(message: &ServerMessage) -> &'static str {
    match message {
        ServerMessage::SignalOffer { .. } => "signal-offer",
        ServerMessage::SignalAnswer { .. } => "signal-answer",
        ServerMessage::SignalIce { .. } => "signal-ice",
        _ => "message",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ice(from: &str, n: u32) -> ServerMessage {
        ServerMessage::SignalIce {
            to_connection_id: "b".to_string(),
            from_connection_id: from.to_string(),
            candidate: json!({ "candidate": format!("candidate:{n}") }),
            box_id: Some(2),
        }
    }

    #[test]
    fn test_unicast_preserves_order() {
        let dir = ConnectionDirectory::new();
        let (tx, mut rx) = mpsc::channel(16);
        dir.register("b", tx);

        for n in 0..5 {
            assert!(dir.unicast("b", &ice("a", n)));
        }
        for n in 0..5 {
            let msg: ServerMessage = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(msg, ice("a", n));
        }
    }

    #[test]
    fn test_unknown_or_closed_target_is_dropped() {
        let dir = ConnectionDirectory::new();
        assert!(!dir.unicast("nobody", &ice("a", 0)));

        let (tx, rx) = mpsc::channel(1);
        dir.register("b", tx);
        drop(rx);
        assert!(!dir.unicast("b", &ice("a", 0)));

        dir.unregister("b");
        assert!(dir.is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let dir = ConnectionDirectory::new();
        let (tx, _rx) = mpsc::channel(1);
        dir.register("b", tx);
        assert!(dir.unicast("b", &ice("a", 0)));
        assert!(!dir.unicast("b", &ice("a", 1)));
    }
}
