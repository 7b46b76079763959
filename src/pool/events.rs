//! Typed connection lifecycle notifications
//!
//! Connections publish onto a broadcast channel; the manager's listener and
//! any external observer subscribe. Sending never blocks and a lagging
//! receiver only loses old events.

use tokio::sync::broadcast;

use crate::purpose::Purpose;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A transport was established
    Connected { purpose: Purpose, connection_id: u64 },

    /// The transport reported a connection-level failure
    ConnectionLost {
        purpose: Purpose,
        connection_id: u64,
        reason: String,
    },

    /// The connection was closed by the pool
    Closed { purpose: Purpose, connection_id: u64 },

    /// A purpose entered recovery
    RecoveryStarted { purpose: Purpose },

    /// A purpose reconnected after `attempts` tries
    Recovered { purpose: Purpose, attempts: u32 },

    /// A purpose gave up reconnecting
    Degraded { purpose: Purpose, attempts: u32 },
}

impl PoolEvent {
    pub fn purpose(&self) -> Purpose {
        match self {
            PoolEvent::Connected { purpose, .. }
            | PoolEvent::ConnectionLost { purpose, .. }
            | PoolEvent::Closed { purpose, .. }
            | PoolEvent::RecoveryStarted { purpose }
            | PoolEvent::Recovered { purpose, .. }
            | PoolEvent::Degraded { purpose, .. } => *purpose,
        }
    }
}

/// Publishing half of the event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
