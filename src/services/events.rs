use serde::Serialize;
use tokio::sync::broadcast;

/// Events fanned out to protocol-level subscribers. Emission never blocks;
/// slow subscribers lose the oldest entries instead of stalling producers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEvent {
    ConnectionState {
        connection_id: String,
        state: String,
    },
    TransferProgress {
        transfer_id: String,
        status: String,
        progress: u8,
        bytes_transferred: u64,
        size: u64,
    },
    TerminalData {
        session_id: String,
        data: String,
    },
    TunnelClosed {
        tunnel_id: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
