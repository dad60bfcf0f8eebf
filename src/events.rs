//! Event bus
//!
//! Components hold an [`EventBus`] by composition instead of inheriting an
//! emitter. Emission is best-effort broadcast: with no subscribers an event
//! is simply dropped.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::ledger::LedgerHeader;

/// Connection state of the remote as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Events emitted by a [`crate::Remote`].
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// Online/offline state change.
    State(ConnectionState),
    /// First connection established.
    Connect,
    /// Last connection dropped.
    Disconnect,
    /// Every configured server connection is up.
    Ready,
    /// A well-formed ledger close advanced (or corroborated) tracked state.
    LedgerClosed(LedgerHeader),
    /// A transaction affecting a current subscription.
    Transaction(Arc<Value>),
    /// Every transaction seen on the stream.
    TransactionAll(Arc<Value>),
    /// A path-find update (also delivered to the active session).
    PathFindAll(Arc<Value>),
    /// A validation message from the server stream.
    Validation(Arc<Value>),
    /// Server-reported load parameters changed.
    Load { load_base: u64, load_factor: u64 },
    /// The subscribe handshake with a server completed.
    Subscribed,
    /// A malformed inbound message was observed.
    ProtocolError(String),
}

/// Broadcast-backed event bus.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RemoteEvent>,
    /// Soft subscriber cap; 0 means unlimited.
    max_listeners: usize,
}

impl EventBus {
    pub fn new(max_listeners: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx, max_listeners }
    }

    /// Subscribe to all remote events.
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        if self.max_listeners != 0 && self.tx.receiver_count() >= self.max_listeners {
            warn!(
                listeners = self.tx.receiver_count(),
                max = self.max_listeners,
                "listener count exceeds configured max_listeners"
            );
        }
        self.tx.subscribe()
    }

    /// Emit an event. Returns the number of receivers it reached.
    pub fn emit(&self, event: RemoteEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
