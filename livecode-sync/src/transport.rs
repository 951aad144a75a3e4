//! Event-channel capability shared by every transport.
//!
//! A transport is a named-event emitter/listener pair bound to one room.
//! Listeners are plain unbounded receivers so the controller can poll them
//! next to its other event sources.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::protocol::ProtocolError;

/// Receiver half handed out by [`Transport::on`].
pub type EventReceiver = mpsc::UnboundedReceiver<Value>;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Named-event channel to the other participants of a room.
pub trait Transport: Send + Sync {
    /// Publish `payload` under `event`. Never retried.
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Register a listener for `event`.
    fn on(&self, event: &str) -> EventReceiver;

    /// Remove every listener registered for `event`.
    fn off(&self, event: &str);
}

/// Per-socket listener registry.
#[derive(Default)]
pub struct Listeners {
    handlers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn remove(&self, event: &str) {
        self.handlers.lock().remove(event);
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Deliver `payload` to every live listener of `event`.
    ///
    /// Returns the number of listeners reached. Closed receivers are pruned.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let mut handlers = self.handlers.lock();
        let Some(senders) = handlers.get_mut(event) else {
            return 0;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        let reached = senders.len();
        if senders.is_empty() {
            handlers.remove(event);
        }
        reached
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }
}

type Slot = Option<Arc<dyn Transport>>;

/// Late-bound handle to the live connection.
///
/// Starts empty when the host mounts the editor before the socket is up.
/// Every clone shares the same slot; [`SocketRef::watch`] observes swaps.
#[derive(Clone)]
pub struct SocketRef {
    slot: Arc<watch::Sender<Slot>>,
}

impl SocketRef {
    /// A handle with no connection yet.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    pub fn connected(transport: Arc<dyn Transport>) -> Self {
        let socket = Self::new();
        socket.set(transport);
        socket
    }

    pub fn set(&self, transport: Arc<dyn Transport>) {
        self.slot.send_replace(Some(transport));
    }

    pub fn clear(&self) {
        self.slot.send_replace(None);
    }

    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.slot.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn watch(&self) -> watch::Receiver<Slot> {
        self.slot.subscribe()
    }
}

impl Default for SocketRef {
    fn default() -> Self {
        Self::new()
    }
}
