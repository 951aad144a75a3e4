//! In-process room fan-out.
//!
//! [`MemoryHub`] plays the relay's part without a network: every
//! [`MemoryTransport`] it hands out joins one room, and an emit is delivered
//! synchronously to every other transport of the target room. Delivery order
//! per room therefore matches emit order.
//!
//! Used by tests and by hosts that run several editors in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{route, RoomId};
use crate::transport::{EventReceiver, Listeners, Transport, TransportError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Individual listener deliveries across all peers
    pub deliveries: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }
}

/// The sockets joined to one room.
pub struct BroadcastGroup {
    peers: RwLock<HashMap<Uuid, Arc<Listeners>>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn add_peer(&self, peer_id: Uuid, listeners: Arc<Listeners>) {
        self.peers.write().insert(peer_id, listeners);
    }

    pub fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().remove(peer_id).is_some()
    }

    /// Deliver to every peer except `from`.
    ///
    /// Returns the number of listeners reached.
    pub fn broadcast(&self, from: Uuid, event: &str, payload: &Value) -> usize {
        let reached: usize = self
            .peers
            .read()
            .iter()
            .filter(|(id, _)| **id != from)
            .map(|(_, listeners)| listeners.dispatch(event, payload))
            .sum();

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(reached as u64, Ordering::Relaxed);
        reached
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            active_peers: self.peer_count(),
        }
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps room ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, room: &RoomId) -> Arc<BroadcastGroup> {
        if let Some(group) = self.rooms.read().get(room) {
            return group.clone();
        }
        self.rooms
            .write()
            .entry(room.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new()))
            .clone()
    }

    pub fn get(&self, room: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().get(room).cloned()
    }

    pub fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write();
        if rooms.get(room).is_some_and(|g| g.peer_count() == 0) {
            rooms.remove(room);
            return true;
        }
        false
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().keys().cloned().collect()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process stand-in for the relay.
#[derive(Clone, Default)]
pub struct MemoryHub {
    rooms: Arc<RoomManager>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connected transport joined to `room`.
    pub fn connect(&self, room: impl Into<RoomId>) -> Arc<MemoryTransport> {
        let room = room.into();
        let transport = Arc::new(MemoryTransport {
            peer_id: Uuid::new_v4(),
            room: room.clone(),
            rooms: self.rooms.clone(),
            listeners: Arc::new(Listeners::new()),
            connected: AtomicBool::new(true),
        });
        self.rooms
            .get_or_create(&room)
            .add_peer(transport.peer_id, transport.listeners.clone());
        log::debug!("Memory peer {} joined room {room}", transport.peer_id);
        transport
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }
}

/// One socket on a [`MemoryHub`].
pub struct MemoryTransport {
    peer_id: Uuid,
    room: RoomId,
    rooms: Arc<RoomManager>,
    listeners: Arc<Listeners>,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Leave the room. Later emits fail with `NotConnected` and nothing more
    /// is delivered here.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(group) = self.rooms.get(&self.room) {
            group.remove_peer(&self.peer_id);
        }
        self.rooms.remove_if_empty(&self.room);
        self.listeners.clear();
        log::debug!("Memory peer {} left room {}", self.peer_id, self.room);
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let routed = route(event, payload);
        let target = routed.room.unwrap_or_else(|| self.room.clone());
        match self.rooms.get(&target) {
            Some(group) => {
                let reached = group.broadcast(self.peer_id, event, &routed.payload);
                log::trace!("Room {target}: {event} reached {reached} listeners");
            }
            None => log::trace!("Room {target}: {event} dropped, no peers"),
        }
        Ok(())
    }

    fn on(&self, event: &str) -> EventReceiver {
        self.listeners.register(event)
    }

    fn off(&self, event: &str) {
        self.listeners.remove(event);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
