//! WebSocket relay with room-based fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌──► Client B
//!             ├── Room (path) ── broadcast ─┤
//! Client C ──┘                      └──► Client C (not A: sender skipped)
//! ```
//!
//! A socket's room is the path of its handshake URL. `code-change` frames
//! are addressed by their `roomId` and reach the other sockets of that room
//! as `{code}`. Other events go to the sender's own room unchanged. The
//! relay keeps no document state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{route, Envelope, RoomId};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum sockets per room
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub relayed_messages: u64,
    pub active_rooms: usize,
}

/// A frame on its way to the sockets of a room.
#[derive(Debug)]
struct Frame {
    from: Uuid,
    text: String,
}

struct RelayRoom {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: usize,
}

impl RelayRoom {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, peers: 0 }
    }
}

type Rooms = Arc<RwLock<HashMap<RoomId, RelayRoom>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut path = String::new();
        let capture_room = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().trim_matches('/').to_string();
            if path.is_empty() {
                let mut reject = ErrorResponse::new(Some("room id required in path".to_string()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                return Err(reject);
            }
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_room).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let room_id = RoomId::new(path);
        let socket_id = Uuid::new_v4();

        // Join the room
        let mut room_rx = {
            let mut rooms_w = rooms.write().await;
            let peers = rooms_w.get(&room_id).map_or(0, |r| r.peers);
            if peers >= config.max_peers_per_room {
                drop(rooms_w);
                log::warn!("Room {room_id} full, rejecting {addr}");
                stats.write().await.rejected_connections += 1;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
            let room = rooms_w
                .entry(room_id.clone())
                .or_insert_with(|| RelayRoom::new(config.broadcast_capacity));
            room.peers += 1;
            let rx = room.sender.subscribe();
            let room_count = rooms_w.len();
            drop(rooms_w);

            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = room_count;
            rx
        };
        log::info!("Socket {socket_id} from {addr} joined room {room_id}");

        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            &mut room_rx,
            socket_id,
            &room_id,
            &rooms,
            &stats,
        )
        .await;

        // Cleanup: leave the room, drop it when empty
        {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&room_id) {
                room.peers = room.peers.saturating_sub(1);
                if room.peers == 0 {
                    rooms_w.remove(&room_id);
                    log::debug!("Room {room_id} removed (empty)");
                }
            }
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms_w.len();
        }
        log::info!("Socket {socket_id} left room {room_id}");

        result
    }

    async fn pump<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        room_rx: &mut broadcast::Receiver<Arc<Frame>>,
        socket_id: Uuid,
        room_id: &RoomId,
        rooms: &Rooms,
        stats: &Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.as_str().len() as u64;
                            }

                            let envelope = match Envelope::decode(text.as_str()) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {socket_id}: {e}");
                                    continue;
                                }
                            };

                            let routed = route(&envelope.event, envelope.payload);
                            let target = routed.room.unwrap_or_else(|| room_id.clone());
                            let frame = Envelope::new(envelope.event, routed.payload).encode()?;

                            let sender = {
                                let rooms_r = rooms.read().await;
                                rooms_r.get(&target).map(|r| r.sender.clone())
                            };
                            match sender {
                                Some(tx) => {
                                    let _ = tx.send(Arc::new(Frame { from: socket_id, text: frame }));
                                    stats.write().await.relayed_messages += 1;
                                }
                                None => log::debug!("Room {target} has no sockets, frame dropped"),
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Socket {socket_id} closed");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error on {socket_id}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing room traffic
                frame = room_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.from == socket_id {
                                continue;
                            }
                            ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Socket {socket_id} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
