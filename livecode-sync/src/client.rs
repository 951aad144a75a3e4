//! WebSocket transport for connecting an editor to a relay.
//!
//! Provides:
//! - Connection to `{server_url}/{room_id}`
//! - Writer task: outgoing frames are queued on an unbounded channel so
//!   [`Transport::emit`] never blocks the caller
//! - Reader task: incoming frames are decoded and dispatched to listeners
//!
//! Reconnection is left to the host; a closed transport stays closed and
//! emits report `NotConnected`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Envelope, RoomId};
use crate::transport::{EventReceiver, Listeners, Transport, TransportError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A relay connection scoped to one room.
pub struct WsTransport {
    room_id: RoomId,
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: mpsc::UnboundedSender<String>,
    listeners: Arc<Listeners>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    /// Connect to the relay and join `room_id`.
    pub async fn connect(
        server_url: &str,
        room_id: RoomId,
    ) -> Result<Arc<Self>, TransportError> {
        let url = format!("{}/{}", server_url.trim_end_matches('/'), room_id);
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::error!("Failed to connect to {url}: {e}");
            TransportError::Connect(e.to_string())
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Connected before either task can observe a close and mark it down
        *state.write() = ConnectionState::Connected;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_state = state.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::debug!("WebSocket write failed: {e}");
                    break;
                }
            }
            *writer_state.write() = ConnectionState::Disconnected;
            let _ = ws_writer.close().await;
        });

        // Reader task: decode frames and hand payloads to listeners
        let listeners = Arc::new(Listeners::new());
        let reader_listeners = listeners.clone();
        let reader_state = state.clone();
        let reader_room = room_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Envelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            let reached =
                                reader_listeners.dispatch(&envelope.event, &envelope.payload);
                            log::trace!(
                                "Room {reader_room}: {} delivered to {reached} listeners",
                                envelope.event
                            );
                        }
                        Err(e) => log::warn!("Room {reader_room}: dropping bad frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *reader_state.write() = ConnectionState::Disconnected;
            log::info!("Room {reader_room}: connection closed");
        });

        log::info!("Connected to {url}");

        Ok(Arc::new(Self {
            room_id,
            url,
            state,
            outgoing: out_tx,
            listeners,
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop both tasks and mark the transport closed.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.state.write() = ConnectionState::Disconnected;
        self.listeners.clear();
    }
}

impl Transport for WsTransport {
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let frame = Envelope::new(event, payload).encode()?;
        self.outgoing
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn on(&self, event: &str) -> EventReceiver {
        self.listeners.register(event)
    }

    fn off(&self, event: &str) {
        self.listeners.remove(event);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
