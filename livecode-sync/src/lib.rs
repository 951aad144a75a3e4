//! # livecode-sync — live code editor synchronization
//!
//! Keeps an editing surface in step with the other participants of a room,
//! last write wins on the whole document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  change(origin)  ┌─────────────┐   code-change    ┌─────────────┐
//! │ TextWidget  │ ───────────────► │ EditorSync  │ ───────────────► │  Transport  │
//! │ (editor)    │ ◄─────────────── │ (one task)  │ ◄─────────────── │ (room)      │
//! └─────────────┘    set_value     └──────┬──────┘   {code}         └──────┬──────┘
//!                                         │                                │
//!                                  debounce 600ms                   ┌──────┴──────┐
//!                                         ▼                         │ RelayServer │
//!                                     show_hint                     │ / MemoryHub │
//!                                                                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — event names, payloads, JSON frame envelope
//! - [`widget`] — origin tags, change events, in-memory editor
//! - [`transport`] — transport trait, listener registry, late-bound socket handle
//! - [`debounce`] — single owned timer
//! - [`editor`] — the sync controller
//! - [`broadcast`] — in-process room hub
//! - [`client`] — WebSocket transport
//! - [`server`] — WebSocket relay

pub mod protocol;
pub mod widget;
pub mod transport;
pub mod debounce;
pub mod editor;
pub mod broadcast;
pub mod client;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    Envelope, InboundCodeChange, OutboundCodeChange, ProtocolError, RoomId, CODE_CHANGE,
};
pub use widget::{ChangeEvent, ChangeKind, Origin, TextBuffer, TextWidget};
pub use transport::{Listeners, SocketRef, Transport, TransportError};
pub use debounce::{DebounceState, Debouncer};
pub use editor::{EditorSync, SyncConfig, SyncStats};
pub use broadcast::{BroadcastGroup, BroadcastStats, MemoryHub, MemoryTransport, RoomManager};
pub use client::{ConnectionState, WsTransport};
pub use server::{RelayConfig, RelayServer, RelayStats};
