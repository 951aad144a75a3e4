//! Event names, payload shapes and the JSON frame envelope.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! {"event": "code-change", "payload": {"roomId": "r1", "code": "let x=1;"}}   client → relay
//! {"event": "code-change", "payload": {"code": "let x=1;"}}                   relay → peers
//! ```
//!
//! The outbound payload names the room; the relay strips it before fan-out,
//! so receivers only ever see `{code}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Full-document update event, both directions.
pub const CODE_CHANGE: &str = "code-change";

/// Opaque room token scoping which peers share a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Payload a client publishes for every local edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCodeChange {
    pub room_id: RoomId,
    pub code: String,
}

/// Payload a client receives for a remote edit.
///
/// `code: null` (or a missing field) is a well-formed no-op.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundCodeChange {
    #[serde(default)]
    pub code: Option<String>,
}

/// One framed event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Where a relayed event goes and what the receivers see.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    /// Target room named by the payload; `None` means the sender's own room.
    pub room: Option<RoomId>,
    pub payload: Value,
}

/// Decide the fan-out target for an event published by a client.
///
/// A well-formed `code-change` is addressed to its `roomId` and reshaped to
/// the inbound `{code}` form. Everything else is passed through untouched.
pub fn route(event: &str, payload: Value) -> Routed {
    if event == CODE_CHANGE {
        if let Ok(outbound) = serde_json::from_value::<OutboundCodeChange>(payload.clone()) {
            let inbound = InboundCodeChange {
                code: Some(outbound.code),
            };
            match serde_json::to_value(&inbound) {
                Ok(reshaped) => {
                    return Routed {
                        room: Some(outbound.room_id),
                        payload: reshaped,
                    }
                }
                Err(e) => log::warn!("Failed to reshape code-change payload: {e}"),
            }
        }
    }
    Routed {
        room: None,
        payload,
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
