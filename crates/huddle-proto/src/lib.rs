//! Wire events exchanged with the room signaling server.
//! Frames are JSON text of the shape `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Keys probed, in order, when a peer reference arrives as an object.
pub const PEER_ID_KEYS: [&str; 4] = ["id", "userId", "peerId", "socketId"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoin {
    pub room_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub sender: String,
    /// Milliseconds since the unix epoch, as stamped by the sender.
    pub timestamp: u64,
}

/// Events the client emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(RoomJoin),
    ChatMessage(ChatMessage),
}

/// Events the server pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    UserConnected(PeerRef),
    UserDisconnected(PeerRef),
    ChatMessage(ChatMessage),
}

/// A peer identity as the server happened to encode it.
///
/// Servers in the wild send a bare id string or an object carrying the id
/// under one of several keys. Anything else is kept so it can be logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PeerRef {
    Raw(String),
    Structured(Map<String, Value>),
    Other(Value),
}

impl PeerRef {
    pub fn raw(id: impl Into<String>) -> Self {
        PeerRef::Raw(id.into())
    }

    /// Extracts the peer id. Returns `None` when no usable id is present.
    pub fn normalize(&self) -> Option<String> {
        match self {
            PeerRef::Raw(id) => non_empty(id),
            PeerRef::Structured(map) => PEER_ID_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(|value| value.as_str().and_then(non_empty)),
            PeerRef::Other(_) => None,
        }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRef::Raw(id) => f.write_str(id),
            PeerRef::Structured(map) => write!(f, "{}", Value::Object(map.clone())),
            PeerRef::Other(value) => write!(f, "{value}"),
        }
    }
}

fn non_empty(id: &str) -> Option<String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl ClientEvent {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
