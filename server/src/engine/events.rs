use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a room (the marker the room is attached to).
pub type RoomId = String;

/// Caller-supplied per-session identifier. Unique within a room, not globally.
pub type ClientId = String;

/// A serialized message, shared between every recipient's outbound queue.
pub type Payload = Arc<str>;

/// Text frame a client sends to signal liveness. Never broadcast.
pub const PING_LITERAL: &str = r#"{"type":"ping"}"#;

/// The envelope every chat, presence and relayed message travels in.
/// Serialized identically to the socket and to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub uid: String,
    pub message: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userNickname")]
    pub user_nickname: String,
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl BroadcastMessage {
    /// Build a message with a fresh id and the current time.
    pub fn new(room_id: &str, message: &str, sender_name: &str, sender_id: &str) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            message: message.to_string(),
            user_id: sender_id.to_string(),
            user_nickname: sender_name.to_string(),
            room_id: room_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::to_string(self).map(Payload::from)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Why a connection's write pump was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No client frame within the idle grace period.
    Idle,
    /// Removed by a moderator.
    Kicked,
    /// Server is going down.
    Shutdown,
}

impl CloseReason {
    /// Text carried in the close frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Idle => "inactive",
            CloseReason::Kicked => "kicked",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Transport-neutral outbound frame. The web adapter maps it onto its socket type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Payload),
    /// Close frame. `None` means an empty close (normal disconnect path).
    Close(Option<CloseReason>),
}
