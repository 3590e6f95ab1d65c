//! JSON wire protocol shared by clients, the hub, and the fan-out bus.
//!
//! Every frame is one envelope:
//! ```text
//! {
//!   "type":        "edit" | "cursor" | "connected" | "user_join" | "user_leave",
//!   "document_id": i64,
//!   "user_id":     i64,
//!   "version":     u64,      // assigned by the server for edits, 0 otherwise
//!   "payload":     { ... },  // shape depends on "type"
//!   "timestamp":   i64       // unix seconds
//! }
//! ```
//!
//! Outbound frames are serialized once and shared between every recipient
//! queue as an `Arc<str>`. When several frames are queued for one client the
//! write pump joins them with `'\n'` into a single text frame.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a document in the external store.
pub type DocumentId = i64;

/// Identifier of an authenticated user.
pub type UserId = i64;

/// Opaque identifier of one live connection.
pub type ClientId = Uuid;

/// A serialized envelope, shared across recipient queues.
pub type Frame = Arc<str>;

/// Envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Incremental text mutation (client → server, and relayed with a version)
    Edit,
    /// Cursor or selection position; relayed verbatim, never persisted
    Cursor,
    /// Confirmation sent to a client right after registration
    Connected,
    /// Another client joined the document
    UserJoin,
    /// Another client left the document
    UserLeave,
    /// Anything this server does not understand
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Edit => "edit",
            MessageType::Cursor => "cursor",
            MessageType::Connected => "connected",
            MessageType::UserJoin => "user_join",
            MessageType::UserLeave => "user_leave",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access level of a user on a document.
///
/// Ordered from most to least privileged: `owner` > `edit` > `view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Owner,
    Edit,
    View,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Owner => "owner",
            Permission::Edit => "edit",
            Permission::View => "view",
        }
    }

    /// Whether edits from a holder of this permission are accepted.
    pub fn can_edit(&self) -> bool {
        matches!(self, Permission::Owner | Permission::Edit)
    }

    /// Whether this permission grants at least `required`.
    pub fn satisfies(&self, required: Permission) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Permission::View => 0,
            Permission::Edit => 1,
            Permission::Owner => 2,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Permission::Owner),
            "edit" => Ok(Permission::Edit),
            "view" => Ok(Permission::View),
            other => Err(ProtocolError::InvalidPermission(other.to_string())),
        }
    }
}

/// Payload of a `connected` confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub client_id: ClientId,
    pub permission: Permission,
    /// Clients registered on the document, including the new one
    pub active_users: usize,
}

/// Payload of a `user_join` notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoinPayload {
    pub user_id: UserId,
    pub permission: Permission,
}

/// Payload of a `user_leave` notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeavePayload {
    pub user_id: UserId,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub document_id: DocumentId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// Build an envelope stamped with the current time.
    pub fn new(
        kind: MessageType,
        document_id: DocumentId,
        user_id: UserId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            document_id,
            user_id,
            version: 0,
            payload,
            timestamp: unix_timestamp(),
        }
    }

    /// Confirmation for a freshly registered client.
    pub fn connected(document_id: DocumentId, user_id: UserId, payload: &ConnectedPayload) -> Self {
        Self::new(MessageType::Connected, document_id, user_id, to_value(payload))
    }

    /// Presence notice announcing `user_id` to the document's other clients.
    pub fn user_join(document_id: DocumentId, user_id: UserId, permission: Permission) -> Self {
        let payload = UserJoinPayload { user_id, permission };
        Self::new(MessageType::UserJoin, document_id, user_id, to_value(&payload))
    }

    /// Presence notice announcing that `user_id` left.
    pub fn user_leave(document_id: DocumentId, user_id: UserId) -> Self {
        let payload = UserLeavePayload { user_id };
        Self::new(MessageType::UserLeave, document_id, user_id, to_value(&payload))
    }

    pub fn cursor(document_id: DocumentId, user_id: UserId, payload: serde_json::Value) -> Self {
        Self::new(MessageType::Cursor, document_id, user_id, payload)
    }

    pub fn edit(document_id: DocumentId, user_id: UserId, payload: serde_json::Value) -> Self {
        Self::new(MessageType::Edit, document_id, user_id, payload)
    }

    /// Parse one envelope from a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Serialize once into a shareable frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.encode().map(Frame::from)
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

fn to_value<T: Serialize>(payload: &T) -> serde_json::Value {
    // Payload structs contain only plain fields and always serialize.
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

/// Current time in unix seconds.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
}
