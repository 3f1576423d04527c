//! Binary protocol for session coordination.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────────────┬──────────┬──────────┐
//! │ msg_type │ user_id   │ resource           │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes + 1 byte  │ 8 bytes  │ variable │
//! └──────────┴───────────┴────────────────────┴──────────┴──────────┘
//! ```
//!
//! `seq` is assigned by the server per session room, strictly monotonic.
//! Clients send frames with `seq = 0`; the value they receive back defines
//! the total order of events within that session.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Message types for the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client joins a session (payload: UserInfo)
    Join = 1,
    /// Client leaves a session
    Leave = 2,
    /// Single-user presence update (payload: UserPresence)
    Presence = 3,
    /// Full roster replacement (payload: Vec<UserPresence>)
    Roster = 4,
    /// Request an edit lease (payload: LockRequest)
    LockRequest = 5,
    /// Lease granted, broadcast to the room (payload: Lease)
    LockGrant = 6,
    /// Lease denied, sent to the requester only (payload: LockDenied)
    LockDeny = 7,
    /// Refresh a held lease (payload: LockRefresh)
    LockRefresh = 8,
    /// Release a held lease
    LockRelease = 9,
    /// Lease cleared by expiry sweep or force-unlock (payload: LockRevoked)
    LockRevoke = 10,
    /// Batch of offline operations (payload: SyncBatch)
    SyncBatch = 11,
    /// Per-operation acknowledgement (payload: SyncAck)
    SyncAck = 12,
    /// Request the authoritative record set for the session
    RecordsRequest = 13,
    /// Authoritative record snapshot (payload: Vec<FieldRecord>)
    RecordsSnapshot = 14,
    /// Heartbeat ping
    Ping = 15,
    /// Heartbeat pong
    Pong = 16,
}

/// Kind of resource a session or lease refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceType {
    Audit = 1,
    Finding = 2,
    DataPoint = 3,
    Area = 4,
    Comment = 5,
    Document = 6,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Audit => "audit",
            ResourceType::Finding => "finding",
            ResourceType::DataPoint => "data_point",
            ResourceType::Area => "area",
            ResourceType::Comment => "comment",
            ResourceType::Document => "document",
        }
    }
}

/// A resource identified by id and kind. Leases and sessions key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_id: Uuid,
    pub resource_type: ResourceType,
}

impl ResourceKey {
    pub fn new(resource_id: Uuid, resource_type: ResourceType) -> Self {
        Self { resource_id, resource_type }
    }

    /// Key for an audit session (the room-level resource).
    pub fn audit(audit_id: Uuid) -> Self {
        Self::new(audit_id, ResourceType::Audit)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type.as_str(), self.resource_id)
    }
}

/// User identity with display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub user_id: Uuid,
    pub user_name: String,
}

impl UserInfo {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            user_name: user_name.into(),
        }
    }

    /// Create with explicit user_id (for testing)
    pub fn with_id(user_id: Uuid, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
        }
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead. Typed payloads are encoded
/// separately via [`SessionMessage::with_payload`] / decoded via
/// [`SessionMessage::decode_payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub msg_type: MessageType,
    pub user_id: Uuid,
    pub resource: ResourceKey,
    /// Server-assigned sequence number (0 until stamped by the server).
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl SessionMessage {
    /// Create a message with an empty payload.
    pub fn new(msg_type: MessageType, user_id: Uuid, resource: ResourceKey) -> Self {
        Self {
            msg_type,
            user_id,
            resource,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a message carrying a bincode-encoded payload.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        user_id: Uuid,
        resource: ResourceKey,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let bytes = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            user_id,
            resource,
            seq: 0,
            payload: bytes,
        })
    }

    /// Decode the payload as a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Create a ping message.
    pub fn ping(user_id: Uuid) -> Self {
        Self::new(MessageType::Ping, user_id, ResourceKey::audit(Uuid::nil()))
    }

    /// Create a pong message.
    pub fn pong(user_id: Uuid) -> Self {
        Self::new(MessageType::Pong, user_id, ResourceKey::audit(Uuid::nil()))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Offline,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Offline => write!(f, "Client is offline"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let user = Uuid::new_v4();
        let resource = ResourceKey::audit(Uuid::new_v4());

        let msg = SessionMessage::new(MessageType::Join, user, resource);
        let encoded = msg.encode().unwrap();
        let decoded = SessionMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.user_id, user);
        assert_eq!(decoded.resource, resource);
        assert_eq!(decoded.seq, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_typed_payload_roundtrip() {
        let info = UserInfo::new("Alice");
        let resource = ResourceKey::audit(Uuid::new_v4());

        let msg = SessionMessage::with_payload(
            MessageType::Join,
            info.user_id,
            resource,
            &info,
        )
        .unwrap();
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        let parsed: UserInfo = decoded.decode_payload().unwrap();
        assert_eq!(parsed.user_name, "Alice");
        assert_eq!(parsed.user_id, info.user_id);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SessionMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_decode_payload_wrong_type() {
        let msg = SessionMessage::ping(Uuid::new_v4());
        assert!(msg.decode_payload::<UserInfo>().is_err());
    }

    #[test]
    fn test_resource_key_display() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = ResourceKey::new(id, ResourceType::Finding);
        assert_eq!(key.to_string(), format!("finding/{id}"));
    }

    #[test]
    fn test_message_size_efficient() {
        let user = Uuid::new_v4();
        let resource = ResourceKey::audit(Uuid::new_v4());

        // Control frame should stay well under 100 bytes on the wire
        let msg = SessionMessage::new(MessageType::LockRelease, user, resource);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 100,
            "Encoded size {} too large for an empty control frame",
            encoded.len()
        );
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::LockRequest as u8, 5);
        assert_eq!(MessageType::LockRevoke as u8, 10);
        assert_eq!(MessageType::SyncBatch as u8, 11);
        assert_eq!(MessageType::Pong as u8, 16);
    }
}
