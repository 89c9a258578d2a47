//! Wire protocol for document synchronization.
//!
//! Every frame on the channel is a bincode-encoded [`WireMessage`].
//! The payload-bearing frame is [`ChangeMessage`]: one flush of locally
//! buffered edits, optionally carrying a persistable [`Snapshot`] and an
//! inline [`CursorMessage`].
//!
//! Acknowledged sends correlate request and response through a `seq`
//! number: a `TextUpdate { seq: Some(n), .. }` is answered by exactly one
//! `Ack { seq: n, .. }`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Opaque per-session client identifier.
///
/// Generated once when a document view mounts and never reused. Its only
/// job is echo suppression: a session discards broadcasts carrying its own
/// id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create from an existing string (for testing and round trips).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One editing session: identity plus the room it is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client_id: ClientId,
    /// Room id; one room per document.
    pub room_id: String,
    pub username: String,
}

impl SessionInfo {
    /// Create a session with a freshly generated client id.
    pub fn new(room_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client_id: ClientId::generate(),
            room_id: room_id.into(),
            username: username.into(),
        }
    }
}

/// The canonical persisted text of a document at a point in time.
///
/// Distinct from the live editable content, which may carry richer markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
    pub timestamp: u64,
}

impl Snapshot {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: unix_millis(),
        }
    }
}

/// Caret position side-channel payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMessage {
    pub client_id: ClientId,
    pub username: String,
    /// Character offset in the document.
    pub offset: u32,
    /// Pixel coordinates in the editor viewport.
    pub x: f32,
    pub y: f32,
    pub ts: u64,
}

/// One flushed change. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub client_id: ClientId,
    pub timestamp: u64,
    /// Document id; doubles as the room id for fan-out.
    pub document_id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    /// Live editor content, possibly with markup.
    pub content: String,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Present when this flush should be persisted server-side.
    pub persist_snapshot: Option<Snapshot>,
    /// Inline cursor for the acknowledged change-with-cursor form.
    pub cursor: Option<CursorMessage>,
}

/// Terminal outcome of one acknowledged round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AckResponse {
    Ok,
    Failed { error: String },
}

impl AckResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed { error: error.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AckResponse::Ok)
    }
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Attach a session to a document room.
    JoinRoom {
        room_id: String,
        client_id: ClientId,
        username: String,
    },
    /// Detach from a room.
    LeaveRoom {
        room_id: String,
        client_id: ClientId,
    },
    /// Propagate a content change. An ack is requested iff `seq` is set;
    /// the change-with-cursor form carries `change.cursor`.
    TextUpdate {
        seq: Option<u64>,
        change: ChangeMessage,
    },
    /// Metadata-only update, broadcast without persistence.
    TitleUpdate {
        room_id: String,
        client_id: ClientId,
        title: String,
        ts: u64,
    },
    /// Caret side-channel, rebroadcast verbatim.
    CursorPosition {
        room_id: String,
        cursor: CursorMessage,
    },
    /// Canvas path payload; relayed on the same transport, never persisted.
    DrawingData {
        room_id: String,
        client_id: ClientId,
        payload: Vec<u8>,
    },
    /// Membership notification, server to clients.
    UserJoined {
        room_id: String,
        client_id: ClientId,
        username: String,
    },
    UserLeft {
        room_id: String,
        client_id: ClientId,
    },
    /// Response to an acknowledged `TextUpdate`.
    Ack {
        seq: u64,
        response: AckResponse,
    },
}

impl WireMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// The room a frame targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            WireMessage::JoinRoom { room_id, .. }
            | WireMessage::LeaveRoom { room_id, .. }
            | WireMessage::TitleUpdate { room_id, .. }
            | WireMessage::CursorPosition { room_id, .. }
            | WireMessage::DrawingData { room_id, .. }
            | WireMessage::UserJoined { room_id, .. }
            | WireMessage::UserLeft { room_id, .. } => Some(room_id),
            WireMessage::TextUpdate { change, .. } => Some(&change.document_id),
            WireMessage::Ack { .. } => None,
        }
    }

    /// The client that produced a frame, if any.
    pub fn sender(&self) -> Option<&ClientId> {
        match self {
            WireMessage::JoinRoom { client_id, .. }
            | WireMessage::LeaveRoom { client_id, .. }
            | WireMessage::TitleUpdate { client_id, .. }
            | WireMessage::DrawingData { client_id, .. }
            | WireMessage::UserJoined { client_id, .. }
            | WireMessage::UserLeft { client_id, .. } => Some(client_id),
            WireMessage::TextUpdate { change, .. } => Some(&change.client_id),
            WireMessage::CursorPosition { cursor, .. } => Some(&cursor.client_id),
            WireMessage::Ack { .. } => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_change(client_id: ClientId) -> ChangeMessage {
        ChangeMessage {
            client_id,
            timestamp: unix_millis(),
            document_id: "doc-1".to_string(),
            user_id: Some("u-9".to_string()),
            user_email: None,
            content: "Hello world".to_string(),
            title: Some("Notes".to_string()),
            tags: Some(vec!["draft".to_string()]),
            persist_snapshot: Some(Snapshot::new("Hello world")),
            cursor: None,
        }
    }

    #[test]
    fn test_client_id_unique() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_text_update_roundtrip() {
        let id = ClientId::generate();
        let msg = WireMessage::TextUpdate {
            seq: Some(7),
            change: sample_change(id.clone()),
        };

        let encoded = msg.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();

        match decoded {
            WireMessage::TextUpdate { seq, change } => {
                assert_eq!(seq, Some(7));
                assert_eq!(change.client_id, id);
                assert_eq!(change.content, "Hello world");
                assert_eq!(change.persist_snapshot.unwrap().text, "Hello world");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_join_leave_roundtrip() {
        let id = ClientId::generate();
        let join = WireMessage::JoinRoom {
            room_id: "doc-42".to_string(),
            client_id: id.clone(),
            username: "alice".to_string(),
        };
        let leave = WireMessage::LeaveRoom {
            room_id: "doc-42".to_string(),
            client_id: id.clone(),
        };

        let join = WireMessage::decode(&join.encode().unwrap()).unwrap();
        let leave = WireMessage::decode(&leave.encode().unwrap()).unwrap();

        assert_eq!(join.room_id(), Some("doc-42"));
        assert_eq!(join.sender(), Some(&id));
        assert_eq!(leave.room_id(), Some("doc-42"));
    }

    #[test]
    fn test_cursor_roundtrip() {
        let id = ClientId::generate();
        let msg = WireMessage::CursorPosition {
            room_id: "doc-1".to_string(),
            cursor: CursorMessage {
                client_id: id.clone(),
                username: "bob".to_string(),
                offset: 12,
                x: 104.5,
                y: 33.0,
                ts: 99,
            },
        };

        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            WireMessage::CursorPosition { cursor, .. } => {
                assert_eq!(cursor.client_id, id);
                assert_eq!(cursor.offset, 12);
                assert_eq!(cursor.x, 104.5);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let ok = WireMessage::Ack { seq: 3, response: AckResponse::Ok };
        let failed = WireMessage::Ack {
            seq: 4,
            response: AckResponse::failed("storage unavailable"),
        };

        match WireMessage::decode(&ok.encode().unwrap()).unwrap() {
            WireMessage::Ack { seq, response } => {
                assert_eq!(seq, 3);
                assert!(response.is_ok());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        match WireMessage::decode(&failed.encode().unwrap()).unwrap() {
            WireMessage::Ack { seq, response } => {
                assert_eq!(seq, 4);
                assert_eq!(response, AckResponse::failed("storage unavailable"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_ack_has_no_room() {
        let ack = WireMessage::Ack { seq: 1, response: AckResponse::Ok };
        assert!(ack.room_id().is_none());
        assert!(ack.sender().is_none());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(WireMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_drawing_data_opaque() {
        let id = ClientId::generate();
        let msg = WireMessage::DrawingData {
            room_id: "doc-1".to_string(),
            client_id: id,
            payload: vec![1, 2, 3, 4],
        };
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            WireMessage::DrawingData { payload, .. } => assert_eq!(payload, vec![1, 2, 3, 4]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
