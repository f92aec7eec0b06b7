//! Binary wire protocol between editors and the sync server.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//!
//! ```text
//! client                                   server
//!   │ Join { doc, participant, known_rev }   │
//!   │ ─────────────────────────────────────► │
//!   │      Joined { rev, content, missed }   │
//!   │ ◄───────────────────────────────────── │
//!   │ Submit { seq, rev, delta }             │
//!   │ ─────────────────────────────────────► │
//!   │      Remote { .. } / Ack { seq, rev }  │  (in revision order)
//!   │ ◄───────────────────────────────────── │
//! ```
//!
//! Acks travel on the same ordered stream as remote operations, so a client
//! never sees its acknowledgement before an operation committed ahead of it.

use collabwrite_core::{Committed, Delta, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::{CursorRange, Session};
use crate::storage::Checkpoint;

/// Checkpoint progress reported to every participant of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveStatus {
    Saving,
    Saved { revision: u64 },
    /// Non-fatal: editing continues and the save is retried.
    Error { message: String },
}

/// Why a submission was refused without changing the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Offsets exceed the document, or the sequence number was reused.
    Malformed(String),
    /// The client claims a revision the server has not reached.
    UnknownRevision { revision: u64, current: u64 },
}

/// A chat line relayed to everyone in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub participant_id: String,
    pub display_name: String,
    pub text: String,
    /// Seconds since epoch
    pub sent_at: u64,
}

/// Messages sent by editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Open a document. `known_revision` is set on reconnect so the server
    /// can send only the operations missed in between.
    Join {
        document_id: Uuid,
        participant_id: String,
        display_name: String,
        known_revision: Option<u64>,
    },
    /// A local edit computed against `revision`.
    Submit { seq: u64, revision: u64, delta: Delta },
    Cursor { range: CursorRange },
    Chat { text: String },
    ListVersions,
    Leave,
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined {
        document_id: Uuid,
        revision: u64,
        content: Delta,
        color: String,
        participants: Vec<Session>,
        /// Operations after the client's `known_revision`, when still
        /// retained. `None` means the client must start from `content`.
        missed: Option<Vec<Committed>>,
    },
    /// The client's own operation was committed at `revision`.
    Ack { seq: u64, revision: u64 },
    /// Another participant's operation, already transformed.
    Remote { revision: u64, operation: Operation },
    Rejected { seq: u64, reason: RejectReason },
    /// Replace local state; pending local edits are lost.
    Resync { revision: u64, content: Delta },
    SessionJoined { session: Session },
    SessionLeft { participant_id: String },
    CursorMoved { participant_id: String, range: CursorRange },
    Chat(ChatMessage),
    SaveStatus(SaveStatus),
    Versions { versions: Vec<Checkpoint> },
    Pong,
    Error { message: String },
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collabwrite_core::attributes;

    #[test]
    fn test_submit_encoding_is_compact() {
        let msg = ClientMessage::Submit {
            seq: 3,
            revision: 120,
            delta: Delta::new().retain(40).insert("a"),
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 32, "submit frame is {} bytes", encoded.len());
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_joined_with_missed_operations() {
        let committed = Committed {
            revision: 8,
            operation: Operation::new(
                "bob",
                2,
                7,
                Delta::new().retain(1).insert_with("x", attributes([("bold", true)])),
            ),
        };
        let msg = ServerMessage::Joined {
            document_id: Uuid::new_v4(),
            revision: 8,
            content: Delta::from_text("axb"),
            color: "#FF6B6B".into(),
            participants: Vec::new(),
            missed: Some(vec![committed.clone()]),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Joined { missed: Some(missed), revision, .. } => {
                assert_eq!(revision, 8);
                assert_eq!(missed, vec![committed]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decoded_delta_is_canonical() {
        // A peer may send non-merged components; decoding normalises them.
        let msg = ClientMessage::Submit {
            seq: 1,
            revision: 0,
            delta: Delta::new().insert("ab"),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        if let ClientMessage::Submit { delta, .. } = decoded {
            assert_eq!(delta.target_len(), 2);
            assert_eq!(delta.base_len(), 0);
        } else {
            panic!("expected submit");
        }
    }

    #[test]
    fn test_submit_with_overflowing_delta_rejected() {
        // Same variant layout as `ClientMessage`, with the delta unchecked.
        #[derive(Serialize)]
        #[allow(dead_code)]
        enum RawMessage {
            Join,
            Submit {
                seq: u64,
                revision: u64,
                delta: Vec<collabwrite_core::Component>,
            },
        }
        let raw = RawMessage::Submit {
            seq: 1,
            revision: 0,
            delta: vec![
                collabwrite_core::Component::retain(usize::MAX),
                collabwrite_core::Component::Delete(1),
            ],
        };
        let bytes = encode(&raw).unwrap();
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerMessage::decode(&garbage).is_err());
        assert!(matches!(
            ClientMessage::decode(&[]),
            Err(ProtocolError::Deserialization(_))
        ));
    }
}
