//! Logical envelope exchanged with the transport layer.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬─────────────┬──────────────────────────────────────┐
//! │ kind     │ document_id │ payload                              │
//! │ 1 byte   │ 16 bytes    │ ChangeBroadcast | PresenceUpdate |   │
//! │          │             │ CommitBroadcast (bincode)            │
//! └──────────┴─────────────┴──────────────────────────────────────┘
//! ```
//!
//! The transport relays envelopes; the engine never looks at sockets.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::change::Change;
use crate::presence::Presence;
use crate::vcs::{BranchId, Commit};

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// A change as applied by the engine
    Change = 1,
    /// Presence upsert or leave
    Presence = 2,
    /// A new commit on a branch
    Commit = 3,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Change => "change",
            MessageKind::Presence => "presence",
            MessageKind::Commit => "commit",
        }
    }
}

/// Payload of a `change` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBroadcast {
    pub branch: BranchId,
    /// Branch version after the change
    pub version: u64,
    pub change: Change,
}

/// Payload of a `presence` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub presence: Presence,
    /// The user left explicitly
    pub left: bool,
}

/// Payload of a `commit` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitBroadcast {
    pub branch: BranchId,
    pub commit: Commit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub document_id: Uuid,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn change(document_id: Uuid, update: &ChangeBroadcast) -> Result<Self, ProtocolError> {
        Self::wrap(MessageKind::Change, document_id, update)
    }

    pub fn presence(document_id: Uuid, update: &PresenceUpdate) -> Result<Self, ProtocolError> {
        Self::wrap(MessageKind::Presence, document_id, update)
    }

    pub fn commit(document_id: Uuid, update: &CommitBroadcast) -> Result<Self, ProtocolError> {
        Self::wrap(MessageKind::Commit, document_id, update)
    }

    fn wrap<T: Serialize>(
        kind: MessageKind,
        document_id: Uuid,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(body, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind,
            document_id,
            payload,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(envelope)
    }

    pub fn change_payload(&self) -> Result<ChangeBroadcast, ProtocolError> {
        self.unwrap_as(MessageKind::Change)
    }

    pub fn presence_payload(&self) -> Result<PresenceUpdate, ProtocolError> {
        self.unwrap_as(MessageKind::Presence)
    }

    pub fn commit_payload(&self) -> Result<CommitBroadcast, ProtocolError> {
        self.unwrap_as(MessageKind::Commit)
    }

    fn unwrap_as<T: DeserializeOwned>(&self, kind: MessageKind) -> Result<T, ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::InvalidMessageType {
                expected: kind,
                found: self.kind,
            });
        }
        let (body, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(body)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType {
        expected: MessageKind,
        found: MessageKind,
    },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType { expected, found } => write!(
                f,
                "Invalid message type: expected {}, got {}",
                expected.as_str(),
                found.as_str()
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{Cursor, PresenceStatus};
    use serde_json::json;

    #[test]
    fn test_change_envelope_roundtrip() {
        let doc = Uuid::new_v4();
        let update = ChangeBroadcast {
            branch: BranchId::main(),
            version: 7,
            change: Change::modify("alice", 6, "meta/title", json!({"text": "Draft"})),
        };
        let bytes = Envelope::change(doc, &update).unwrap().encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, MessageKind::Change);
        assert_eq!(decoded.document_id, doc);
        assert_eq!(decoded.change_payload().unwrap(), update);
    }

    #[test]
    fn test_payload_kind_checked() {
        let presence = Presence {
            user_id: "bob".into(),
            cursor: Cursor::at("body", 3),
            status: PresenceStatus::Active,
            last_seen: 1,
        };
        let envelope = Envelope::presence(
            Uuid::new_v4(),
            &PresenceUpdate {
                presence,
                left: false,
            },
        )
        .unwrap();
        assert_eq!(
            envelope.commit_payload(),
            Err(ProtocolError::InvalidMessageType {
                expected: MessageKind::Commit,
                found: MessageKind::Presence,
            })
        );
        assert!(!envelope.presence_payload().unwrap().left);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Envelope::decode(&[0xff, 0xff, 0xff]),
            Err(ProtocolError::DeserializationError(_))
        ));
    }
}
