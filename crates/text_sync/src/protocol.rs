//! Peer-to-peer session protocol.
//!
//! Messages are JSON objects tagged by `type`. Update payloads are the bytes
//! produced by [`crate::codec`], carried as base64 strings.
//!
//! Joining a session is a two-step exchange run by both sides of a link:
//!
//! 1. `hello` names the session channel and the sender's replica.
//! 2. `sync_step1` carries the sender's state vector.
//! 3. The receiver answers with `sync_step2`, holding exactly the operations
//!    the sender lacks.
//!
//! After that, live edits flow as `update` messages and presence as
//! `awareness` messages.

use crate::awareness::AwarenessUpdate;
use crate::error::{CollabError, CollabResult};
use crate::replica::ReplicaId;
use crate::state_vector::StateVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message exchanged between session peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// First message on every link.
    Hello { channel: String, replica: ReplicaId },

    /// "This is what I have."
    SyncStep1 {
        #[serde(rename = "stateVector")]
        state_vector: StateVector,
    },

    /// "Here is what you are missing."
    SyncStep2 {
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },

    /// Live operations.
    Update {
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },

    /// Presence states.
    Awareness { updates: Vec<AwarenessUpdate> },
}

impl PeerMessage {
    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> CollabResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> CollabResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::SyncStep1 { .. } => "sync_step1",
            PeerMessage::SyncStep2 { .. } => "sync_step2",
            PeerMessage::Update { .. } => "update",
            PeerMessage::Awareness { .. } => "awareness",
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

/// Name of the channel a document's peers meet on.
///
/// Derived from the document id and a shared secret, so only participants
/// holding the secret land in the same session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionName {
    document_id: String,
    channel: String,
}

impl SessionName {
    /// Derive the channel `"{prefix}-{document_id}-{scope}"`.
    pub fn derive(prefix: &str, document_id: &str, secret: &str) -> Self {
        let scope = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{document_id}:{secret}").as_bytes(),
        );
        Self {
            document_id: document_id.to_string(),
            channel: format!("{prefix}-{document_id}-{}", scope.simple()),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn as_str(&self) -> &str {
        &self.channel
    }

    /// Check a channel announced by a peer.
    pub fn verify(&self, announced: &str) -> CollabResult<()> {
        if announced == self.channel {
            Ok(())
        } else {
            Err(CollabError::ChannelMismatch {
                expected: self.channel.clone(),
                actual: announced.to_string(),
            })
        }
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)
    }
}
