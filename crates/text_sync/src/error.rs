//! Error types for the text synchronization crate.

use crate::persistence::StorageError;
use crate::replica::PositionId;
use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for synchronization operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can occur while editing or synchronizing a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// A remote operation failed validation and was rejected.
    #[error("Malformed operation {id}: {reason}")]
    MalformedOperation { id: PositionId, reason: String },

    /// An update payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A visible offset lies past the end of the document.
    #[error("Offset {offset} out of bounds for document of length {len}")]
    OutOfBounds { offset: usize, len: usize },

    /// A delete range is inverted or extends past the end of the document.
    #[error("Invalid range {start}..{end} for document of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    /// The peer is not known to this session.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// A peer announced itself on a different session channel.
    #[error("Channel mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: String, actual: String },

    /// The transport substrate failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The persistence collaborator failed.
    #[error(transparent)]
    Persistence(#[from] StorageError),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The document was already seeded from a snapshot.
    #[error("Document has already been seeded")]
    AlreadySeeded,

    /// The session task has stopped.
    #[error("Session closed")]
    SessionClosed,
}

impl CollabError {
    /// Build a [`CollabError::MalformedOperation`].
    pub fn malformed(id: PositionId, reason: impl Into<String>) -> Self {
        Self::MalformedOperation {
            id,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
