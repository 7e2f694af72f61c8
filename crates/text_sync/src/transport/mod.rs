//! Transport substrate abstraction.
//!
//! A transport moves opaque byte messages between peer endpoints and reports
//! peers appearing and disappearing. The session never assumes more than
//! per-link FIFO delivery; ordering across links, duplication and loss are
//! all handled above this layer.

pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryNetwork, MemoryTransport, SentMessage};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

/// Address of a peer endpoint as understood by its transport.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Something the transport observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer opened a link to us.
    PeerJoined(PeerAddress),
    /// A link went away, for whatever reason.
    PeerLeft(PeerAddress),
    /// Bytes arrived on a link.
    Message { from: PeerAddress, bytes: Vec<u8> },
}

/// Stream of events a transport delivers to its session.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport failures. All of them are treated as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// No open link to the peer.
    #[error("Not connected to peer: {0}")]
    NotConnected(String),

    /// The transport has shut down.
    #[error("Transport closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Byte transport between session peers.
///
/// A successful `connect` means the link is up on our side; the remote side
/// learns about it through [`TransportEvent::PeerJoined`].
#[trait_variant::make(Send)]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to `peer`. Connecting to an already linked peer succeeds.
    async fn connect(&self, peer: &PeerAddress) -> Result<(), TransportError>;

    /// Queue `bytes` for delivery to `peer`.
    async fn send(&self, peer: &PeerAddress, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close the link to `peer`, if any.
    async fn disconnect(&self, peer: &PeerAddress);

    /// Address other peers use to reach this endpoint.
    fn local_address(&self) -> PeerAddress;
}
