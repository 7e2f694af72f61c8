//! Peer-to-peer synchronization for collaboratively edited plain text.
//!
//! Every participant keeps a full replica of the document in a sequence CRDT
//! and exchanges operations directly with the other participants. Replicas
//! converge regardless of delivery order, duplication or temporary
//! disconnection.
//!
//! # Modules
//!
//! - `replica`: Replica and per-character position identifiers
//! - `operation`: Insert and delete operations exchanged between replicas
//! - `text_store`: The sequence CRDT holding the text
//! - `state_vector`: Per-replica summary of integrated operations
//! - `codec`: Update encoding and state-vector diffs
//! - `buffer`: Causal buffer for operations that arrive early
//! - `awareness`: Ephemeral presence (names, colours, cursors)
//! - `binding`: Adapter between an editor widget and the text store
//! - `protocol`: Peer messages and session naming
//! - `peer`: Per-peer connection state machine
//! - `coordinator`: Synchronous core of a document session
//! - `session`: Tokio task driving a coordinator, and its handle
//! - `transport`: Transport abstraction with in-memory and WebSocket backends
//! - `persistence`: Snapshot storage collaborator
//! - `config`: Session tunables
//! - `error`: Error types for the crate
//!
//! # Example
//!
//! ```
//! use text_sync::codec;
//! use text_sync::replica::ReplicaId;
//! use text_sync::text_store::TextStore;
//!
//! let mut alice = TextStore::new(ReplicaId::new(1));
//! let mut bob = TextStore::new(ReplicaId::new(2));
//!
//! alice.apply_local_insert(0, "hello").unwrap();
//! bob.apply_local_insert(0, "hi ").unwrap();
//!
//! // Exchange whatever the other side is missing
//! let to_bob = codec::diff_since(&alice, bob.state_vector()).unwrap();
//! let to_alice = codec::diff_since(&bob, alice.state_vector()).unwrap();
//! for op in codec::decode(&to_bob).unwrap() {
//!     bob.apply_remote_operation(&op).unwrap();
//! }
//! for op in codec::decode(&to_alice).unwrap() {
//!     alice.apply_remote_operation(&op).unwrap();
//! }
//!
//! assert_eq!(alice.render_visible_text(), bob.render_visible_text());
//! ```

pub mod awareness;
pub mod binding;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod operation;
pub mod peer;
pub mod persistence;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod state_vector;
pub mod text_store;
pub mod transport;

// Re-export commonly used types
pub use awareness::{AwarenessChange, AwarenessRegistry, AwarenessUpdate, Collaborator, Presence};
pub use binding::{EditorBinding, EditorEvent, EditorSink, PresenceMarker, Selection};
pub use buffer::{CausalBuffer, IntegrationReport, StaleGap};
pub use config::{BackoffConfig, SessionConfig};
pub use coordinator::{Outbound, SessionEvent, SyncCoordinator};
pub use error::{CollabError, CollabResult};
pub use operation::Operation;
pub use peer::{PeerConnection, PeerState};
pub use persistence::{
    DocumentSnapshot, FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StorageError,
};
pub use protocol::{PeerMessage, SessionName};
pub use replica::{PositionId, ReplicaId};
pub use session::{DocumentSession, LocalIdentity, SessionHandle, SessionOptions};
pub use state_vector::StateVector;
pub use text_store::{ApplyOutcome, CursorAnchor, TextChange, TextStore};
pub use transport::{PeerAddress, Transport, TransportError, TransportEvent};
