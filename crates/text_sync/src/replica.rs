//! Replica identity and the per-replica logical clock.
//!
//! Every character ever inserted into a document is named by a [`PositionId`]:
//! the replica that created it plus that replica's counter at creation time.
//! Counters of a single replica are contiguous, which lets a state vector
//! summarize everything integrated from that replica with one number.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one participant in one editing session.
///
/// Replica ids are used for:
/// - Naming the origin of every operation
/// - Breaking ties between concurrent inserts at the same position
/// - Keying state vectors and awareness entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// The reserved "no replica" value. Never generated.
    pub const NONE: ReplicaId = ReplicaId(0);

    /// Create a ReplicaId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generate a fresh random replica id for a new session.
    pub fn generate() -> Self {
        loop {
            let candidate = (Uuid::new_v4().as_u128() >> 64) as u64;
            if candidate != 0 {
                return Self(candidate);
            }
        }
    }

    /// Deterministic replica id used when seeding a document from a snapshot.
    ///
    /// Replicas seeding identical content produce identical items, so the
    /// seed integrates once no matter how many participants perform it.
    pub fn for_snapshot(content: &str) -> Self {
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes());
        let value = (uuid.as_u128() >> 64) as u64;
        Self(value.max(1))
    }

    /// Get the raw u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether this is the reserved [`ReplicaId::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replica({:x})", self.0)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ReplicaId> for u64 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

/// Globally unique, immutable name of one inserted character (or of one
/// delete operation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionId {
    /// The replica that created the item
    pub replica: ReplicaId,
    /// The replica's counter at creation, starting at 1
    pub counter: u64,
}

impl PositionId {
    /// Create a new PositionId.
    pub fn new(replica: impl Into<ReplicaId>, counter: u64) -> Self {
        Self {
            replica: replica.into(),
            counter,
        }
    }

    /// The id `offset` counters after this one on the same replica.
    pub fn advance(&self, offset: u64) -> Self {
        Self {
            replica: self.replica,
            counter: self.counter + offset,
        }
    }

    /// The id immediately preceding this one on the same replica, if any.
    pub fn predecessor(&self) -> Option<Self> {
        (self.counter > 1).then(|| Self {
            replica: self.replica,
            counter: self.counter - 1,
        })
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({:x}, {})", self.replica.0, self.counter)
    }
}

impl PartialOrd for PositionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PositionId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Counter first, replica breaks ties
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.replica.cmp(&other.replica),
            ord => ord,
        }
    }
}

/// Monotonic counter stamping local operations of one replica.
#[derive(Debug, Clone)]
pub struct ReplicaClock {
    replica: ReplicaId,
    counter: u64,
}

impl ReplicaClock {
    /// Create a clock that has not yet issued any id.
    pub fn new(replica: ReplicaId) -> Self {
        Self { replica, counter: 0 }
    }

    /// The replica this clock stamps for.
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Highest counter issued so far (0 if none).
    pub fn current(&self) -> u64 {
        self.counter
    }

    /// Reserve `count` consecutive counters and return the first id.
    pub fn reserve(&mut self, count: u64) -> PositionId {
        let first = PositionId::new(self.replica, self.counter + 1);
        self.counter += count;
        first
    }

    /// Reserve a single counter.
    pub fn tick(&mut self) -> PositionId {
        self.reserve(1)
    }

    /// Fast-forward after integrating this replica's own history from elsewhere
    /// (e.g. a restored snapshot).
    pub fn observe(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_creation() {
        let id = ReplicaId::new(42);
        assert_eq!(id.value(), 42);
        assert!(!id.is_none());
        assert!(ReplicaId::NONE.is_none());
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = ReplicaId::generate();
        let b = ReplicaId::generate();
        assert_ne!(a, b);
        assert!(!a.is_none());
    }

    #[test]
    fn test_snapshot_replica_is_deterministic() {
        assert_eq!(
            ReplicaId::for_snapshot("fn main() {}"),
            ReplicaId::for_snapshot("fn main() {}")
        );
        assert_ne!(
            ReplicaId::for_snapshot("fn main() {}"),
            ReplicaId::for_snapshot("fn main() { }")
        );
    }

    #[test]
    fn test_position_id_ordering() {
        let p1 = PositionId::new(1, 1);
        let p2 = PositionId::new(2, 1);
        let p3 = PositionId::new(1, 2);

        // Same counter, replica breaks the tie
        assert!(p1 < p2);
        // Counter takes priority
        assert!(p1 < p3);
        assert!(p2 < p3);
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(PositionId::new(3, 1).predecessor(), None);
        assert_eq!(
            PositionId::new(3, 5).predecessor(),
            Some(PositionId::new(3, 4))
        );
        assert_eq!(PositionId::new(3, 5).advance(2), PositionId::new(3, 7));
    }

    #[test]
    fn test_clock_reserves_contiguous_ranges() {
        let mut clock = ReplicaClock::new(ReplicaId(7));
        assert_eq!(clock.reserve(5), PositionId::new(7, 1));
        assert_eq!(clock.tick(), PositionId::new(7, 6));
        assert_eq!(clock.current(), 6);

        clock.observe(3);
        assert_eq!(clock.current(), 6);
        clock.observe(10);
        assert_eq!(clock.tick(), PositionId::new(7, 11));
    }
}
