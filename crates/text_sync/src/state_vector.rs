//! State vectors summarizing which operations a replica has integrated.

use crate::replica::{PositionId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map from replica to the highest contiguous counter integrated from it.
///
/// Because a replica's operations are only integrated in counter order, a
/// single number per replica is an exact description of what has been seen,
/// and the difference between two vectors is an exact set of missing
/// operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<String, u64>", try_from = "BTreeMap<String, u64>")]
pub struct StateVector {
    entries: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    /// Create a new empty state vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter integrated from `replica` (0 if none).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.entries.get(&replica).copied().unwrap_or(0)
    }

    /// Set the counter for a replica.
    pub fn set(&mut self, replica: ReplicaId, counter: u64) {
        if counter == 0 {
            self.entries.remove(&replica);
        } else {
            self.entries.insert(replica, counter);
        }
    }

    /// Record that everything up to and including `id` has been integrated.
    pub fn observe(&mut self, id: PositionId) {
        if id.counter > self.get(id.replica) {
            self.entries.insert(id.replica, id.counter);
        }
    }

    /// Whether the operation stamped `id` is already covered by this vector.
    pub fn contains(&self, id: PositionId) -> bool {
        id.counter <= self.get(id.replica)
    }

    /// Merge another vector into this one, taking the max of each entry.
    pub fn merge(&mut self, other: &StateVector) {
        for (&replica, &counter) in &other.entries {
            if counter > self.get(replica) {
                self.entries.insert(replica, counter);
            }
        }
    }

    /// Check if this vector dominates another (every entry >= the other's).
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .entries
            .iter()
            .all(|(&replica, &counter)| self.get(replica) >= counter)
    }

    /// Total number of operations counted by this vector.
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Check if the vector contains any entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of replicas tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns an iterator over all (replica, counter) pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }
}

// Keys travel as decimal strings so the vector can sit inside tagged
// messages, where integer map keys do not deserialize.
impl From<StateVector> for BTreeMap<String, u64> {
    fn from(sv: StateVector) -> Self {
        sv.entries
            .into_iter()
            .map(|(replica, counter)| (replica.value().to_string(), counter))
            .collect()
    }
}

impl TryFrom<BTreeMap<String, u64>> for StateVector {
    type Error = String;

    fn try_from(map: BTreeMap<String, u64>) -> Result<Self, Self::Error> {
        map.into_iter()
            .map(|(key, counter)| {
                key.parse::<u64>()
                    .map(|replica| (ReplicaId::new(replica), counter))
                    .map_err(|_| format!("invalid replica id {key:?}"))
            })
            .collect()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, counter) in iter {
            sv.set(replica, counter);
        }
        sv
    }
}
