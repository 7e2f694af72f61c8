//! Update codec: serializes operation batches and computes catch-up diffs.
//!
//! Updates travel as a versioned JSON envelope:
//!
//! ```json
//! {"v":1,"ops":[{"type":"insert","id":{"replica":7,"counter":1},"content":"hi"}]}
//! ```
//!
//! A record that fails to parse, carries an unknown version, or contains an
//! operation of unknown type is rejected as a whole.

use crate::error::{CollabError, CollabResult};
use crate::operation::Operation;
use crate::state_vector::StateVector;
use crate::text_store::TextStore;
use serde::{Deserialize, Serialize};

/// Current envelope version.
pub const UPDATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct UpdateRef<'a> {
    v: u32,
    ops: &'a [Operation],
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateRecord {
    v: u32,
    ops: Vec<Operation>,
}

/// Encode a batch of operations.
pub fn encode(ops: &[Operation]) -> CollabResult<Vec<u8>> {
    let record = UpdateRef {
        v: UPDATE_VERSION,
        ops,
    };
    Ok(serde_json::to_vec(&record)?)
}

/// Decode a batch of operations.
pub fn decode(bytes: &[u8]) -> CollabResult<Vec<Operation>> {
    let record: UpdateRecord = serde_json::from_slice(bytes)?;
    if record.v != UPDATE_VERSION {
        return Err(CollabError::Codec(format!(
            "unsupported update version {}",
            record.v
        )));
    }
    Ok(record.ops)
}

/// State vector of everything `store` has integrated.
pub fn compute_state_vector(store: &TextStore) -> StateVector {
    store.state_vector().clone()
}

/// Encoded update holding exactly the operations `peer` has not seen.
pub fn diff_since(store: &TextStore, peer: &StateVector) -> CollabResult<Vec<u8>> {
    encode(&store.operations_since(peer))
}

/// Element-wise maximum of two state vectors.
pub fn merge_state_vectors(a: &StateVector, b: &StateVector) -> StateVector {
    let mut merged = a.clone();
    merged.merge(b);
    merged
}
