//! Text CRDT operations.
//!
//! Operations reference positions only by [`PositionId`], never by offset, so
//! they can be integrated on any replica regardless of what else that replica
//! has seen concurrently.

use crate::replica::PositionId;
use serde::{Deserialize, Serialize};

/// A single replicated text mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Insert a run of characters.
    ///
    /// Character `i` of `content` is named `id.advance(i)`. The first character
    /// sits right of `left_origin`; each later character sits right of its
    /// predecessor in the run. All characters share `right_origin`.
    Insert {
        id: PositionId,
        content: String,
        #[serde(rename = "left", default, skip_serializing_if = "Option::is_none")]
        left_origin: Option<PositionId>,
        #[serde(rename = "right", default, skip_serializing_if = "Option::is_none")]
        right_origin: Option<PositionId>,
    },

    /// Tombstone one character.
    Delete {
        /// Stamp of the delete itself
        id: PositionId,
        /// The character being deleted
        target: PositionId,
    },
}

impl Operation {
    /// The stamp of this operation (first character id for an insert).
    pub fn id(&self) -> PositionId {
        match self {
            Operation::Insert { id, .. } => *id,
            Operation::Delete { id, .. } => *id,
        }
    }

    /// Number of counters this operation consumes.
    pub fn span(&self) -> u64 {
        match self {
            Operation::Insert { content, .. } => content.chars().count() as u64,
            Operation::Delete { .. } => 1,
        }
    }

    /// The last counter this operation consumes.
    pub fn last_id(&self) -> PositionId {
        self.id().advance(self.span().saturating_sub(1))
    }

    /// Every id this operation introduces once integrated.
    pub fn created_ids(&self) -> impl Iterator<Item = PositionId> + '_ {
        let first = self.id();
        (0..self.span()).map(move |offset| first.advance(offset))
    }

    /// Ids that must already be integrated before this operation can be,
    /// in the order they are checked.
    pub fn dependencies(&self) -> Vec<PositionId> {
        let mut deps: Vec<PositionId> = self.id().predecessor().into_iter().collect();
        match self {
            Operation::Insert {
                left_origin,
                right_origin,
                ..
            } => {
                deps.extend(left_origin.iter().copied());
                deps.extend(right_origin.iter().copied());
            }
            Operation::Delete { target, .. } => deps.push(*target),
        }
        deps
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_span_counts_chars() {
        let op = Operation::Insert {
            id: PositionId::new(1, 4),
            content: "héllo".to_string(),
            left_origin: None,
            right_origin: None,
        };
        assert_eq!(op.span(), 5);
        assert_eq!(op.last_id(), PositionId::new(1, 8));
        let ids: Vec<_> = op.created_ids().collect();
        assert_eq!(ids.first(), Some(&PositionId::new(1, 4)));
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_dependencies() {
        let op = Operation::Insert {
            id: PositionId::new(1, 4),
            content: "x".to_string(),
            left_origin: Some(PositionId::new(2, 1)),
            right_origin: None,
        };
        assert_eq!(
            op.dependencies(),
            vec![PositionId::new(1, 3), PositionId::new(2, 1)]
        );

        let del = Operation::Delete {
            id: PositionId::new(5, 1),
            target: PositionId::new(2, 1),
        };
        assert_eq!(del.dependencies(), vec![PositionId::new(2, 1)]);
        assert_eq!(del.span(), 1);
    }

    #[test]
    fn test_wire_tag() {
        let del = Operation::Delete {
            id: PositionId::new(5, 1),
            target: PositionId::new(2, 1),
        };
        let json = serde_json::to_value(&del).unwrap();
        assert_eq!(json["type"], "delete");

        let insert = Operation::Insert {
            id: PositionId::new(1, 1),
            content: "a".into(),
            left_origin: None,
            right_origin: None,
        };
        let json = serde_json::to_value(&insert).unwrap();
        assert_eq!(json["type"], "insert");
        assert!(json.get("left").is_none());
    }
}
