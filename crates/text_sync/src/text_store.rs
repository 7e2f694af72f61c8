//! Sequence CRDT holding the replicated text of one document.
//!
//! The store provides:
//! - Local insert/delete at visible offsets, producing [`Operation`]s
//! - Idempotent, order-independent integration of remote operations
//! - Deterministic conflict resolution for concurrent inserts at one position
//!
//! # Algorithm Overview
//!
//! Every character is an item carrying its [`PositionId`], the id of the item
//! that was immediately to its left when it was created (left origin) and the
//! id of the item immediately to its right (right origin). Deleted items stay
//! in the sequence as tombstones so later operations can still reference them.
//!
//! A new item is integrated by scanning rightwards from its left origin
//! towards its right origin. Items found there that were created concurrently
//! with the same origins are ordered by `(counter, replica)`, lowest first;
//! items anchored further right with the same left origin are skipped over as
//! a block. The resulting order depends only on the set of items, never on
//! arrival order, so all replicas converge.

use crate::error::{CollabError, CollabResult};
use crate::operation::Operation;
use crate::replica::{PositionId, ReplicaClock, ReplicaId};
use crate::state_vector::StateVector;
use serde::{Deserialize, Serialize};

/// One character in the sequence, live or tombstoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextItem {
    pub id: PositionId,
    pub content: char,
    pub left_origin: Option<PositionId>,
    pub right_origin: Option<PositionId>,
    pub deleted: bool,
}

/// A visible change produced by integrating an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TextChange {
    /// `text` now starts at visible `offset`.
    Inserted { offset: usize, text: String },
    /// `len` characters starting at visible `offset` were removed.
    Deleted { offset: usize, len: usize },
}

/// Result of integrating a remote operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Integrated; carries the visible changes (possibly none).
    Applied(Vec<TextChange>),
    /// Already integrated earlier. Nothing changed.
    Duplicate,
    /// A causal dependency is missing; retry once it has been integrated.
    NotReady(PositionId),
}

/// A cursor position that survives concurrent edits.
///
/// Anchored to the character on the caret's left, or to the start of the
/// document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorAnchor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<PositionId>,
}

/// Replicated text for one document on one replica.
#[derive(Clone, Debug)]
pub struct TextStore {
    clock: ReplicaClock,
    items: Vec<TextItem>,
    state_vector: StateVector,
    /// Every integrated operation, in integration order
    history: Vec<Operation>,
    visible_len: usize,
    seeded: bool,
}

impl TextStore {
    /// Create an empty store for a replica.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            clock: ReplicaClock::new(replica),
            items: Vec::new(),
            state_vector: StateVector::new(),
            history: Vec::new(),
            visible_len: 0,
            seeded: false,
        }
    }

    /// The replica that authors local operations.
    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    /// Highest contiguous counter integrated per replica.
    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// All integrated operations, in causal order.
    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    /// Items in document order, including tombstones.
    pub fn items(&self) -> &[TextItem] {
        &self.items
    }

    pub fn tombstone_count(&self) -> usize {
        self.items.len() - self.visible_len
    }

    /// Whether a character with this id has been integrated.
    pub fn contains(&self, id: PositionId) -> bool {
        self.find(id).is_some()
    }

    /// Whether [`TextStore::seed`] has run on this store.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// The visible text.
    pub fn render_visible_text(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.content)
            .collect()
    }

    /// Operations whose counters are not covered by `peer`, in causal order.
    pub fn operations_since(&self, peer: &StateVector) -> Vec<Operation> {
        self.history
            .iter()
            .filter(|op| op.last_id().counter > peer.get(op.id().replica))
            .cloned()
            .collect()
    }

    // ========== Local edits ==========

    /// Insert `content` so that it starts at visible `index`.
    pub fn apply_local_insert(&mut self, index: usize, content: &str) -> CollabResult<Operation> {
        if index > self.visible_len {
            return Err(CollabError::OutOfBounds {
                offset: index,
                len: self.visible_len,
            });
        }
        let span = content.chars().count() as u64;
        if span == 0 {
            return Err(CollabError::InvalidRange {
                start: index,
                end: index,
                len: self.visible_len,
            });
        }

        let raw = self.raw_index_for_insert(index);
        let left_origin = raw.checked_sub(1).map(|i| self.items[i].id);
        let right_origin = self.items.get(raw).map(|item| item.id);
        let id = self.clock.reserve(span);

        let op = Operation::Insert {
            id,
            content: content.to_string(),
            left_origin,
            right_origin,
        };
        self.integrate_insert(id, content, left_origin, right_origin);
        self.record(op.clone());
        Ok(op)
    }

    /// Delete the visible range `start..end`, one operation per character.
    pub fn apply_local_delete(&mut self, start: usize, end: usize) -> CollabResult<Vec<Operation>> {
        if start > end || end > self.visible_len {
            return Err(CollabError::InvalidRange {
                start,
                end,
                len: self.visible_len,
            });
        }

        let targets: Vec<PositionId> = self
            .items
            .iter()
            .filter(|item| !item.deleted)
            .skip(start)
            .take(end - start)
            .map(|item| item.id)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let id = self.clock.tick();
            self.tombstone(target);
            let op = Operation::Delete { id, target };
            self.record(op.clone());
            ops.push(op);
        }
        Ok(ops)
    }

    // ========== Remote integration ==========

    /// Integrate an operation authored elsewhere.
    ///
    /// Re-applying an integrated operation is a no-op. An operation whose
    /// predecessor, origins or target are unknown is reported as
    /// [`ApplyOutcome::NotReady`] and leaves the store untouched.
    pub fn apply_remote_operation(&mut self, op: &Operation) -> CollabResult<ApplyOutcome> {
        let id = op.id();
        if id.replica.is_none() || id.counter == 0 {
            return Err(CollabError::malformed(id, "reserved replica or zero counter"));
        }
        if op.span() == 0 {
            return Err(CollabError::malformed(id, "empty insert"));
        }
        if self.state_vector.contains(id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if let Some(missing) = op
            .dependencies()
            .into_iter()
            .find(|dep| !self.state_vector.contains(*dep))
        {
            return Ok(ApplyOutcome::NotReady(missing));
        }

        let changes = match op {
            Operation::Insert {
                content,
                left_origin,
                right_origin,
                ..
            } => {
                for origin in left_origin.iter().chain(right_origin.iter()) {
                    if !self.contains(*origin) {
                        return Err(CollabError::malformed(
                            id,
                            format!("origin {origin} is not a character"),
                        ));
                    }
                }
                vec![self.integrate_insert(id, content, *left_origin, *right_origin)]
            }
            Operation::Delete { target, .. } => {
                if !self.contains(*target) {
                    return Err(CollabError::malformed(
                        id,
                        format!("target {target} is not a character"),
                    ));
                }
                self.tombstone(*target).into_iter().collect()
            }
        };

        if id.replica == self.replica() {
            self.clock.observe(op.last_id().counter);
        }
        self.record(op.clone());
        Ok(ApplyOutcome::Applied(changes))
    }

    /// Seed the document with snapshot content.
    ///
    /// The seed is authored by a replica derived from the content itself, so
    /// every participant seeding the same snapshot creates the same items and
    /// the seed integrates once. Only a store that has never integrated an
    /// operation can be seeded.
    pub fn seed(&mut self, content: &str) -> CollabResult<Option<Operation>> {
        if self.seeded || !self.history.is_empty() {
            return Err(CollabError::AlreadySeeded);
        }
        self.seeded = true;
        if content.is_empty() {
            return Ok(None);
        }

        let op = Operation::Insert {
            id: PositionId::new(ReplicaId::for_snapshot(content), 1),
            content: content.to_string(),
            left_origin: None,
            right_origin: None,
        };
        self.apply_remote_operation(&op)?;
        Ok(Some(op))
    }

    // ========== Cursor anchors ==========

    /// Anchor for a caret at visible `offset` (clamped to the document).
    pub fn anchor_at(&self, offset: usize) -> CursorAnchor {
        let Some(index) = offset.min(self.visible_len).checked_sub(1) else {
            return CursorAnchor::default();
        };
        let after = self
            .items
            .iter()
            .filter(|item| !item.deleted)
            .nth(index)
            .map(|item| item.id);
        CursorAnchor { after }
    }

    /// Current visible offset of an anchor, or `None` if its character is
    /// unknown here.
    pub fn resolve_anchor(&self, anchor: &CursorAnchor) -> Option<usize> {
        let Some(id) = anchor.after else {
            return Some(0);
        };
        let index = self.find(id)?;
        let before = self.visible_offset(index);
        Some(if self.items[index].deleted { before } else { before + 1 })
    }

    // ========== Internals ==========

    fn find(&self, id: PositionId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// Number of visible items before raw `index`.
    fn visible_offset(&self, index: usize) -> usize {
        self.items[..index].iter().filter(|item| !item.deleted).count()
    }

    /// Raw index at which text inserted at visible `index` goes: just before
    /// the `index`-th visible item, after any tombstones preceding it.
    fn raw_index_for_insert(&self, index: usize) -> usize {
        let mut remaining = index;
        for (raw, item) in self.items.iter().enumerate() {
            if item.deleted {
                continue;
            }
            if remaining == 0 {
                return raw;
            }
            remaining -= 1;
        }
        self.items.len()
    }

    fn record(&mut self, op: Operation) {
        self.state_vector.observe(op.last_id());
        self.history.push(op);
    }

    fn tombstone(&mut self, target: PositionId) -> Option<TextChange> {
        let index = self.find(target)?;
        if self.items[index].deleted {
            return None;
        }
        self.items[index].deleted = true;
        self.visible_len -= 1;
        Some(TextChange::Deleted {
            offset: self.visible_offset(index),
            len: 1,
        })
    }

    fn integrate_insert(
        &mut self,
        id: PositionId,
        content: &str,
        left_origin: Option<PositionId>,
        right_origin: Option<PositionId>,
    ) -> TextChange {
        let mut left = left_origin;
        let mut first_index = None;
        for (offset, ch) in content.chars().enumerate() {
            let item = TextItem {
                id: id.advance(offset as u64),
                content: ch,
                left_origin: left,
                right_origin,
                deleted: false,
            };
            left = Some(item.id);
            let index = self.integrate_item(item);
            first_index.get_or_insert(index);
        }

        let span = content.chars().count();
        self.visible_len += span;
        TextChange::Inserted {
            offset: first_index.map_or(0, |index| self.visible_offset(index)),
            text: content.to_string(),
        }
    }

    /// Place one item among its concurrent siblings and return its raw index.
    fn integrate_item(&mut self, item: TextItem) -> usize {
        let len = self.items.len();
        let left = self.origin_index(item.left_origin, -1);
        let right = self.origin_index(item.right_origin, len as isize);

        let mut dest = (left + 1) as usize;
        let mut scanning = false;
        let mut i = dest;
        loop {
            if !scanning {
                dest = i;
            }
            if i == len || i as isize == right {
                break;
            }

            let other = &self.items[i];
            let other_left = self.origin_index(other.left_origin, -1);
            let other_right = self.origin_index(other.right_origin, len as isize);

            if other_left < left {
                break;
            } else if other_left == left {
                if other_right < right {
                    // Sibling anchored inside our range: tentatively skip it
                    scanning = true;
                } else if other_right == right {
                    if item.id < other.id {
                        break;
                    }
                    scanning = false;
                } else {
                    scanning = false;
                }
            }
            i += 1;
        }

        self.items.insert(dest, item);
        dest
    }

    fn origin_index(&self, origin: Option<PositionId>, absent: isize) -> isize {
        origin
            .and_then(|id| self.find(id))
            .map_or(absent, |index| index as isize)
    }
}
