//! Causal buffer for remote operations that arrive ahead of their dependencies.
//!
//! Operations are parked under the id they are waiting for. Whenever an
//! operation integrates, everything parked under the ids it created is
//! retried, breadth-first, until no further progress is possible.

use crate::error::CollabError;
use crate::operation::Operation;
use crate::replica::PositionId;
use crate::text_store::{ApplyOutcome, TextChange, TextStore};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PendingOp {
    op: Operation,
    queued_at: Instant,
    warned: bool,
}

/// A dependency that has been missing for longer than the warning threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleGap {
    /// The id nothing has supplied yet
    pub missing: PositionId,
    /// The blocked operation
    pub blocked: PositionId,
    pub waited: Duration,
}

/// What a call to [`CausalBuffer::integrate`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrationReport {
    /// Visible changes, in application order
    pub changes: Vec<TextChange>,
    /// Operations integrated (including ones released from the buffer)
    pub applied: usize,
    pub duplicates: usize,
    /// Operations parked in this call
    pub buffered: usize,
    pub rejected: Vec<CollabError>,
}

/// Operations waiting on a missing causal dependency.
#[derive(Debug, Default)]
pub struct CausalBuffer {
    waiting: HashMap<PositionId, Vec<PendingOp>>,
    queued: usize,
}

impl CausalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parked operations.
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Ids currently being waited for.
    pub fn missing(&self) -> impl Iterator<Item = PositionId> + '_ {
        self.waiting.keys().copied()
    }

    /// Park `op` until `missing` has been integrated.
    pub fn push(&mut self, missing: PositionId, op: Operation, now: Instant) {
        let bucket = self.waiting.entry(missing).or_default();
        if bucket.iter().any(|pending| pending.op.id() == op.id()) {
            return;
        }
        bucket.push(PendingOp {
            op,
            queued_at: now,
            warned: false,
        });
        self.queued += 1;
    }

    /// Remove and return every operation waiting on one of `created`.
    pub fn release(&mut self, created: impl IntoIterator<Item = PositionId>) -> Vec<Operation> {
        let mut released = Vec::new();
        for id in created {
            if let Some(bucket) = self.waiting.remove(&id) {
                self.queued -= bucket.len();
                released.extend(bucket.into_iter().map(|pending| pending.op));
            }
        }
        released
    }

    /// Integrate `ops` into `store`, parking the ones that are not ready and
    /// draining whatever their integration unblocks.
    pub fn integrate(
        &mut self,
        store: &mut TextStore,
        ops: impl IntoIterator<Item = Operation>,
        now: Instant,
    ) -> IntegrationReport {
        let mut report = IntegrationReport::default();
        let mut queue: VecDeque<Operation> = ops.into_iter().collect();

        while let Some(op) = queue.pop_front() {
            match store.apply_remote_operation(&op) {
                Ok(ApplyOutcome::Applied(changes)) => {
                    report.applied += 1;
                    report.changes.extend(changes);
                    queue.extend(self.release(op.created_ids()));
                }
                Ok(ApplyOutcome::Duplicate) => report.duplicates += 1,
                Ok(ApplyOutcome::NotReady(missing)) => {
                    tracing::debug!(op = %op.id(), %missing, "buffering operation");
                    self.push(missing, op, now);
                    report.buffered += 1;
                }
                Err(err) => {
                    tracing::warn!(op = %op.id(), error = %err, "rejected remote operation");
                    report.rejected.push(err);
                }
            }
        }
        report
    }

    /// Gaps older than `threshold` that have not been reported yet.
    ///
    /// Each blocked operation is reported at most once.
    pub fn stale_gaps(&mut self, now: Instant, threshold: Duration) -> Vec<StaleGap> {
        let mut stale = Vec::new();
        for (missing, bucket) in self.waiting.iter_mut() {
            for pending in bucket.iter_mut().filter(|p| !p.warned) {
                let waited = now.saturating_duration_since(pending.queued_at);
                if waited >= threshold {
                    pending.warned = true;
                    stale.push(StaleGap {
                        missing: *missing,
                        blocked: pending.op.id(),
                        waited,
                    });
                }
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaId;

    fn author_ops() -> Vec<Operation> {
        let mut author = TextStore::new(ReplicaId(1));
        author.apply_local_insert(0, "ab").unwrap();
        author.apply_local_insert(2, "c").unwrap();
        author.apply_local_delete(0, 1).unwrap();
        author.history().to_vec()
    }

    #[test]
    fn test_reverse_delivery_converges() {
        let ops = author_ops();
        let mut store = TextStore::new(ReplicaId(2));
        let mut buffer = CausalBuffer::new();
        let now = Instant::now();

        let report = buffer.integrate(&mut store, ops.iter().rev().cloned(), now);
        assert_eq!(report.applied, 3);
        assert_eq!(report.buffered, 2);
        assert!(buffer.is_empty());
        assert_eq!(store.render_visible_text(), "bc");
    }

    #[test]
    fn test_delete_waits_for_insert() {
        let ops = author_ops();
        let mut store = TextStore::new(ReplicaId(2));
        let mut buffer = CausalBuffer::new();
        let now = Instant::now();

        // The delete depends on both its predecessor and its target
        let report = buffer.integrate(&mut store, vec![ops[2].clone()], now);
        assert_eq!(report.buffered, 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(store.render_visible_text(), "");

        let report = buffer.integrate(&mut store, ops[..2].to_vec(), now);
        assert_eq!(report.applied, 3);
        assert!(buffer.is_empty());
        assert_eq!(store.render_visible_text(), "bc");
    }

    #[test]
    fn test_duplicate_push_is_ignored() {
        let ops = author_ops();
        let mut buffer = CausalBuffer::new();
        let now = Instant::now();
        buffer.push(PositionId::new(1, 2), ops[1].clone(), now);
        buffer.push(PositionId::new(1, 2), ops[1].clone(), now);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.missing().collect::<Vec<_>>(), vec![PositionId::new(1, 2)]);
    }

    #[test]
    fn test_stale_gaps_reported_once() {
        let ops = author_ops();
        let mut buffer = CausalBuffer::new();
        let start = Instant::now();
        buffer.push(PositionId::new(1, 2), ops[1].clone(), start);

        let threshold = Duration::from_secs(60);
        assert!(buffer.stale_gaps(start + Duration::from_secs(10), threshold).is_empty());

        let gaps = buffer.stale_gaps(start + Duration::from_secs(61), threshold);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].missing, PositionId::new(1, 2));
        assert_eq!(gaps[0].blocked, PositionId::new(1, 3));

        assert!(buffer.stale_gaps(start + Duration::from_secs(120), threshold).is_empty());
        // Still parked, only the warning is suppressed
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_rejected_ops_do_not_stop_integration() {
        let mut ops = author_ops();
        let bad = Operation::Insert {
            id: PositionId::new(5, 1),
            content: String::new(),
            left_origin: None,
            right_origin: None,
        };
        ops.insert(0, bad);

        let mut store = TextStore::new(ReplicaId(2));
        let mut buffer = CausalBuffer::new();
        let report = buffer.integrate(&mut store, ops, Instant::now());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.applied, 3);
        assert_eq!(store.render_visible_text(), "bc");
    }
}
