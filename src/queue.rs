//! Work Queue — coalescing, back-pressured root-key queue (spec.md §4.6).
//!
//! Grounded on `pg_trickle::scheduler`'s per-stream-table `HashMap` of
//! pending refresh state: there, each stream table's pending work
//! coalesces to "needs a refresh" (a boolean); here, each root primary key
//! coalesces to "needs a rebuild", carrying forward the highest
//! `cause_xid` observed so the Document Builder's checkpoint advance
//! reflects the latest change that enqueued it (spec.md §4.6, §4.7
//! last-writer-wins).

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

/// A coalesced unit of work: rebuild the document for `root_pk` in
/// `index`, caused by the source transaction `cause_xid` (the highest xid
/// observed across however many raw changes coalesced into this entry).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub index: String,
    pub root_pk: Vec<Value>,
    pub cause_xid: u32,
}

fn pk_key(root_pk: &[Value]) -> String {
    root_pk
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// FIFO-per-index coalescing queue with high/low water-mark back-pressure.
///
/// Enqueuing a root key already pending for the same index is a no-op on
/// ordering (the entry keeps its original queue position) but bumps
/// `cause_xid` forward if the new change is newer — the Document Builder
/// only ever needs to know the *latest* cause, not every intermediate one,
/// since it always rebuilds the row from current state (spec.md §4.5,
/// §4.6).
pub struct WorkQueue {
    high_water: usize,
    low_water: usize,
    order: VecDeque<(String, String)>, // (index, pk_key) in FIFO order
    pending: HashMap<(String, String), WorkItem>,
    paused: bool,
}

impl WorkQueue {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        assert!(low_water < high_water, "low_water must be below high_water");
        Self {
            high_water,
            low_water,
            order: VecDeque::new(),
            pending: HashMap::new(),
            paused: false,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether the Replication Consumer should halt cursor advance. Set
    /// once `len()` reaches `high_water`; cleared once `len()` drops to
    /// `low_water` or below (spec.md §4.6 back-pressure hysteresis).
    pub fn should_pause_intake(&mut self) -> bool {
        if !self.paused && self.order.len() >= self.high_water {
            self.paused = true;
        } else if self.paused && self.order.len() <= self.low_water {
            self.paused = false;
        }
        self.paused
    }

    /// Enqueue (or coalesce into an existing pending entry for) a root
    /// key change.
    pub fn enqueue(&mut self, index: impl Into<String>, root_pk: Vec<Value>, cause_xid: u32) {
        let index = index.into();
        let key = (index.clone(), pk_key(&root_pk));

        if let Some(existing) = self.pending.get_mut(&key) {
            if cause_xid > existing.cause_xid {
                existing.cause_xid = cause_xid;
            }
            return;
        }

        self.pending.insert(
            key.clone(),
            WorkItem {
                index,
                root_pk,
                cause_xid,
            },
        );
        self.order.push_back(key);
    }

    /// Dequeue up to `max` items, in FIFO order across the whole queue
    /// (not round-robin per index — the Document Builder batches by index
    /// internally after draining, spec.md §4.5).
    pub fn dequeue_batch(&mut self, max: usize) -> Vec<WorkItem> {
        let mut batch = Vec::with_capacity(max.min(self.order.len()));
        for _ in 0..max {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(item) = self.pending.remove(&key) {
                batch.push(item);
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enqueue_dequeue_fifo_order() {
        let mut q = WorkQueue::new(10, 2);
        q.enqueue("idx", vec![json!(1)], 100);
        q.enqueue("idx", vec![json!(2)], 101);
        let batch = q.dequeue_batch(10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].root_pk, vec![json!(1)]);
        assert_eq!(batch[1].root_pk, vec![json!(2)]);
    }

    #[test]
    fn test_repeated_enqueue_coalesces_and_keeps_fifo_position() {
        let mut q = WorkQueue::new(10, 2);
        q.enqueue("idx", vec![json!(1)], 100);
        q.enqueue("idx", vec![json!(2)], 101);
        q.enqueue("idx", vec![json!(1)], 150); // re-enqueue, should coalesce
        assert_eq!(q.len(), 2);
        let batch = q.dequeue_batch(10);
        assert_eq!(batch[0].root_pk, vec![json!(1)]);
        assert_eq!(batch[0].cause_xid, 150);
        assert_eq!(batch[1].root_pk, vec![json!(2)]);
    }

    #[test]
    fn test_coalesce_keeps_max_cause_xid() {
        let mut q = WorkQueue::new(10, 2);
        q.enqueue("idx", vec![json!(1)], 150);
        q.enqueue("idx", vec![json!(1)], 100); // older xid, should not regress
        let batch = q.dequeue_batch(10);
        assert_eq!(batch[0].cause_xid, 150);
    }

    #[test]
    fn test_back_pressure_hysteresis() {
        let mut q = WorkQueue::new(3, 1);
        q.enqueue("idx", vec![json!(1)], 1);
        q.enqueue("idx", vec![json!(2)], 1);
        assert!(!q.should_pause_intake());
        q.enqueue("idx", vec![json!(3)], 1);
        assert!(q.should_pause_intake());

        q.dequeue_batch(1);
        // Still above low_water (2 remaining > 1), should stay paused.
        assert!(q.should_pause_intake());

        q.dequeue_batch(1);
        // At low_water (1 remaining), should release.
        assert!(!q.should_pause_intake());
    }

    #[test]
    fn test_distinct_indexes_do_not_coalesce_with_each_other() {
        let mut q = WorkQueue::new(10, 2);
        q.enqueue("idx_a", vec![json!(1)], 1);
        q.enqueue("idx_b", vec![json!(1)], 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_dequeue_batch_respects_max() {
        let mut q = WorkQueue::new(10, 2);
        for i in 0..5 {
            q.enqueue("idx", vec![json!(i)], 1);
        }
        let batch = q.dequeue_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(q.len(), 3);
    }
}
