//! Per-room write batching.
//!
//! Batchable operations are not written one by one. They accumulate in a
//! per-room [`PendingBatch`] that is flushed as a single write when it fills
//! up or when its timeout elapses, whichever comes first. One flush is one
//! version increment, however many operations it carries.
//!
//! The queue itself never sleeps. [`BatchQueue::enqueue`] tells the caller
//! when a new batch opened (arm a timer) or hands over a batch that just
//! filled up (flush now); the caller owns the timers and calls
//! [`BatchQueue::take_generation`] when one fires.

use std::collections::HashMap;
use std::time::Duration;
use roomsync_types::{Operation, RoomId, RoomUpdate};

/// Default number of operations that forces a flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

/// Default time between the first buffered operation and the flush.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// What the caller must do after an enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSignal {
    /// A new batch was opened; flush it at `deadline_ms` unless it fills first.
    Opened {
        /// Batch generation, passed back to [`BatchQueue::take_generation`].
        generation: u64,
        /// When the timeout expires.
        deadline_ms: u64,
    },
    /// Added to an open batch, nothing to do.
    Buffered,
    /// The batch reached its size limit and was removed from the queue;
    /// flush it now.
    Full(PendingBatch),
}

/// Operations buffered for one room.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    /// Buffered operations in arrival order.
    pub operations: Vec<Operation>,
    /// When the first operation arrived.
    pub opened_at: u64,
    /// Distinguishes successive batches of the same room.
    pub generation: u64,
}

impl PendingBatch {
    /// All buffered updates folded into one, later operations winning per key.
    pub fn merged(&self) -> RoomUpdate {
        self.operations
            .iter()
            .fold(RoomUpdate::new(), |acc, op| acc.merge(op.payload.clone()))
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Size- and time-bounded buffers, one per room.
#[derive(Debug)]
pub struct BatchQueue {
    max_size: usize,
    timeout_ms: u64,
    next_generation: u64,
    pending: HashMap<RoomId, PendingBatch>,
}

impl BatchQueue {
    /// Create a queue that flushes at `max_size` operations or after `timeout`.
    ///
    /// A `max_size` of 0 is treated as 1.
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            timeout_ms: timeout.as_millis() as u64,
            next_generation: 0,
            pending: HashMap::new(),
        }
    }

    /// Buffer `operation` for `room`.
    ///
    /// A batch that reaches the size limit leaves the queue in the same call,
    /// so no later enqueue can grow it past the limit.
    pub fn enqueue(&mut self, room: &RoomId, operation: Operation, now_ms: u64) -> BatchSignal {
        let max_size = self.max_size;

        if let Some(batch) = self.pending.get_mut(room) {
            batch.operations.push(operation);
            if batch.len() < max_size {
                return BatchSignal::Buffered;
            }
            return match self.pending.remove(room) {
                Some(full) => BatchSignal::Full(full),
                None => BatchSignal::Buffered,
            };
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let batch = PendingBatch {
            operations: vec![operation],
            opened_at: now_ms,
            generation,
        };

        if max_size == 1 {
            BatchSignal::Full(batch)
        } else {
            self.pending.insert(room.clone(), batch);
            BatchSignal::Opened {
                generation,
                deadline_ms: now_ms + self.timeout_ms,
            }
        }
    }

    /// Remove and return the batch for `room`.
    pub fn take(&mut self, room: &RoomId) -> Option<PendingBatch> {
        self.pending.remove(room)
    }

    /// Remove the batch for `room` only if it is still `generation`.
    ///
    /// A timer armed for a batch that was already flushed must not flush
    /// the batch opened after it.
    pub fn take_generation(&mut self, room: &RoomId, generation: u64) -> Option<PendingBatch> {
        match self.pending.get(room) {
            Some(batch) if batch.generation == generation => self.pending.remove(room),
            _ => None,
        }
    }

    /// Rooms with a pending batch.
    pub fn rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.pending.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Operations buffered for `room`.
    pub fn len(&self, room: &RoomId) -> usize {
        self.pending.get(room).map_or(0, PendingBatch::len)
    }

    /// Check if nothing is buffered for any room.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for BatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomsync_types::{OperationType, PlayerId};

    fn vote(player: &str, value: &str, ts: u64) -> Operation {
        Operation::new(
            OperationType::Vote,
            player,
            ts,
            RoomUpdate::vote(player, value, ts),
        )
    }

    #[test]
    fn first_enqueue_opens_batch() {
        let mut queue = BatchQueue::default();
        let room = RoomId::new("ABC123");

        let signal = queue.enqueue(&room, vote("alice", "3", 0), 1_000);
        assert_eq!(
            signal,
            BatchSignal::Opened {
                generation: 0,
                deadline_ms: 1_500
            }
        );
        assert_eq!(queue.enqueue(&room, vote("bob", "5", 0), 1_010), BatchSignal::Buffered);
        assert_eq!(queue.len(&room), 2);
    }

    #[test]
    fn tenth_operation_fills_batch() {
        let mut queue = BatchQueue::default();
        let room = RoomId::new("ABC123");

        for i in 0..9 {
            let signal = queue.enqueue(&room, vote(&format!("p{}", i), "1", i), i);
            assert!(!matches!(signal, BatchSignal::Full(_)));
        }
        let batch = match queue.enqueue(&room, vote("p9", "1", 9), 9) {
            BatchSignal::Full(batch) => batch,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(batch.len(), 10);
        assert!(queue.is_empty());
        assert!(queue.take(&room).is_none());
    }

    #[test]
    fn merged_keeps_last_value_per_player() {
        let mut queue = BatchQueue::default();
        let room = RoomId::new("ABC123");
        queue.enqueue(&room, vote("alice", "3", 1), 1);
        queue.enqueue(&room, vote("bob", "5", 2), 2);
        queue.enqueue(&room, vote("alice", "8", 3), 3);

        let merged = queue.take(&room).unwrap().merged();
        assert_eq!(merged.upsert_votes.len(), 2);
        assert_eq!(merged.upsert_votes[&PlayerId::from("alice")].value, "8");
        assert_eq!(merged.upsert_votes[&PlayerId::from("bob")].value, "5");
    }

    #[test]
    fn rooms_are_independent() {
        let mut queue = BatchQueue::new(2, Duration::from_millis(500));
        let a = RoomId::new("AAAAAA");
        let b = RoomId::new("BBBBBB");

        queue.enqueue(&a, vote("alice", "1", 0), 0);
        queue.enqueue(&b, vote("bob", "1", 0), 0);
        assert!(matches!(
            queue.enqueue(&a, vote("carol", "1", 0), 0),
            BatchSignal::Full(_)
        ));
        assert_eq!(queue.len(&a), 0);
        assert_eq!(queue.len(&b), 1);
    }

    #[test]
    fn stale_generation_is_not_taken() {
        let mut queue = BatchQueue::default();
        let room = RoomId::new("ABC123");

        let first = match queue.enqueue(&room, vote("alice", "1", 0), 0) {
            BatchSignal::Opened { generation, .. } => generation,
            other => panic!("unexpected {:?}", other),
        };
        queue.take(&room).unwrap();
        queue.enqueue(&room, vote("bob", "2", 0), 100);

        assert!(queue.take_generation(&room, first).is_none());
        assert_eq!(queue.len(&room), 1);
    }

    #[test]
    fn enqueue_after_full_opens_a_new_batch() {
        let mut queue = BatchQueue::new(2, Duration::from_millis(500));
        let room = RoomId::new("ABC123");

        queue.enqueue(&room, vote("alice", "1", 0), 0);
        assert!(matches!(
            queue.enqueue(&room, vote("bob", "2", 0), 0),
            BatchSignal::Full(ref b) if b.len() == 2
        ));
        assert!(matches!(
            queue.enqueue(&room, vote("carol", "3", 0), 10),
            BatchSignal::Opened { generation: 1, deadline_ms: 510 }
        ));
        assert_eq!(queue.len(&room), 1);
    }

    #[test]
    fn size_one_flushes_immediately() {
        let mut queue = BatchQueue::new(0, Duration::from_millis(500));
        let room = RoomId::new("ABC123");
        assert!(matches!(
            queue.enqueue(&room, vote("alice", "1", 0), 0),
            BatchSignal::Full(_)
        ));
        assert!(queue.is_empty());
    }
}
