//! Registry of in-flight operations.
//!
//! Tracks operations between the moment the sync layer starts working on them
//! and the moment they complete, so the conflict resolver can see which other
//! operations overlap in time (two reveals in flight, a reset racing a vote).
//!
//! Entries are normally removed by [`ActiveOperations::complete`]. An entry
//! whose owner never completes it (a crashed task, a dropped future) expires
//! after the TTL and is removed by [`ActiveOperations::prune`], so the
//! registry cannot grow without bound.

use std::collections::HashMap;
use std::time::Duration;
use roomsync_types::{Operation, OperationId};

/// Default lifetime of an entry that is never completed.
pub const DEFAULT_OPERATION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct ActiveEntry {
    operation: Operation,
    started_at: u64,
}

/// Process-local set of in-flight operations keyed by id.
#[derive(Debug)]
pub struct ActiveOperations {
    ttl_ms: u64,
    entries: HashMap<OperationId, ActiveEntry>,
}

impl ActiveOperations {
    /// Create an empty registry whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            entries: HashMap::new(),
        }
    }

    /// Record that `operation` started at `now_ms`.
    ///
    /// Re-registering an id (a retried operation) refreshes its start time.
    pub fn begin(&mut self, operation: Operation, now_ms: u64) -> OperationId {
        let id = operation.id;
        self.entries.insert(
            id,
            ActiveEntry {
                operation,
                started_at: now_ms,
            },
        );
        id
    }

    /// Remove a finished operation.
    ///
    /// Completing an unknown (or already pruned) id is a no-op.
    pub fn complete(&mut self, id: &OperationId) -> Option<Operation> {
        self.entries.remove(id).map(|e| e.operation)
    }

    /// Drop every entry older than the TTL. Returns how many were dropped.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_ms.saturating_sub(e.started_at) < ttl);
        before - self.entries.len()
    }

    /// Live operations other than `id`, oldest first.
    ///
    /// Expired entries are skipped even if [`prune`](Self::prune) has not run.
    pub fn others(&self, id: &OperationId, now_ms: u64) -> Vec<Operation> {
        let mut live: Vec<&ActiveEntry> = self
            .entries
            .iter()
            .filter(|(k, e)| *k != id && now_ms.saturating_sub(e.started_at) < self.ttl_ms)
            .map(|(_, e)| e)
            .collect();
        live.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.operation.id.cmp(&b.operation.id))
        });
        live.into_iter().map(|e| e.operation.clone()).collect()
    }

    /// Number of registered entries (including not yet pruned expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ActiveOperations {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomsync_types::{OperationType, RoomUpdate};

    fn make_op(op_type: OperationType, player: &str) -> Operation {
        Operation::new(op_type, player, 0, RoomUpdate::new())
    }

    #[test]
    fn begin_and_complete() {
        let mut registry = ActiveOperations::default();
        let id = registry.begin(make_op(OperationType::Reveal, "alice"), 100);

        assert_eq!(registry.len(), 1);

        let done = registry.complete(&id).unwrap();
        assert_eq!(done.id, id);
        assert!(registry.is_empty());
    }

    #[test]
    fn complete_unknown_is_no_op() {
        let mut registry = ActiveOperations::default();
        assert!(registry.complete(&OperationId::new()).is_none());
    }

    #[test]
    fn others_excludes_self() {
        let mut registry = ActiveOperations::default();
        let a = registry.begin(make_op(OperationType::Reveal, "alice"), 100);
        let b = registry.begin(make_op(OperationType::Reveal, "bob"), 110);

        let seen_by_a = registry.others(&a, 120);
        assert_eq!(seen_by_a.len(), 1);
        assert_eq!(seen_by_a[0].id, b);
    }

    #[test]
    fn others_are_oldest_first() {
        let mut registry = ActiveOperations::default();
        let late = registry.begin(make_op(OperationType::Vote, "bob"), 500);
        let early = registry.begin(make_op(OperationType::Vote, "carol"), 100);

        let ids: Vec<_> = registry
            .others(&OperationId::new(), 600)
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[test]
    fn expired_entries_are_invisible_and_pruned() {
        let mut registry = ActiveOperations::new(Duration::from_secs(30));
        registry.begin(make_op(OperationType::Reveal, "ghost"), 0);
        let live = registry.begin(make_op(OperationType::Vote, "alice"), 20_000);

        // At t=30s the first entry has expired, the second has not.
        let visible = registry.others(&OperationId::new(), 30_000);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, live);

        assert_eq!(registry.prune(30_000), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rebegin_refreshes_start_time() {
        let mut registry = ActiveOperations::new(Duration::from_millis(100));
        let op = make_op(OperationType::Reset, "alice");
        registry.begin(op.clone(), 0);
        registry.begin(op, 90);

        assert_eq!(registry.prune(150), 0);
        assert_eq!(registry.len(), 1);
    }
}
