//! SyncLayer - the main interface for roomsync.
//!
//! This module provides [`SyncLayer`], the API the UI layer uses to read
//! and mutate shared room records.
//!
//! # Architecture
//!
//! SyncLayer uses pure policy from sync-core (conflict detection and
//! resolution, batching, in-flight bookkeeping) and performs the actual I/O
//! through the [`RoomStore`] trait. Results are published through an
//! optional [`EventDispatcher`].
//!
//! ```text
//! UI → SyncLayer → RoomStore → backend
//!         ↓    ↘
//!   sync-core   EventDispatcher → listeners
//! ```
//!
//! Every write is a compare-and-swap on the room version: the layer reads
//! version N, asks the resolver whether the operation conflicts with the
//! room or with other operations in flight, and writes version N + 1 only if
//! the store is still at N.
//!
//! # Example
//!
//! ```ignore
//! let layer = SyncLayer::new(MemoryStore::new(), SyncConfig::default());
//! let room = RoomId::new("ABC123");
//! layer.create_room(&room, Player::new("alice", "Alice", now)).await?;
//!
//! let reveal = Operation::new(OperationType::Reveal, "alice", now, RoomUpdate::reveal())
//!     .with_expected_version(Version::new(1));
//! layer.write(&room, reveal).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use roomsync_core::{
    ActiveOperations, BatchQueue, BatchSignal, Clock, Conflict, ConflictKind, ConflictResolver,
    HistoryRecord, PendingBatch, Resolution, ResolutionAction, ResolutionStrategy,
    ResolverStatistics,
};
use roomsync_types::{
    Operation, OperationType, Phase, Player, RoomError, RoomId, RoomState, RoomUpdate, Version,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::TokioClock;
use crate::config::{Config, ConfigError, SyncConfig};
use crate::dispatcher::EventDispatcher;
use crate::events;
use crate::store::{RoomStore, StoreError, TransactFn};

/// Sync layer errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The room does not exist.
    #[error("room not found: {0}")]
    NotFound(RoomId),

    /// The room already exists.
    #[error("room already exists: {0}")]
    AlreadyExists(RoomId),

    /// A conflict resolved to reject, or retries ran out.
    #[error("version conflict on {room} ({kind}): {reason}")]
    VersionConflict {
        /// The room.
        room: RoomId,
        /// The conflict that was detected.
        kind: ConflictKind,
        /// Why the write did not happen.
        reason: String,
        /// Stored version when the conflict was detected.
        current: Version,
        /// Set when the caller should re-read and resubmit after this delay.
        retry_after: Option<Duration>,
    },

    /// The operation is not allowed in the current room state.
    #[error("operation rejected ({kind}): {reason}")]
    OperationRejected {
        /// The conflict that was detected.
        kind: ConflictKind,
        /// The rule's message.
        reason: String,
    },

    /// The transaction function declined to commit, or the store gave up.
    #[error("transaction aborted on {0}")]
    TransactionAborted(RoomId),

    /// The update failed validation.
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] RoomError),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of a successful [`SyncLayer::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written immediately.
    Committed {
        /// The new room version.
        version: Version,
        /// The conflict resolved on the way, if any.
        conflict: Option<ConflictKind>,
    },
    /// Buffered; it will be written with the rest of the room's batch.
    Batched {
        /// Operations now buffered for the room.
        pending: usize,
    },
    /// Buffered, and it filled the batch, which was written right away.
    Flushed {
        /// The new room version, or `None` when nothing was left to write.
        version: Option<Version>,
    },
}

impl WriteOutcome {
    /// Version written by this call, if any.
    pub fn version(&self) -> Option<Version> {
        match self {
            WriteOutcome::Committed { version, .. } => Some(*version),
            WriteOutcome::Flushed { version } => *version,
            WriteOutcome::Batched { .. } => None,
        }
    }
}

/// Versioned access to room records.
///
/// Cheap to clone; clones share the resolver, the in-flight registry and
/// the batch buffers.
pub struct SyncLayer<S: RoomStore> {
    store: Arc<S>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Option<EventDispatcher>,
    resolver: Arc<Mutex<ConflictResolver>>,
    active: Arc<Mutex<ActiveOperations>>,
    batches: Arc<Mutex<BatchQueue>>,
    published: Arc<DashMap<RoomId, RoomState>>,
}

impl<S: RoomStore> Clone for SyncLayer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            dispatcher: self.dispatcher.clone(),
            resolver: Arc::clone(&self.resolver),
            active: Arc::clone(&self.active),
            batches: Arc::clone(&self.batches),
            published: Arc::clone(&self.published),
        }
    }
}

impl<S: RoomStore> std::fmt::Debug for SyncLayer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("dispatcher", &self.dispatcher.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: RoomStore> SyncLayer<S> {
    /// Create a layer with the built-in resolver rules and no dispatcher.
    pub fn new(store: S, config: SyncConfig) -> Self {
        let active = ActiveOperations::new(config.operation_ttl());
        let batches = BatchQueue::new(config.max_batch_size, config.batch_timeout());
        Self {
            store: Arc::new(store),
            config,
            clock: Arc::new(TokioClock::new()),
            dispatcher: None,
            resolver: Arc::new(Mutex::new(ConflictResolver::new())),
            active: Arc::new(Mutex::new(active)),
            batches: Arc::new(Mutex::new(batches)),
            published: Arc::new(DashMap::new()),
        }
    }

    /// Create a layer from a full configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a resolver rule override is invalid.
    pub fn from_config(store: S, config: &Config) -> Result<Self, ConfigError> {
        let resolver = config.resolver.build()?;
        Ok(Self::new(store, config.sync.clone()).with_resolver(resolver))
    }

    /// Use `resolver` instead of the built-in one.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Arc::new(Mutex::new(resolver));
        self
    }

    /// Publish changes through `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The dispatcher, if one is attached.
    pub fn dispatcher(&self) -> Option<&EventDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Read a room snapshot.
    pub async fn read(&self, room: &RoomId) -> Result<RoomState, SyncError> {
        self.timed(self.store.get(&room.path()))
            .await?
            .ok_or_else(|| SyncError::NotFound(room.clone()))
    }

    /// Create a room with `host` seated, at version 1.
    pub async fn create_room(&self, room: &RoomId, host: Player) -> Result<RoomState, SyncError> {
        let update = RoomUpdate::join(host);
        update.validate()?;

        let now = self.clock.now_ms();
        let mut exists = false;
        let outcome = self
            .transact(room, &mut |current| {
                exists = current.is_some();
                if exists {
                    return None;
                }
                update
                    .apply(&RoomState::new(now))
                    .committed(Version::zero(), OperationType::Join, now)
                    .ok()
            })
            .await?;

        if exists {
            return Err(SyncError::AlreadyExists(room.clone()));
        }
        let state = outcome.ok_or_else(|| SyncError::TransactionAborted(room.clone()))?;
        tracing::info!("Created room {}", room);
        self.publish_state(room, None, &state, Some(OperationType::Join));
        Ok(state)
    }

    /// Submit an operation.
    ///
    /// Reads the room, checks the operation against the room and the
    /// operations in flight, applies the resolver's decision and writes with
    /// compare-and-swap. Batchable operations without a conflict are
    /// buffered instead of written.
    ///
    /// Retry decisions are followed internally, with the rule's delay, for
    /// idempotent operation types only. Reveal and reset get
    /// [`SyncError::VersionConflict`] with `retry_after` set.
    ///
    /// A reveal first writes the votes this layer still has buffered for
    /// the room, so they are revealed with the rest.
    pub async fn write(
        &self,
        room: &RoomId,
        operation: Operation,
    ) -> Result<WriteOutcome, SyncError> {
        if let Err(e) = operation.payload.validate() {
            let error = SyncError::InvalidUpdate(e);
            self.publish_error(room, Some(&operation), &error);
            return Err(error);
        }

        let mut op = operation;
        {
            let now = self.clock.now_ms();
            let mut active = self.active.lock().await;
            let pruned = active.prune(now);
            if pruned > 0 {
                tracing::debug!("Pruned {} expired in-flight operations", pruned);
            }
            active.begin(op.clone(), now);
        }

        let result = self.write_registered(room, &mut op).await;

        // Buffered operations stay in flight until their batch is flushed.
        if !matches!(result, Ok(WriteOutcome::Batched { .. })) {
            self.active.lock().await.complete(&op.id);
        }
        if let Err(e) = &result {
            self.publish_error(room, Some(&op), e);
        }
        result
    }

    async fn write_registered(
        &self,
        room: &RoomId,
        op: &mut Operation,
    ) -> Result<WriteOutcome, SyncError> {
        let mut resolved: Option<ConflictKind> = None;

        if op.op_type == OperationType::Reveal {
            self.flush_room(room).await?;
        }

        loop {
            let current = self.read(room).await?;
            let others = self
                .active
                .lock()
                .await
                .others(&op.id, self.clock.now_ms());
            let conflict = self.resolver.lock().await.detect(op, &current, &others);

            let next = match conflict {
                None => {
                    if self.config.batching_enabled && op.op_type.is_batchable() {
                        return self.enqueue(room, op.clone()).await;
                    }
                    op.payload.apply(&current)
                }
                Some(conflict) => {
                    let (conflict, resolution) = self.settle(room, op, &current, conflict).await;
                    resolved = Some(conflict.kind);

                    match resolution.action {
                        ResolutionAction::Proceed => op.payload.apply(&current),
                        ResolutionAction::Merge(state) => *state,
                        ResolutionAction::Reject => {
                            return Err(rejection(
                                room,
                                conflict.kind,
                                resolution.strategy,
                                resolution.reason,
                                current.version,
                            ));
                        }
                        ResolutionAction::Retry { remaining, backoff } => {
                            if !op.op_type.is_idempotent() {
                                return Err(SyncError::VersionConflict {
                                    room: room.clone(),
                                    kind: conflict.kind,
                                    reason: resolution.reason,
                                    current: current.version,
                                    retry_after: Some(backoff),
                                });
                            }
                            tracing::debug!(
                                "Retrying {} on {} in {:?} ({} retries left)",
                                op.op_type,
                                room,
                                backoff,
                                remaining
                            );
                            tokio::time::sleep(backoff).await;
                            let fresh = self.read(room).await?;
                            *op = op.clone().retried(fresh.version);
                            continue;
                        }
                    }
                }
            };

            let committed = next.committed(current.version, op.op_type, self.clock.now_ms())?;
            let outcome = self
                .timed(
                    self.store
                        .put(&room.path(), committed.clone(), Some(current.version)),
                )
                .await?;

            if outcome.success {
                tracing::debug!(
                    "Committed {} from {} to {} at version {}",
                    op.op_type,
                    op.player_id,
                    room,
                    committed.version
                );
                self.after_commit(room, op.op_type, &current, &committed)
                    .await;
                return Ok(WriteOutcome::Committed {
                    version: committed.version,
                    conflict: resolved,
                });
            }

            // Another client wrote between our read and our put. Pin the
            // version we read so the next pass sees a version mismatch.
            tracing::debug!(
                "Write to {} lost a race at version {} (store at {})",
                room,
                current.version,
                outcome.version
            );
            if op.expected_version.is_none() {
                op.expected_version = Some(current.version);
            }
        }
    }

    /// Resolve `conflict`, then hold a proceed or merge decision to the
    /// operation's expected version. A stale write must not commit just
    /// because an earlier kind matched first.
    async fn settle(
        &self,
        room: &RoomId,
        op: &Operation,
        current: &RoomState,
        conflict: Conflict,
    ) -> (Conflict, Resolution) {
        let mut resolver = self.resolver.lock().await;
        let resolution = resolver.resolve(&conflict);
        self.note_resolution(room, &conflict, &resolution);

        let writes = matches!(
            resolution.action,
            ResolutionAction::Proceed | ResolutionAction::Merge(_)
        );
        if writes && conflict.kind != ConflictKind::VersionMismatch {
            if let Some(stale) = resolver.stale_version(op, current) {
                let resolution = resolver.resolve(&stale);
                self.note_resolution(room, &stale, &resolution);
                return (stale, resolution);
            }
        }
        (conflict, resolution)
    }

    fn note_resolution(&self, room: &RoomId, conflict: &Conflict, resolution: &Resolution) {
        tracing::debug!(
            "Conflict {} on {} for {} from {}: {} ({})",
            conflict.kind,
            room,
            conflict.operation.op_type,
            conflict.operation.player_id,
            resolution.action.tag().as_str(),
            resolution.reason
        );
        self.publish_resolution(room, conflict, resolution);
    }

    /// Atomically apply `update(current)` to a room.
    ///
    /// `update` may run more than once if the store sees a concurrent write.
    /// Returning `None` aborts without committing. On commit the version is
    /// incremented and the metadata stamped with `op_type`.
    pub async fn transaction<F>(
        &self,
        room: &RoomId,
        op_type: OperationType,
        mut update: F,
    ) -> Result<RoomState, SyncError>
    where
        F: FnMut(&RoomState) -> Option<RoomUpdate> + Send,
    {
        let now = self.clock.now_ms();
        let mut missing = false;
        let mut invalid: Option<RoomError> = None;
        let mut before: Option<RoomState> = None;

        let outcome = self
            .transact(room, &mut |current| {
                let Some(current) = current else {
                    missing = true;
                    return None;
                };
                missing = false;
                invalid = None;
                let change = update(current)?;
                if let Err(e) = change.validate() {
                    invalid = Some(e);
                    return None;
                }
                match change.apply(current).committed(current.version, op_type, now) {
                    Ok(next) => {
                        before = Some(current.clone());
                        Some(next)
                    }
                    Err(e) => {
                        invalid = Some(e);
                        None
                    }
                }
            })
            .await;

        let result = match (outcome, invalid) {
            (Err(e), _) => Err(e),
            (Ok(_), _) if missing => Err(SyncError::NotFound(room.clone())),
            (Ok(_), Some(e)) => Err(SyncError::InvalidUpdate(e)),
            (Ok(None), None) => Err(SyncError::TransactionAborted(room.clone())),
            (Ok(Some(state)), None) => Ok(state),
        };

        match result {
            Ok(state) => {
                tracing::debug!(
                    "Transaction {} on {} committed version {}",
                    op_type,
                    room,
                    state.version
                );
                self.after_commit_state(room, op_type, before.as_ref(), &state)
                    .await;
                Ok(state)
            }
            Err(e) => {
                self.publish_error(room, None, &e);
                Err(e)
            }
        }
    }

    /// Forward remote changes of a room to the dispatcher.
    ///
    /// Changes already published by this layer are not published again.
    /// Abort the returned task to stop watching.
    pub fn watch_room(&self, room: &RoomId) -> JoinHandle<()> {
        let mut rx = self.store.watch(&room.path());
        let layer = self.clone();
        let room = room.clone();

        tokio::spawn(async move {
            tracing::debug!("Watching {}", room);
            loop {
                match rx.recv().await {
                    Ok(state) => {
                        let op_type = state.last_operation;
                        layer.publish_state(&room, None, &state, op_type);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Watcher for {} lagged, {} updates skipped", room, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Stopped watching {}", room);
        })
    }

    /// Write every pending batch now.
    ///
    /// Rooms are flushed independently; a failure is logged and published
    /// and does not stop the other rooms. Returns how many rooms flushed
    /// without error.
    pub async fn flush_batches(&self) -> usize {
        let batches: Vec<(RoomId, PendingBatch)> = {
            let mut queue = self.batches.lock().await;
            queue
                .rooms()
                .into_iter()
                .filter_map(|room| queue.take(&room).map(|batch| (room, batch)))
                .collect()
        };

        let mut flushed = 0;
        for (room, batch) in batches {
            match self.flush_batch(&room, batch).await {
                Ok(_) => flushed += 1,
                Err(e) => {
                    tracing::warn!("Batch flush for {} failed: {}", room, e);
                    self.publish_error(&room, None, &e);
                }
            }
        }
        flushed
    }

    /// Operations buffered for `room`.
    pub async fn pending_batched(&self, room: &RoomId) -> usize {
        self.batches.lock().await.len(room)
    }

    /// Operations currently in flight.
    pub async fn active_operations(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Resolver counters.
    pub async fn statistics(&self) -> ResolverStatistics {
        self.resolver.lock().await.statistics()
    }

    /// Past resolutions, oldest first.
    pub async fn conflict_history(&self) -> Vec<HistoryRecord> {
        self.resolver.lock().await.history().cloned().collect()
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.config.store_timeout(), call)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn transact(
        &self,
        room: &RoomId,
        update: &mut TransactFn<'_>,
    ) -> Result<Option<RoomState>, SyncError> {
        let path = room.path();
        match self.timed(self.store.transact(&path, update)).await {
            Ok(outcome) if outcome.committed => Ok(outcome.value),
            Ok(_) => Ok(None),
            Err(StoreError::Contended { attempts }) => {
                tracing::warn!(
                    "Transaction on {} gave up after {} attempts",
                    room,
                    attempts
                );
                Err(SyncError::TransactionAborted(room.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue(&self, room: &RoomId, op: Operation) -> Result<WriteOutcome, SyncError> {
        let now = self.clock.now_ms();
        let (signal, pending) = {
            let mut queue = self.batches.lock().await;
            let signal = queue.enqueue(room, op, now);
            (signal, queue.len(room))
        };

        match signal {
            BatchSignal::Opened { generation, .. } => {
                self.spawn_flush_timer(room.clone(), generation);
                Ok(WriteOutcome::Batched { pending })
            }
            BatchSignal::Buffered => Ok(WriteOutcome::Batched { pending }),
            BatchSignal::Full(batch) => {
                let version = self.flush_batch(room, batch).await?;
                Ok(WriteOutcome::Flushed { version })
            }
        }
    }

    /// Write the room's pending batch now, if there is one.
    async fn flush_room(&self, room: &RoomId) -> Result<(), SyncError> {
        let batch = self.batches.lock().await.take(room);
        if let Some(batch) = batch {
            tracing::debug!("Flushing {} batched operations on {} before reveal", batch.len(), room);
            self.flush_batch(room, batch).await?;
        }
        Ok(())
    }

    fn spawn_flush_timer(&self, room: RoomId, generation: u64) {
        let layer = self.clone();
        let timeout = self.config.batch_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let batch = layer
                .batches
                .lock()
                .await
                .take_generation(&room, generation);
            if let Some(batch) = batch {
                if let Err(e) = layer.flush_batch(&room, batch).await {
                    tracing::warn!("Batch flush for {} failed: {}", room, e);
                    layer.publish_error(&room, None, &e);
                }
            }
        });
    }

    /// Write a batch as one commit.
    ///
    /// Votes are dropped if the room stopped accepting them, which happens
    /// when another client revealed first. Each dropped vote is published
    /// as a sync error for its voter.
    async fn flush_batch(
        &self,
        room: &RoomId,
        batch: PendingBatch,
    ) -> Result<Option<Version>, SyncError> {
        let count = batch.len();
        let op_type = batch
            .operations
            .last()
            .map_or(OperationType::Vote, |o| o.op_type);
        let merged = batch.merged();
        let now = self.clock.now_ms();

        let mut missing = false;
        let mut dropped_votes = false;
        let mut exhausted: Option<RoomError> = None;
        let mut before: Option<RoomState> = None;

        let result = self
            .transact(room, &mut |current| {
                let Some(current) = current else {
                    missing = true;
                    return None;
                };
                missing = false;
                exhausted = None;
                dropped_votes = matches!(current.phase, Phase::Revealing | Phase::Finished)
                    && !merged.upsert_votes.is_empty();
                let update = if dropped_votes {
                    merged.without_vote_upserts()
                } else {
                    merged.clone()
                };
                if update.is_empty() {
                    return None;
                }
                match update.apply(current).committed(current.version, op_type, now) {
                    Ok(next) => {
                        before = Some(current.clone());
                        Some(next)
                    }
                    Err(e) => {
                        exhausted = Some(e);
                        None
                    }
                }
            })
            .await;

        {
            let mut active = self.active.lock().await;
            for op in &batch.operations {
                active.complete(&op.id);
            }
        }

        let committed = result?;
        if missing {
            return Err(SyncError::NotFound(room.clone()));
        }
        if let Some(e) = exhausted {
            return Err(e.into());
        }
        if dropped_votes {
            let voters: Vec<&Operation> = batch
                .operations
                .iter()
                .filter(|o| !o.payload.upsert_votes.is_empty())
                .collect();
            tracing::warn!(
                "Dropped {} batched votes on {}: votes are already revealed",
                voters.len(),
                room
            );
            let error = SyncError::OperationRejected {
                kind: ConflictKind::VoteDuringReveal,
                reason: format!("votes on {} were revealed before the batch was written", room),
            };
            for op in voters {
                self.publish_error(room, Some(op), &error);
            }
        }
        let Some(state) = committed else {
            tracing::debug!("Batch of {} on {} had nothing left to write", count, room);
            return Ok(None);
        };

        tracing::debug!(
            "Flushed {} batched operations to {} at version {}",
            count,
            room,
            state.version
        );
        self.publish_state(room, before.as_ref(), &state, Some(op_type));
        Ok(Some(state.version))
    }

    async fn after_commit(
        &self,
        room: &RoomId,
        op_type: OperationType,
        before: &RoomState,
        after: &RoomState,
    ) {
        self.after_commit_state(room, op_type, Some(before), after)
            .await;
    }

    async fn after_commit_state(
        &self,
        room: &RoomId,
        op_type: OperationType,
        before: Option<&RoomState>,
        after: &RoomState,
    ) {
        // Votes buffered before a reset belong to the previous round.
        if op_type == OperationType::Reset {
            let stale = self.batches.lock().await.take(room);
            if let Some(stale) = stale {
                let mut active = self.active.lock().await;
                for op in &stale.operations {
                    active.complete(&op.id);
                }
                tracing::info!(
                    "Discarded {} batched operations on {} superseded by reset",
                    stale.len(),
                    room
                );
            }
        }
        self.publish_state(room, before, after, Some(op_type));
    }

    fn emit(&self, event_type: &str, data: Value) {
        if let Some(dispatcher) = &self.dispatcher {
            if let Err(e) = dispatcher.emit(event_type, data) {
                tracing::debug!("Event {} not queued: {}", event_type, e);
            }
        }
    }

    /// Publish `after` unless a same or newer version was already published.
    ///
    /// Field-level events are derived by comparing with the last published
    /// snapshot, or with `fallback` for a room seen for the first time.
    fn publish_state(
        &self,
        room: &RoomId,
        fallback: Option<&RoomState>,
        after: &RoomState,
        op_type: Option<OperationType>,
    ) {
        if self.dispatcher.is_none() {
            return;
        }

        let previous = {
            let mut entry = self
                .published
                .entry(room.clone())
                .or_insert_with(|| fallback.cloned().unwrap_or_default());
            if entry.version >= after.version {
                return;
            }
            std::mem::replace(entry.value_mut(), after.clone())
        };

        let state = match serde_json::to_value(after) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Failed to encode {} for publishing: {}", room, e);
                return;
            }
        };

        self.emit(
            events::ROOM_UPDATED,
            json!({
                "room": room.as_str(),
                "version": after.version.value(),
                "operation": op_type.map(|t| t.as_str()),
                "state": state,
            }),
        );

        if previous.players != after.players {
            let players: Vec<Value> = after
                .players
                .values()
                .map(|p| json!({"id": p.id.as_str(), "name": p.name, "spectator": p.spectator}))
                .collect();
            self.emit(
                events::PLAYERS_UPDATED,
                json!({"room": room.as_str(), "players": players}),
            );
        }

        if previous.votes != after.votes {
            let votes: serde_json::Map<String, Value> = after
                .votes
                .iter()
                .map(|(id, vote)| (id.as_str().to_string(), json!(vote.value)))
                .collect();
            self.emit(
                events::VOTES_UPDATED,
                json!({"room": room.as_str(), "votes": votes}),
            );
        }

        if previous.phase != after.phase {
            self.emit(
                events::PHASE_CHANGED,
                json!({
                    "room": room.as_str(),
                    "from": previous.phase.to_string(),
                    "to": after.phase.to_string(),
                }),
            );
        }
    }

    fn publish_resolution(&self, room: &RoomId, conflict: &Conflict, resolution: &Resolution) {
        self.emit(
            events::CONFLICT_RESOLVED,
            json!({
                "room": room.as_str(),
                "kind": conflict.kind.as_str(),
                "operation": conflict.operation.op_type.as_str(),
                "player": conflict.operation.player_id.as_str(),
                "action": resolution.action.tag().as_str(),
                "success": resolution.success,
                "reason": resolution.reason,
            }),
        );
    }

    fn publish_error(&self, room: &RoomId, op: Option<&Operation>, error: &SyncError) {
        self.emit(
            events::SYNC_ERROR,
            json!({
                "room": room.as_str(),
                "operation": op.map(|o| o.op_type.as_str()),
                "player": op.map(|o| o.player_id.as_str()),
                "error": error.to_string(),
            }),
        );
    }
}

/// Policy rejections surface as [`SyncError::OperationRejected`], every
/// other reject as a version conflict.
fn rejection(
    room: &RoomId,
    kind: ConflictKind,
    strategy: Option<ResolutionStrategy>,
    reason: String,
    current: Version,
) -> SyncError {
    match strategy {
        Some(ResolutionStrategy::Ignore) => SyncError::OperationRejected { kind, reason },
        _ => SyncError::VersionConflict {
            room: room.clone(),
            kind,
            reason,
            current,
            retry_after: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::ListenerOptions;
    use crate::store::MemoryStore;
    use roomsync_core::{ManualClock, EARLIER_OPERATION_WINS};
    use roomsync_types::PlayerId;
    use std::collections::BTreeMap;

    const CODE: &str = "ABC123";

    fn room_id() -> RoomId {
        RoomId::new(CODE)
    }

    fn seeded(version: u64, phase: Phase) -> (MemoryStore, SyncLayer<MemoryStore>) {
        let store = MemoryStore::new();
        let mut room = RoomState::with_host(Player::new("alice", "Alice", 0), 0);
        room.players.insert("bob".into(), Player::new("bob", "Bob", 0));
        room.version = Version::new(version);
        room.phase = phase;
        store.seed(&room_id().path(), &room).unwrap();

        let layer = SyncLayer::new(store.clone(), SyncConfig::default());
        (store, layer)
    }

    fn vote(player: &str, value: &str) -> Operation {
        Operation::new(
            OperationType::Vote,
            player,
            0,
            RoomUpdate::vote(player, value, 0),
        )
    }

    fn reveal(player: &str, ts: u64) -> Operation {
        Operation::new(OperationType::Reveal, player, ts, RoomUpdate::reveal())
    }

    fn join(player: &str) -> Operation {
        Operation::new(
            OperationType::Join,
            player,
            0,
            RoomUpdate::join(Player::new(player, player, 0)),
        )
    }

    // ===========================================
    // Read
    // ===========================================

    #[tokio::test]
    async fn read_missing_room_is_not_found() {
        let layer = SyncLayer::new(MemoryStore::new(), SyncConfig::default());
        let err = layer.read(&room_id()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(ref r) if r.as_str() == CODE));
    }

    #[tokio::test]
    async fn read_returns_independent_snapshots() {
        let (_, layer) = seeded(3, Phase::Voting);
        let mut first = layer.read(&room_id()).await.unwrap();
        first.phase = Phase::Finished;
        let second = layer.read(&room_id()).await.unwrap();
        assert_eq!(second.phase, Phase::Voting);
    }

    // ===========================================
    // Write
    // ===========================================

    #[tokio::test]
    async fn write_with_current_version_succeeds() {
        let (store, layer) = seeded(5, Phase::Voting);

        let outcome = layer
            .write(&room_id(), reveal("alice", 100).with_expected_version(Version::new(5)))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                version: Version::new(6),
                conflict: None
            }
        );
        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(stored.version, Version::new(6));
        assert_eq!(stored.phase, Phase::Revealing);
        assert_eq!(stored.last_operation, Some(OperationType::Reveal));
    }

    #[tokio::test]
    async fn stale_reveal_is_told_to_retry_then_succeeds() {
        let (store, layer) = seeded(7, Phase::Voting);
        let stale = reveal("bob", 100).with_expected_version(Version::new(5));

        let err = layer.write(&room_id(), stale.clone()).await.unwrap_err();
        match err {
            SyncError::VersionConflict {
                kind,
                current,
                retry_after,
                ..
            } => {
                assert_eq!(kind, ConflictKind::VersionMismatch);
                assert_eq!(current, Version::new(7));
                assert_eq!(retry_after, Some(Duration::from_millis(1000)));
            }
            other => panic!("expected version conflict, got {:?}", other),
        }
        assert_eq!(store.commit_count(), 0);

        let outcome = layer
            .write(&room_id(), stale.retried(Version::new(7)))
            .await
            .unwrap();
        assert_eq!(outcome.version(), Some(Version::new(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_idempotent_write_retries_internally() {
        let (_, layer) = seeded(7, Phase::Waiting);

        let outcome = layer
            .write(&room_id(), join("carol").with_expected_version(Version::new(5)))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                version: Version::new(8),
                conflict: Some(ConflictKind::VersionMismatch)
            }
        );
        assert_eq!(layer.statistics().await.total_conflicts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_rule_limit() {
        let (store, layer) = seeded(7, Phase::Waiting);
        // Every put loses to a concurrent writer.
        for v in 8..20 {
            let mut other = store.snapshot(&room_id().path()).unwrap();
            other.version = Version::new(v);
            store.interleave_write(&room_id().path(), other);
        }

        let err = layer
            .write(&room_id(), join("carol").with_expected_version(Version::new(7)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::VersionConflict {
                kind: ConflictKind::VersionMismatch,
                retry_after: None,
                ..
            }
        ));
        let history = layer.conflict_history().await;
        let retries = history
            .iter()
            .filter(|r| r.action == roomsync_core::ActionTag::Retry)
            .count();
        assert_eq!(retries, 3);
    }

    #[tokio::test]
    async fn versions_increase_by_one_per_write() {
        let (_, layer) = seeded(1, Phase::Waiting);
        let mut last = Version::new(1);
        for name in ["carol", "dave", "erin", "frank"] {
            let version = layer
                .write(&room_id(), join(name))
                .await
                .unwrap()
                .version()
                .unwrap();
            assert_eq!(Some(version), last.next());
            last = version;
        }
    }

    #[tokio::test]
    async fn stale_reset_never_silently_succeeds() {
        let (store, layer) = seeded(9, Phase::Revealing);
        let stale = Operation::new(OperationType::Reset, "alice", 0, RoomUpdate::reset())
            .with_expected_version(Version::new(4));

        assert!(layer.write(&room_id(), stale).await.is_err());
        assert_eq!(store.snapshot(&room_id().path()).unwrap().version, Version::new(9));
        assert_eq!(layer.statistics().await.total_conflicts, 1);
    }

    #[tokio::test]
    async fn vote_during_reveal_is_rejected_immediately() {
        let (store, layer) = seeded(4, Phase::Revealing);

        let err = layer.write(&room_id(), vote("bob", "8")).await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::OperationRejected { kind: ConflictKind::VoteDuringReveal, ref reason }
                if reason == "cannot vote while revealing"
        ));
        assert_eq!(layer.active_operations().await, 0);
        assert_eq!(layer.pending_batched(&room_id()).await, 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn stale_reset_during_vote_is_not_committed() {
        let (store, layer) = seeded(7, Phase::Voting);
        // Bob's vote stays in flight while it sits in the batch.
        layer.write(&room_id(), vote("bob", "5")).await.unwrap();

        let stale = Operation::new(OperationType::Reset, "alice", 0, RoomUpdate::reset())
            .with_expected_version(Version::new(5));
        let err = layer.write(&room_id(), stale).await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::VersionConflict {
                kind: ConflictKind::VersionMismatch,
                current,
                retry_after: Some(_),
                ..
            } if current == Version::new(7)
        ));
        assert_eq!(store.snapshot(&room_id().path()).unwrap().version, Version::new(7));
        assert_eq!(store.commit_count(), 0);

        let kinds: Vec<ConflictKind> = layer
            .conflict_history()
            .await
            .iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ConflictKind::ResetDuringVote, ConflictKind::VersionMismatch]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_reveals_earliest_wins() {
        let (store, layer) = seeded(3, Phase::Voting);
        store.set_latency(Duration::from_millis(10));
        let other = layer.clone();
        let room = room_id();

        let (early, late) = tokio::join!(
            layer.write(&room, reveal("alice", 100)),
            other.write(&room, reveal("bob", 150)),
        );

        // The winner may or may not see the loser, depending on which of
        // the two is checked first. The loser always sees the winner.
        assert_eq!(early.unwrap().version(), Some(Version::new(4)));
        assert!(matches!(
            late.unwrap_err(),
            SyncError::VersionConflict { kind: ConflictKind::SimultaneousReveal, ref reason, .. }
                if reason == EARLIER_OPERATION_WINS
        ));
        assert_eq!(store.snapshot(&room.path()).unwrap().version, Version::new(4));
        assert_eq!(layer.active_operations().await, 0);
    }

    #[tokio::test]
    async fn overlapping_joins_are_merged() {
        let (store, layer) = seeded(3, Phase::Waiting);
        let layer = layer.with_clock(Arc::new(ManualClock::new(10_000)));
        let rival = Operation::new(
            OperationType::Join,
            "bob",
            10_000,
            RoomUpdate::join(Player::new("carol", "Carol (via bob)", 10_000)),
        );
        layer.active.lock().await.begin(rival, 10_000);

        let mine = Operation::new(
            OperationType::Join,
            "alice",
            10_400,
            RoomUpdate::join(Player::new("carol", "Carol", 10_400)),
        );
        let outcome = layer.write(&room_id(), mine).await.unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                version: Version::new(4),
                conflict: Some(ConflictKind::ConcurrentStateChange)
            }
        );
        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(stored.version, Version::new(4));
        assert_eq!(stored.players[&PlayerId::from("carol")].name, "Carol");
        assert_eq!(stored.merged_by, Some(PlayerId::from("alice")));
        assert_eq!(stored.last_merge, Some(10_400));
        assert_eq!(stored.last_update, 10_000);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_join_retries_then_merges() {
        let (store, layer) = seeded(3, Phase::Waiting);
        let layer = layer.with_clock(Arc::new(ManualClock::new(10_000)));
        let rival = Operation::new(
            OperationType::Join,
            "bob",
            10_000,
            RoomUpdate::join(Player::new("carol", "Carol (via bob)", 10_000)),
        );
        layer.active.lock().await.begin(rival, 10_000);

        let stale = Operation::new(
            OperationType::Join,
            "alice",
            10_400,
            RoomUpdate::join(Player::new("carol", "Carol", 10_400)),
        )
        .with_expected_version(Version::new(2));
        let outcome = layer.write(&room_id(), stale).await.unwrap();

        assert_eq!(outcome.version(), Some(Version::new(4)));
        assert_eq!(store.commit_count(), 1);
        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(stored.merged_by, Some(PlayerId::from("alice")));
        let actions: Vec<(ConflictKind, roomsync_core::ActionTag)> = layer
            .conflict_history()
            .await
            .iter()
            .map(|r| (r.kind, r.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                (ConflictKind::VersionMismatch, roomsync_core::ActionTag::Retry),
                (ConflictKind::ConcurrentStateChange, roomsync_core::ActionTag::Merge),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_race_is_retried_against_the_new_version() {
        let (store, layer) = seeded(3, Phase::Waiting);
        let mut winner = store.snapshot(&room_id().path()).unwrap();
        winner.version = Version::new(4);
        winner.players.insert("dave".into(), Player::new("dave", "Dave", 0));
        store.interleave_write(&room_id().path(), winner);

        let outcome = layer.write(&room_id(), join("carol")).await.unwrap();

        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                version: Version::new(5),
                conflict: Some(ConflictKind::VersionMismatch)
            }
        );
        let stored = store.snapshot(&room_id().path()).unwrap();
        assert!(stored.players.contains_key(&PlayerId::from("carol")));
        assert!(stored.players.contains_key(&PlayerId::from("dave")));
        assert_eq!(layer.statistics().await.total_conflicts, 1);
    }

    #[tokio::test]
    async fn write_to_missing_room_is_an_error() {
        let store = MemoryStore::new();
        let layer = SyncLayer::new(store.clone(), SyncConfig::default());

        let err = layer.write(&room_id(), join("carol")).await.unwrap_err();

        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(store.snapshot(&room_id().path()).is_none());
    }

    #[tokio::test]
    async fn invalid_update_is_refused() {
        let (store, layer) = seeded(1, Phase::Voting);
        let too_long = vote("bob", "12345678901234567");

        let err = layer.write(&room_id(), too_long).await.unwrap_err();

        assert!(matches!(err, SyncError::InvalidUpdate(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_distinct_from_conflicts() {
        let (store, layer) = seeded(1, Phase::Waiting);
        store.fail_next_put("backend down");

        let err = layer.write(&room_id(), join("carol")).await.unwrap_err();

        assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
        assert_eq!(layer.statistics().await.total_conflicts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let (store, _) = seeded(1, Phase::Waiting);
        store.set_latency(Duration::from_secs(10));
        let layer = SyncLayer::new(
            store,
            SyncConfig {
                store_timeout_ms: 100,
                ..SyncConfig::default()
            },
        );

        let err = layer.read(&room_id()).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Timeout)));
    }

    // ===========================================
    // Batching
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn twelve_votes_flush_on_tenth_then_on_timeout() {
        let (store, layer) = seeded(2, Phase::Voting);
        let players = ["p0", "p1", "p2", "p3", "p4", "p5"];

        let mut outcomes = Vec::new();
        for i in 0..12 {
            let player = players[i % players.len()];
            let value = format!("{}", i);
            outcomes.push(layer.write(&room_id(), vote(player, &value)).await.unwrap());
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        // Ten buffered votes became one write with one version increment.
        assert_eq!(
            outcomes[9],
            WriteOutcome::Flushed {
                version: Some(Version::new(3))
            }
        );
        assert!(outcomes[..9]
            .iter()
            .all(|o| matches!(o, WriteOutcome::Batched { .. })));
        assert_eq!(store.commit_count(), 1);

        let after_first = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(after_first.votes[&PlayerId::from("p0")].value, "6");
        assert_eq!(after_first.votes[&PlayerId::from("p3")].value, "9");
        assert_eq!(after_first.votes[&PlayerId::from("p4")].value, "4");

        // The last two are written when their batch times out.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let after_second = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(store.commit_count(), 2);
        assert_eq!(after_second.version, Version::new(4));
        assert_eq!(after_second.votes[&PlayerId::from("p4")].value, "10");
        assert_eq!(after_second.votes[&PlayerId::from("p5")].value, "11");
        assert_eq!(layer.active_operations().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_waits_for_timeout() {
        let (store, layer) = seeded(2, Phase::Voting);
        layer.write(&room_id(), vote("alice", "3")).await.unwrap();
        layer.write(&room_id(), vote("bob", "5")).await.unwrap();
        layer.write(&room_id(), vote("alice", "8")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.commit_count(), 0);
        assert_eq!(layer.pending_batched(&room_id()).await, 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(store.commit_count(), 1);
        assert_eq!(stored.version, Version::new(3));
        assert_eq!(stored.votes[&PlayerId::from("alice")].value, "8");
        assert_eq!(stored.votes[&PlayerId::from("bob")].value, "5");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_buffered_votes() {
        let (store, layer) = seeded(2, Phase::Voting);
        layer.write(&room_id(), vote("bob", "5")).await.unwrap();

        let reset = Operation::new(OperationType::Reset, "alice", 0, RoomUpdate::reset());
        let outcome = layer.write(&room_id(), reset).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                version: Version::new(3),
                conflict: Some(ConflictKind::ResetDuringVote)
            }
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(stored.version, Version::new(3));
        assert!(stored.votes.is_empty());
        assert_eq!(layer.active_operations().await, 0);
    }

    #[tokio::test]
    async fn reveal_writes_buffered_votes_first() {
        let (store, layer) = seeded(2, Phase::Voting);
        let buffered = layer.write(&room_id(), vote("bob", "5")).await.unwrap();
        assert_eq!(buffered, WriteOutcome::Batched { pending: 1 });

        let outcome = layer.write(&room_id(), reveal("alice", 0)).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Committed {
                version: Version::new(4),
                conflict: None
            }
        );

        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(stored.phase, Phase::Revealing);
        assert_eq!(stored.votes[&PlayerId::from("bob")].value, "5");
        assert_eq!(layer.pending_batched(&room_id()).await, 0);
        assert_eq!(layer.active_operations().await, 0);
        assert_eq!(layer.flush_batches().await, 0);
    }

    #[tokio::test]
    async fn votes_overtaken_by_a_remote_reveal_are_reported() {
        let (store, layer) = seeded(2, Phase::Voting);
        let dispatcher = dispatcher();
        let layer = layer.with_dispatcher(dispatcher.clone());
        let errors = record(&dispatcher, events::SYNC_ERROR);
        layer.write(&room_id(), vote("bob", "5")).await.unwrap();

        let remote = SyncLayer::new(store.clone(), SyncConfig::default());
        remote.write(&room_id(), reveal("alice", 0)).await.unwrap();

        assert_eq!(layer.flush_batches().await, 1);
        dispatcher.flush().await.unwrap();

        let stored = store.snapshot(&room_id().path()).unwrap();
        assert_eq!(stored.version, Version::new(3));
        assert!(stored.votes.is_empty());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["player"], json!("bob"));
        assert_eq!(errors[0]["operation"], json!("vote"));
    }

    #[tokio::test]
    async fn batching_can_be_disabled() {
        let (store, _) = seeded(2, Phase::Voting);
        let layer = SyncLayer::new(
            store.clone(),
            SyncConfig {
                batching_enabled: false,
                ..SyncConfig::default()
            },
        );

        let outcome = layer.write(&room_id(), vote("bob", "5")).await.unwrap();
        assert_eq!(outcome.version(), Some(Version::new(3)));
        assert_eq!(store.commit_count(), 1);
    }

    // ===========================================
    // Transactions and rooms
    // ===========================================

    #[tokio::test]
    async fn transaction_commits_and_stamps() {
        let (_, layer) = seeded(4, Phase::Waiting);

        let state = layer
            .transaction(&room_id(), OperationType::Join, |current| {
                assert_eq!(current.version, Version::new(4));
                Some(RoomUpdate::start_voting())
            })
            .await
            .unwrap();

        assert_eq!(state.version, Version::new(5));
        assert_eq!(state.phase, Phase::Voting);
        assert_eq!(state.last_operation, Some(OperationType::Join));
    }

    #[tokio::test]
    async fn transaction_returning_none_aborts() {
        let (store, layer) = seeded(4, Phase::Waiting);

        let err = layer
            .transaction(&room_id(), OperationType::Reset, |_| None)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::TransactionAborted(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn transaction_rejects_invalid_update() {
        let (_, layer) = seeded(4, Phase::Waiting);
        let err = layer
            .transaction(&room_id(), OperationType::Join, |_| {
                Some(RoomUpdate::join(Player::new("carol", "   ", 0)))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidUpdate(_)));
    }

    #[tokio::test]
    async fn transaction_on_missing_room_is_not_found() {
        let layer = SyncLayer::new(MemoryStore::new(), SyncConfig::default());
        let err = layer
            .transaction(&room_id(), OperationType::Join, |_| Some(RoomUpdate::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_room_once() {
        let layer = SyncLayer::new(MemoryStore::new(), SyncConfig::default());

        let state = layer
            .create_room(&room_id(), Player::new("alice", "Alice", 0))
            .await
            .unwrap();
        assert_eq!(state.version, Version::new(1));
        assert!(state.players.contains_key(&PlayerId::from("alice")));

        let err = layer
            .create_room(&room_id(), Player::new("bob", "Bob", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn resolver_rules_come_from_config() {
        let config: Config = toml::from_str(
            r#"
[resolver.rules.vote_during_reveal]
strategy = "ignore"
message = "round closed"
"#,
        )
        .unwrap();
        let (store, _) = seeded(4, Phase::Revealing);
        let layer = SyncLayer::from_config(store, &config).unwrap();

        let err = layer.write(&room_id(), vote("bob", "1")).await.unwrap_err();
        assert!(matches!(err, SyncError::OperationRejected { ref reason, .. } if reason == "round closed"));
    }

    // ===========================================
    // Events
    // ===========================================

    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new(DispatcherConfig {
            policies: BTreeMap::new(),
            ..DispatcherConfig::default()
        })
    }

    fn record(dispatcher: &EventDispatcher, event_type: &str) -> Arc<std::sync::Mutex<Vec<Value>>> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.on(event_type, ListenerOptions::default(), move |event| {
            sink.lock().unwrap().push(event.data.clone());
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn commits_publish_change_events() {
        let (_, layer) = seeded(1, Phase::Waiting);
        let dispatcher = dispatcher();
        let layer = layer.with_dispatcher(dispatcher.clone());
        let rooms = record(&dispatcher, events::ROOM_UPDATED);
        let players = record(&dispatcher, events::PLAYERS_UPDATED);
        let phases = record(&dispatcher, events::PHASE_CHANGED);

        layer.write(&room_id(), join("carol")).await.unwrap();
        dispatcher.flush().await.unwrap();

        let rooms = rooms.lock().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0]["version"], json!(2));
        assert_eq!(rooms[0]["operation"], json!("join"));
        assert_eq!(players.lock().unwrap().len(), 1);
        assert!(phases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicts_and_errors_are_published() {
        let (_, layer) = seeded(1, Phase::Revealing);
        let dispatcher = dispatcher();
        let layer = layer.with_dispatcher(dispatcher.clone());
        let resolved = record(&dispatcher, events::CONFLICT_RESOLVED);
        let errors = record(&dispatcher, events::SYNC_ERROR);

        let _ = layer.write(&room_id(), vote("bob", "3")).await;
        dispatcher.flush().await.unwrap();

        let resolved = resolved.lock().unwrap();
        assert_eq!(resolved[0]["kind"], json!("vote_during_reveal"));
        assert_eq!(resolved[0]["action"], json!("reject"));
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watched_room_forwards_remote_writes_once() {
        let (store, layer) = seeded(1, Phase::Waiting);
        let dispatcher = dispatcher();
        let watcher = layer.with_dispatcher(dispatcher.clone());
        let rooms = record(&dispatcher, events::ROOM_UPDATED);
        let task = watcher.watch_room(&room_id());

        // Another client on the same backend.
        let remote = SyncLayer::new(store.clone(), SyncConfig::default());
        remote.write(&room_id(), join("carol")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // And a local write, seen both directly and through the watch.
        watcher.write(&room_id(), join("dave")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.flush().await.unwrap();

        let versions: Vec<Value> = rooms
            .lock()
            .unwrap()
            .iter()
            .map(|e| e["version"].clone())
            .collect();
        assert_eq!(versions, vec![json!(2), json!(3)]);
        task.abort();
    }
}
