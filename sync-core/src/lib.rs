//! # sync-core
//!
//! Pure logic for roomsync (no I/O, instant tests).
//!
//! This crate holds the decision-making parts of room synchronization:
//! conflict detection and resolution, in-flight operation bookkeeping,
//! write batching, and the filter/batch state behind the event dispatcher.
//!
//! ## Design Philosophy
//!
//! Nothing here sleeps, spawns or talks to a store. Time comes in as a
//! millisecond value (see [`Clock`]) and decisions come out as values
//! ([`Resolution`], [`BatchSignal`], [`Admission`]). `sync-client` owns the
//! runtime and acts on them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod clock;
pub mod dispatch;
pub mod registry;
pub mod resolver;
pub mod rules;

pub use batch::{
    BatchQueue, BatchSignal, PendingBatch, DEFAULT_BATCH_TIMEOUT, DEFAULT_MAX_BATCH_SIZE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{
    Admission, Event, EventBatcher, EventFilter, EventPolicy, MergeRule, Priority,
    DEFAULT_EVENT_BATCH_TIMEOUT_MS, DEFAULT_MAX_BATCHED_EVENTS,
};
pub use registry::{ActiveOperations, DEFAULT_OPERATION_TTL};
pub use resolver::{
    ActionTag, Conflict, ConflictResolver, HistoryRecord, Resolution, ResolutionAction,
    ResolverStatistics, CONCURRENCY_WINDOW_MS, DEFAULT_HISTORY_CAPACITY, EARLIER_OPERATION_WINS,
};
pub use rules::{default_rules, ConflictKind, ResolutionRule, ResolutionStrategy};
