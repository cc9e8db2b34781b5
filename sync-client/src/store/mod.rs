//! Remote store abstraction for roomsync.
//!
//! The sync layer needs four primitives from whatever holds the room
//! records: a read, a compare-and-swap write, an atomic read-modify-write,
//! and a change feed. Any backend that offers compare-and-set on a version
//! field and change notification satisfies [`RoomStore`].
//!
//! # Design
//!
//! - `get()` returns an immutable snapshot, or `None` when the path is empty
//! - `put()` writes only if the stored version equals the expected one
//! - `transact()` runs a closure against the current value and commits its
//!   result atomically, retrying internally on concurrent mutation
//! - `watch()` hands out a receiver of committed values; dropping it
//!   unsubscribes
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let room = store.get("rooms/ABC123").await?;
//! let outcome = store.put("rooms/ABC123", next, Some(room.version)).await?;
//! ```

mod memory;

pub use memory::{MemoryStore, DEFAULT_TRANSACT_RETRIES};

use async_trait::async_trait;
use roomsync_types::{RoomError, RoomState, Version};
use thiserror::Error;
use tokio::sync::broadcast;

/// Store errors.
///
/// These are infrastructure failures. A compare-and-swap that loses a race
/// is not an error; see [`PutOutcome`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store unreachable or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete in time.
    #[error("store call timed out")]
    Timeout,

    /// A transaction kept losing to concurrent writers.
    #[error("transaction contended after {attempts} attempts")]
    Contended {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] RoomError),
}

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Whether the value was written.
    pub success: bool,
    /// Stored version after the call (the new one on success, the
    /// conflicting one otherwise).
    pub version: Version,
}

/// Result of a read-modify-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactOutcome {
    /// Whether a value was committed.
    pub committed: bool,
    /// The committed value, or the value the closure declined to change.
    pub value: Option<RoomState>,
}

/// Closure run by [`RoomStore::transact`].
///
/// Receives the current value (`None` when absent) and returns the value to
/// commit, or `None` to abort. It may run more than once.
pub type TransactFn<'a> = dyn FnMut(Option<&RoomState>) -> Option<RoomState> + Send + 'a;

/// Remote store holding versioned room records.
#[async_trait]
pub trait RoomStore: Send + Sync + 'static {
    /// Read the value at `path`.
    async fn get(&self, path: &str) -> Result<Option<RoomState>, StoreError>;

    /// Write `value` at `path`.
    ///
    /// With `expected` set, the write only happens if the stored version
    /// equals it (an absent record never matches). Without it, the write is
    /// unconditional.
    async fn put(
        &self,
        path: &str,
        value: RoomState,
        expected: Option<Version>,
    ) -> Result<PutOutcome, StoreError>;

    /// Atomically replace the value at `path` with `update(current)`.
    async fn transact(
        &self,
        path: &str,
        update: &mut TransactFn<'_>,
    ) -> Result<TransactOutcome, StoreError>;

    /// Subscribe to values committed at `path`.
    fn watch(&self, path: &str) -> broadcast::Receiver<RoomState>;
}
