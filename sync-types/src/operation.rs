//! Proposed mutations submitted by clients.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{OperationId, PlayerId, RoomUpdate, Version};

/// What a client is trying to do to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Cast or change a vote.
    Vote,
    /// Show all votes.
    Reveal,
    /// Clear votes and start a new round.
    Reset,
    /// Enter the room.
    Join,
    /// Leave the room.
    Leave,
    /// Presence keep-alive.
    Heartbeat,
    /// Derived statistics written back by a client.
    Statistics,
}

impl OperationType {
    /// Fixed precedence used by priority-based conflict resolution.
    ///
    /// reveal=10 > reset=8 > vote=5 > join=3 > leave=2 > background writes=1.
    pub fn priority(&self) -> u8 {
        match self {
            OperationType::Reveal => 10,
            OperationType::Reset => 8,
            OperationType::Vote => 5,
            OperationType::Join => 3,
            OperationType::Leave => 2,
            OperationType::Heartbeat | OperationType::Statistics => 1,
        }
    }

    /// Whether writes of this type are buffered and merged per room.
    pub fn is_batchable(&self) -> bool {
        matches!(
            self,
            OperationType::Vote | OperationType::Heartbeat | OperationType::Statistics
        )
    }

    /// Whether replaying this operation against a newer state is harmless.
    ///
    /// Idempotent operations may be re-applied after a version mismatch
    /// without asking the caller; reveal and reset change the round and must
    /// be confirmed by the caller against fresh state.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, OperationType::Reveal | OperationType::Reset)
    }

    /// Lowercase name, as used in event payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Vote => "vote",
            OperationType::Reveal => "reveal",
            OperationType::Reset => "reset",
            OperationType::Join => "join",
            OperationType::Leave => "leave",
            OperationType::Heartbeat => "heartbeat",
            OperationType::Statistics => "statistics",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single proposed mutation from one client.
///
/// Consumed exactly once by the sync layer and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Generated identifier, used by the active-operation registry.
    pub id: OperationId,
    /// What the operation does.
    pub op_type: OperationType,
    /// Who submitted it.
    pub player_id: PlayerId,
    /// Client timestamp (ms).
    pub timestamp: u64,
    /// Version the client last observed, if it wants a compare-and-swap.
    pub expected_version: Option<Version>,
    /// How many times this operation has already been retried.
    pub attempt: u32,
    /// The typed change to apply.
    pub payload: RoomUpdate,
}

impl Operation {
    /// Create a first-attempt operation without a version expectation.
    pub fn new(
        op_type: OperationType,
        player_id: impl Into<PlayerId>,
        timestamp: u64,
        payload: RoomUpdate,
    ) -> Self {
        Self {
            id: OperationId::new(),
            op_type,
            player_id: player_id.into(),
            timestamp,
            expected_version: None,
            attempt: 0,
            payload,
        }
    }

    /// Require the room to be at `version` when this operation is applied.
    pub fn with_expected_version(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// The same operation resubmitted against `version`.
    pub fn retried(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self.attempt = self.attempt.saturating_add(1);
        self
    }
}
