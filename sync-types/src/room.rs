//! The shared room record and its parts.
//!
//! A [`RoomState`] is a plain value: every read from the store yields a fresh
//! snapshot, and every mutation produces a new value. Comparison is structural
//! (derived `PartialEq`), so two snapshots are equal exactly when their
//! contents are.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{OperationType, PlayerId, RoomError, Version};

/// Lifecycle phase of an estimation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Room created, round not started.
    #[default]
    Waiting,
    /// Players are casting votes.
    Voting,
    /// Votes are being shown.
    Revealing,
    /// Session closed.
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Waiting => "waiting",
            Phase::Voting => "voting",
            Phase::Revealing => "revealing",
            Phase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A participant in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Stable player identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Unix timestamp (ms) of joining.
    pub joined_at: u64,
    /// Spectators are listed but do not vote.
    #[serde(default)]
    pub spectator: bool,
}

impl Player {
    /// Create a voting player.
    pub fn new(id: impl Into<PlayerId>, name: &str, joined_at: u64) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            joined_at,
            spectator: false,
        }
    }
}

/// A single card played by a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Card value ("1", "3", "?", ...).
    pub value: String,
    /// Unix timestamp (ms) the card was played.
    pub cast_at: u64,
}

impl Vote {
    /// Create a vote.
    pub fn new(value: &str, cast_at: u64) -> Self {
        Self {
            value: value.to_string(),
            cast_at,
        }
    }
}

/// Full state of one voting session, as held by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomState {
    /// Optimistic-lock version, incremented by exactly one per commit.
    pub version: Version,
    /// Current round phase.
    pub phase: Phase,
    /// Roster, ordered by player id.
    pub players: BTreeMap<PlayerId, Player>,
    /// Cast votes, keyed by voter.
    pub votes: BTreeMap<PlayerId, Vote>,
    /// Unix timestamp (ms) of the last commit.
    pub last_update: u64,
    /// Operation type of the last commit.
    pub last_operation: Option<OperationType>,
    /// Player whose operation was last applied through a merge resolution.
    #[serde(default)]
    pub merged_by: Option<PlayerId>,
    /// Unix timestamp (ms) of the last merge resolution.
    #[serde(default)]
    pub last_merge: Option<u64>,
}

impl RoomState {
    /// Create an empty room at version zero.
    pub fn new(created_at: u64) -> Self {
        Self {
            last_update: created_at,
            ..Self::default()
        }
    }

    /// Create a room with its first player already seated.
    pub fn with_host(host: Player, created_at: u64) -> Self {
        let mut room = Self::new(created_at);
        room.players.insert(host.id.clone(), host);
        room
    }

    /// Stamp this value as the commit following `base`.
    ///
    /// Sets `version = base + 1` and the commit metadata. The caller decides
    /// which version it read; the store decides whether that read is still
    /// current.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::VersionExhausted`] if `base` has no successor.
    pub fn committed(
        mut self,
        base: Version,
        operation: OperationType,
        now_ms: u64,
    ) -> Result<Self, RoomError> {
        self.version = base
            .next()
            .ok_or(RoomError::VersionExhausted(base.value()))?;
        self.last_update = now_ms;
        self.last_operation = Some(operation);
        Ok(self)
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RoomError> {
        rmp_serde::to_vec_named(self).map_err(RoomError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoomError> {
        rmp_serde::from_slice(bytes).map_err(RoomError::Deserialization)
    }
}
