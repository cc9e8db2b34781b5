//! Typed room updates.
//!
//! Every mutation of a [`RoomState`] is expressed as a [`RoomUpdate`]: an
//! explicit list of field changes that is validated before it is applied.
//! Nothing is merged in by shape, so an update can only touch what it names.
//!
//! Two updates merge key-wise: the later update wins for every player key it
//! touches, keys only the earlier update touched are kept.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Phase, Player, PlayerId, RoomError, RoomState, Vote};

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// Longest accepted card value, in characters.
pub const MAX_VOTE_LEN: usize = 16;

/// An explicit set of field changes to a room.
///
/// Application order is: phase, `clear_votes`, removals, then upserts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomUpdate {
    /// New phase, if the update changes it.
    pub phase: Option<Phase>,
    /// Players to insert or replace.
    pub upsert_players: BTreeMap<PlayerId, Player>,
    /// Players to remove.
    pub remove_players: BTreeSet<PlayerId>,
    /// Votes to insert or replace.
    pub upsert_votes: BTreeMap<PlayerId, Vote>,
    /// Votes to remove.
    pub remove_votes: BTreeSet<PlayerId>,
    /// Drop every vote before applying the vote upserts.
    pub clear_votes: bool,
}

impl RoomUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cast (or change) `player`'s vote.
    pub fn vote(player: impl Into<PlayerId>, value: &str, cast_at: u64) -> Self {
        let mut update = Self::new();
        update
            .upsert_votes
            .insert(player.into(), Vote::new(value, cast_at));
        update
    }

    /// Start a voting round.
    pub fn start_voting() -> Self {
        Self {
            phase: Some(Phase::Voting),
            ..Self::default()
        }
    }

    /// Show all votes.
    pub fn reveal() -> Self {
        Self {
            phase: Some(Phase::Revealing),
            ..Self::default()
        }
    }

    /// Clear the votes and start a new round.
    pub fn reset() -> Self {
        Self {
            phase: Some(Phase::Voting),
            clear_votes: true,
            ..Self::default()
        }
    }

    /// Seat a player.
    pub fn join(player: Player) -> Self {
        let mut update = Self::new();
        update.upsert_players.insert(player.id.clone(), player);
        update
    }

    /// Remove a player together with their vote.
    pub fn leave(player: impl Into<PlayerId>) -> Self {
        let player = player.into();
        let mut update = Self::new();
        update.remove_votes.insert(player.clone());
        update.remove_players.insert(player);
        update
    }

    /// Whether applying this update would leave any room unchanged.
    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.upsert_players.is_empty()
            && self.remove_players.is_empty()
            && self.upsert_votes.is_empty()
            && self.remove_votes.is_empty()
            && !self.clear_votes
    }

    /// Whether the update writes any vote.
    pub fn touches_votes(&self) -> bool {
        !self.upsert_votes.is_empty() || !self.remove_votes.is_empty() || self.clear_votes
    }

    /// Whether this update and `other` write any common part of the room.
    ///
    /// Updates touching disjoint player keys commute, so applying them in
    /// either order yields the same room.
    pub fn overlaps(&self, other: &RoomUpdate) -> bool {
        if self.phase.is_some() && other.phase.is_some() {
            return true;
        }
        if (self.clear_votes && other.touches_votes()) || (other.clear_votes && self.touches_votes())
        {
            return true;
        }

        let players = |u: &RoomUpdate| -> BTreeSet<PlayerId> {
            u.upsert_players
                .keys()
                .chain(u.remove_players.iter())
                .cloned()
                .collect()
        };
        let votes = |u: &RoomUpdate| -> BTreeSet<PlayerId> {
            u.upsert_votes
                .keys()
                .chain(u.remove_votes.iter())
                .cloned()
                .collect()
        };

        !players(self).is_disjoint(&players(other)) || !votes(self).is_disjoint(&votes(other))
    }

    /// Copy of this update with every vote upsert dropped.
    pub fn without_vote_upserts(&self) -> Self {
        Self {
            upsert_votes: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Check the update against the room schema.
    pub fn validate(&self) -> Result<(), RoomError> {
        for (id, player) in &self.upsert_players {
            if *id != player.id {
                return Err(RoomError::InvalidUpdate(format!(
                    "player keyed as {} carries id {}",
                    id, player.id
                )));
            }
            let name = player.name.trim();
            if name.is_empty() {
                return Err(RoomError::InvalidUpdate(format!(
                    "player {} has an empty name",
                    id
                )));
            }
            if name.chars().count() > MAX_NAME_LEN {
                return Err(RoomError::InvalidUpdate(format!(
                    "player {} name exceeds {} characters",
                    id, MAX_NAME_LEN
                )));
            }
            if self.remove_players.contains(id) {
                return Err(RoomError::InvalidUpdate(format!(
                    "player {} is both added and removed",
                    id
                )));
            }
        }

        for (id, vote) in &self.upsert_votes {
            let value = vote.value.trim();
            if value.is_empty() {
                return Err(RoomError::InvalidUpdate(format!(
                    "vote from {} has no value",
                    id
                )));
            }
            if value.chars().count() > MAX_VOTE_LEN {
                return Err(RoomError::InvalidUpdate(format!(
                    "vote from {} exceeds {} characters",
                    id, MAX_VOTE_LEN
                )));
            }
            if self.remove_votes.contains(id) {
                return Err(RoomError::InvalidUpdate(format!(
                    "vote from {} is both cast and removed",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Produce the state that results from applying this update to `room`.
    ///
    /// Commit metadata (version, timestamps) is left untouched; see
    /// [`RoomState::committed`].
    pub fn apply(&self, room: &RoomState) -> RoomState {
        let mut next = room.clone();

        if let Some(phase) = self.phase {
            next.phase = phase;
        }
        if self.clear_votes {
            next.votes.clear();
        }
        for id in &self.remove_players {
            next.players.remove(id);
        }
        for id in &self.remove_votes {
            next.votes.remove(id);
        }
        for (id, player) in &self.upsert_players {
            next.players.insert(id.clone(), player.clone());
        }
        for (id, vote) in &self.upsert_votes {
            next.votes.insert(id.clone(), vote.clone());
        }

        next
    }

    /// Fold a later update into this one, last write wins per key.
    pub fn merge(mut self, later: RoomUpdate) -> RoomUpdate {
        if later.phase.is_some() {
            self.phase = later.phase;
        }

        for id in later.remove_players {
            self.upsert_players.remove(&id);
            self.remove_players.insert(id);
        }
        for (id, player) in later.upsert_players {
            self.remove_players.remove(&id);
            self.upsert_players.insert(id, player);
        }

        if later.clear_votes {
            self.clear_votes = true;
            self.upsert_votes.clear();
            self.remove_votes.clear();
        }
        for id in later.remove_votes {
            self.upsert_votes.remove(&id);
            self.remove_votes.insert(id);
        }
        for (id, vote) in later.upsert_votes {
            self.remove_votes.remove(&id);
            self.upsert_votes.insert(id, vote);
        }

        self
    }
}
