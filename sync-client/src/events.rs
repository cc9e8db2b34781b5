//! Event type names published by the sync layer.

/// A room record changed (local commit or remote write).
pub const ROOM_UPDATED: &str = "room-updated";

/// The roster changed.
pub const PLAYERS_UPDATED: &str = "players-updated";

/// Votes were cast, changed or cleared.
pub const VOTES_UPDATED: &str = "votes-updated";

/// The round phase changed.
pub const PHASE_CHANGED: &str = "phase-changed";

/// A conflict was detected and resolved.
pub const CONFLICT_RESOLVED: &str = "conflict-resolved";

/// A write or flush failed.
pub const SYNC_ERROR: &str = "sync-error";
