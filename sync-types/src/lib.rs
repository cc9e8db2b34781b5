//! # sync-types
//!
//! Value types for roomsync, the synchronization layer of a collaborative
//! estimation tool.
//!
//! This crate provides the foundational types used across all roomsync crates:
//! - [`RoomId`], [`PlayerId`], [`OperationId`], [`ListenerId`], [`Version`] - Identity and ordering types
//! - [`RoomState`] - The shared room record, an immutable snapshot value
//! - [`Operation`] - A proposed mutation from one client
//! - [`RoomUpdate`] - Typed, validated field changes
//! - [`RoomError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod operation;
mod room;
mod update;

pub use error::RoomError;
pub use ids::{ListenerId, OperationId, PlayerId, RoomId, Version};
pub use operation::{Operation, OperationType};
pub use room::{Phase, Player, RoomState, Vote};
pub use update::{RoomUpdate, MAX_NAME_LEN, MAX_VOTE_LEN};
