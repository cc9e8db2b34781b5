//! # sync-client
//!
//! Client library for roomsync, real-time shared state for estimation rooms.
//!
//! This is the library applications use to read and write room records.
//!
//! ## Features
//!
//! - **Versioned writes**: every commit is a compare-and-swap on the room version
//! - **Conflict resolution**: concurrent reveals, resets and votes settled by rule
//! - **Write batching**: votes and heartbeats merged per room before writing
//! - **Event dispatch**: prioritized listeners with throttling, dedupe and retries
//! - **Store abstraction**: pluggable backend behind [`RoomStore`] (memory store included)
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{EventDispatcher, MemoryStore, SyncLayer, Config};
//!
//! let config = Config::default();
//! let dispatcher = EventDispatcher::new(config.dispatcher.clone());
//! let layer = SyncLayer::from_config(MemoryStore::new(), &config)?
//!     .with_dispatcher(dispatcher.clone());
//!
//! dispatcher.on("votes-updated", ListenerOptions::default(), |event| {
//!     println!("{}", event.data);
//!     Ok(())
//! });
//!
//! layer.write(&room, vote).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod store;
pub mod sync;

pub use clock::TokioClock;
pub use config::{Config, ConfigError, DispatcherConfig, ResolverConfig, SyncConfig};
pub use dispatcher::{
    AbandonedEvent, DispatchError, DispatcherStatistics, EventDispatcher, ListenerError,
    ListenerInfo, ListenerOptions, Subscription,
};
pub use store::{
    MemoryStore, PutOutcome, RoomStore, StoreError, TransactFn, TransactOutcome,
    DEFAULT_TRANSACT_RETRIES,
};
pub use sync::{SyncError, SyncLayer, WriteOutcome};
