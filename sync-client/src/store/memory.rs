//! In-process store for tests and the simulator.
//!
//! Holds MessagePack-encoded records, so every read is a fresh decoded
//! snapshot, exactly like a remote backend. Failures and latency can be
//! injected to exercise the error paths of the sync layer.

use super::{PutOutcome, RoomStore, StoreError, TransactFn, TransactOutcome};
use async_trait::async_trait;
use roomsync_types::{RoomState, Version};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default number of attempts `transact()` makes before giving up.
pub const DEFAULT_TRANSACT_RETRIES: u32 = 5;

const WATCH_CAPACITY: usize = 64;

/// In-memory [`RoomStore`].
///
/// Clones share the same records, so several sync layers built on clones of
/// one store behave like clients of one backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    records: HashMap<String, Vec<u8>>,
    watchers: HashMap<String, broadcast::Sender<RoomState>>,
    latency: Option<Duration>,
    transact_retries: Option<u32>,
    commits: u64,
    fail_next_get: Option<String>,
    fail_next_put: Option<String>,
    fail_next_transact: Option<String>,
    // Writes applied right before the next put/transact commit, to simulate
    // another client winning the race.
    interleave: Vec<(String, RoomState)>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `state` at `path` directly, bypassing version checks.
    pub fn seed(&self, path: &str, state: &RoomState) -> Result<(), StoreError> {
        let bytes = state.to_bytes()?;
        self.lock().records.insert(path.to_string(), bytes);
        Ok(())
    }

    /// Decoded value at `path`, without latency or failure injection.
    pub fn snapshot(&self, path: &str) -> Option<RoomState> {
        let inner = self.lock();
        inner
            .records
            .get(path)
            .and_then(|b| RoomState::from_bytes(b).ok())
    }

    /// Delay every async call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Override how many attempts `transact()` makes.
    pub fn set_transact_retries(&self, attempts: u32) {
        self.lock().transact_retries = Some(attempts);
    }

    /// Number of values committed by `put()` or `transact()`.
    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    /// Cause the next get() to fail with the given error.
    pub fn fail_next_get(&self, error: &str) {
        self.lock().fail_next_get = Some(error.to_string());
    }

    /// Cause the next put() to fail with the given error.
    pub fn fail_next_put(&self, error: &str) {
        self.lock().fail_next_put = Some(error.to_string());
    }

    /// Cause the next transact() to fail with the given error.
    pub fn fail_next_transact(&self, error: &str) {
        self.lock().fail_next_transact = Some(error.to_string());
    }

    /// Commit `state` at `path` just before the next put or transact commit
    /// check, as if another client had written in between.
    ///
    /// Queued writes are applied one per check, in order.
    pub fn interleave_write(&self, path: &str, state: RoomState) {
        self.lock().interleave.push((path.to_string(), state));
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn stored_version(inner: &MemoryStoreInner, path: &str) -> Result<Option<Version>, StoreError> {
        match inner.records.get(path) {
            Some(bytes) => Ok(Some(RoomState::from_bytes(bytes)?.version)),
            None => Ok(None),
        }
    }

    fn commit(inner: &mut MemoryStoreInner, path: &str, value: &RoomState) -> Result<(), StoreError> {
        let bytes = value.to_bytes()?;
        inner.records.insert(path.to_string(), bytes);
        inner.commits += 1;
        if let Some(tx) = inner.watchers.get(path) {
            // No receivers is fine.
            let _ = tx.send(value.clone());
        }
        Ok(())
    }

    fn apply_interleaved(inner: &mut MemoryStoreInner) -> Result<(), StoreError> {
        if inner.interleave.is_empty() {
            return Ok(());
        }
        let (path, state) = inner.interleave.remove(0);
        Self::commit(inner, &path, &state)
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<RoomState>, StoreError> {
        self.delay().await;
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_get.take() {
            return Err(StoreError::Unavailable(error));
        }

        match inner.records.get(path) {
            Some(bytes) => Ok(Some(RoomState::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        path: &str,
        value: RoomState,
        expected: Option<Version>,
    ) -> Result<PutOutcome, StoreError> {
        self.delay().await;
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_put.take() {
            return Err(StoreError::Unavailable(error));
        }
        Self::apply_interleaved(&mut inner)?;

        let current = Self::stored_version(&inner, path)?;
        if let Some(expected) = expected {
            if current != Some(expected) {
                return Ok(PutOutcome {
                    success: false,
                    version: current.unwrap_or_default(),
                });
            }
        }

        let version = value.version;
        Self::commit(&mut inner, path, &value)?;
        Ok(PutOutcome {
            success: true,
            version,
        })
    }

    async fn transact(
        &self,
        path: &str,
        update: &mut TransactFn<'_>,
    ) -> Result<TransactOutcome, StoreError> {
        self.delay().await;
        let attempts = {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_next_transact.take() {
                return Err(StoreError::Unavailable(error));
            }
            inner.transact_retries.unwrap_or(DEFAULT_TRANSACT_RETRIES)
        };

        for _ in 0..attempts {
            let snapshot = {
                let inner = self.lock();
                match inner.records.get(path) {
                    Some(bytes) => Some(RoomState::from_bytes(bytes)?),
                    None => None,
                }
            };
            let base = snapshot.as_ref().map(|s| s.version);

            // The closure runs without the lock held.
            let Some(next) = update(snapshot.as_ref()) else {
                return Ok(TransactOutcome {
                    committed: false,
                    value: snapshot,
                });
            };

            let mut inner = self.lock();
            Self::apply_interleaved(&mut inner)?;
            if Self::stored_version(&inner, path)? != base {
                tracing::debug!("Transaction on {} lost a race, retrying", path);
                continue;
            }
            Self::commit(&mut inner, path, &next)?;
            return Ok(TransactOutcome {
                committed: true,
                value: Some(next),
            });
        }

        Err(StoreError::Contended { attempts })
    }

    fn watch(&self, path: &str) -> broadcast::Receiver<RoomState> {
        let mut inner = self.lock();
        inner
            .watchers
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .subscribe()
    }
}
