//! EventDispatcher - prioritized publish/subscribe for roomsync.
//!
//! Producers call [`EventDispatcher::emit`], which never blocks: the event
//! goes into a bounded queue, or is dropped and counted when the queue is
//! full. A single consumer task drains the queue and, per event type:
//!
//! 1. drops a payload equal to the previous one (dedupe),
//! 2. drops events inside the throttle window of the last accepted one,
//! 3. buffers batchable types and merges them on flush,
//! 4. calls every listener of the type, highest priority first.
//!
//! ```text
//! emit() → queue → filter → [batcher] → listeners
//!                                          ↓ error
//!                                   retry (fixed delay) → quarantine
//! ```
//!
//! A failing listener is retried on its own, off the consumer task, and
//! never affects other listeners or the emitter. After the configured number
//! of retries the event is abandoned for that listener and kept in a
//! bounded quarantine.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use roomsync_core::{Admission, Clock, Event, EventBatcher, EventFilter, EventPolicy, Priority};
use roomsync_types::ListenerId;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::TokioClock;
use crate::config::DispatcherConfig;

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue was full and the event was dropped.
    #[error("event queue full (capacity: {capacity}), dropped {event_type}")]
    QueueOverflow {
        /// Queue capacity.
        capacity: usize,
        /// Type of the dropped event.
        event_type: String,
    },

    /// The dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Closed,
}

/// Error returned by a listener callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    /// The callback reported a failure.
    #[error("listener failed: {0}")]
    Failed(String),

    /// The callback panicked.
    #[error("listener panicked: {0}")]
    Panicked(String),
}

impl ListenerError {
    /// A failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        ListenerError::Failed(message.into())
    }
}

/// Listener callback.
pub type ListenerFn = dyn Fn(&Event) -> Result<(), ListenerError> + Send + Sync;

/// Options given at subscription time.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Call order among listeners of the same type.
    pub priority: Priority,
    /// Throttle window for the event type, in ms (0 = off).
    pub throttle_ms: u64,
    /// Drop consecutive equal payloads of the event type.
    pub dedupe: bool,
    /// Batch the event type.
    pub batchable: bool,
    /// Remove the listener after this long without being called.
    pub idle_timeout: Option<Duration>,
}

impl ListenerOptions {
    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the throttle window.
    pub fn with_throttle(mut self, window: Duration) -> Self {
        self.throttle_ms = window.as_millis() as u64;
        self
    }

    /// Enable the duplicate filter.
    pub fn deduplicated(mut self) -> Self {
        self.dedupe = true;
        self
    }

    /// Enable batching.
    pub fn batched(mut self) -> Self {
        self.batchable = true;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn policy(&self) -> EventPolicy {
        EventPolicy {
            throttle_ms: self.throttle_ms,
            dedupe: self.dedupe,
            batchable: self.batchable,
            ..EventPolicy::default()
        }
    }
}

struct Listener {
    id: ListenerId,
    event_type: String,
    options: ListenerOptions,
    callback: Box<ListenerFn>,
    active: AtomicBool,
    call_count: AtomicU64,
    error_count: AtomicU64,
    last_active: AtomicU64,
}

impl Listener {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            event_type: self.event_type.clone(),
            priority: self.options.priority,
            call_count: self.call_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("priority", &self.options.priority)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    /// Listener id.
    pub id: ListenerId,
    /// Subscribed event type.
    pub event_type: String,
    /// Priority.
    pub priority: Priority,
    /// Invocations, retries included.
    pub call_count: u64,
    /// Failed invocations.
    pub error_count: u64,
}

/// An event given up on for one listener.
#[derive(Debug, Clone)]
pub struct AbandonedEvent {
    /// The listener that kept failing.
    pub listener: ListenerId,
    /// The event.
    pub event: Event,
    /// Retries made after the first failure.
    pub retries: u32,
    /// The last failure.
    pub last_error: ListenerError,
}

/// Operational counters.
///
/// All counters are monotonically increasing.
#[derive(Debug, Default)]
struct DispatcherMetrics {
    emitted: AtomicU64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    throttled: AtomicU64,
    batched: AtomicU64,
    overflowed: AtomicU64,
    listener_calls: AtomicU64,
    listener_errors: AtomicU64,
    retries: AtomicU64,
    abandoned: AtomicU64,
    pruned_listeners: AtomicU64,
}

/// Snapshot of the dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStatistics {
    /// Events accepted into the queue.
    pub emitted: u64,
    /// Events handed to listeners (a merged batch counts once).
    pub processed: u64,
    /// Events dropped by the duplicate filter.
    pub duplicates: u64,
    /// Events dropped by the throttle.
    pub throttled: u64,
    /// Events that went through a batch.
    pub batched: u64,
    /// Events dropped because the queue was full.
    pub overflowed: u64,
    /// Listener invocations, retries included.
    pub listener_calls: u64,
    /// Failed listener invocations.
    pub listener_errors: u64,
    /// Retry invocations.
    pub retries: u64,
    /// Events abandoned after exhausting retries.
    pub abandoned: u64,
    /// Listeners removed for being idle.
    pub pruned_listeners: u64,
    /// Listeners currently registered.
    pub listeners: usize,
}

impl DispatcherStatistics {
    /// Percentage of listener invocations that succeeded (0 when there were none).
    pub fn success_rate(&self) -> f64 {
        if self.listener_calls == 0 {
            return 0.0;
        }
        let ok = self.listener_calls.saturating_sub(self.listener_errors);
        ok as f64 / self.listener_calls as f64 * 100.0
    }
}

enum Command {
    Emit(Event),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct Shared {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    /// Listeners per event type, highest priority first.
    listeners: DashMap<String, Vec<Arc<Listener>>>,
    policies: DashMap<String, EventPolicy>,
    metrics: DispatcherMetrics,
    quarantine: Mutex<VecDeque<AbandonedEvent>>,
}

/// Handle to the dispatcher.
///
/// Cheap to clone; clones share listeners, queue and counters. Must be
/// created inside a Tokio runtime.
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &self.shared.config)
            .field("event_types", &self.shared.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Unsubscribe handle returned by [`EventDispatcher::on`].
///
/// Dropping it keeps the listener registered.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: ListenerId,
    shared: Weak<Shared>,
}

impl Subscription {
    /// The listener id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.remove_listener(self.id))
    }
}

impl EventDispatcher {
    /// Start a dispatcher using the Tokio clock.
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock::new()))
    }

    /// Start a dispatcher reading time from `clock`.
    pub fn with_clock(config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let policies = DashMap::new();
        for (event_type, policy) in &config.policies {
            policies.insert(event_type.clone(), policy.clone());
        }

        let shared = Arc::new(Shared {
            config,
            clock,
            listeners: DashMap::new(),
            policies,
            metrics: DispatcherMetrics::default(),
            quarantine: Mutex::new(VecDeque::new()),
        });

        let worker = tokio::spawn(run_consumer(Arc::clone(&shared), rx));
        tracing::debug!(
            "Event dispatcher started (queue capacity: {})",
            shared.config.queue_capacity
        );

        Self {
            shared,
            tx,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Register `callback` for `event_type`.
    ///
    /// The listener is placed after every existing listener of equal or
    /// higher priority, so equal priorities keep registration order.
    pub fn on<F>(&self, event_type: &str, options: ListenerOptions, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let listener = Arc::new(Listener {
            id: ListenerId::new(),
            event_type: event_type.to_string(),
            options,
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_active: AtomicU64::new(self.shared.clock.now_ms()),
        });
        let id = listener.id;

        let mut entry = self
            .shared
            .listeners
            .entry(event_type.to_string())
            .or_default();
        let priority = listener.options.priority;
        let position = entry.partition_point(|l| l.options.priority >= priority);
        entry.insert(position, listener);

        tracing::debug!(
            "Registered listener {} for {} ({:?}, {} total)",
            id,
            event_type,
            priority,
            entry.len()
        );

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.remove_listener(id)
    }

    /// Queue an event. Never waits.
    ///
    /// # Errors
    ///
    /// [`DispatchError::QueueOverflow`] if the queue is full (the event is
    /// dropped and counted), [`DispatchError::Closed`] after shutdown.
    pub fn emit(&self, event_type: &str, data: Value) -> Result<(), DispatchError> {
        let event = Event::new(event_type, data, self.shared.clock.now_ms());
        match self.tx.try_send(Command::Emit(event)) {
            Ok(()) => {
                self.shared.metrics.emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.shared.metrics.overflowed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Event queue full, dropped {}", event_type);
                Err(DispatchError::QueueOverflow {
                    capacity: self.shared.config.queue_capacity,
                    event_type: event_type.to_string(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Set the base policy of an event type. Listener options still apply
    /// on top of it.
    pub fn set_policy(&self, event_type: &str, policy: EventPolicy) {
        self.shared.policies.insert(event_type.to_string(), policy);
    }

    /// Effective policy of an event type.
    pub fn policy(&self, event_type: &str) -> EventPolicy {
        self.shared.policy_for(event_type)
    }

    /// Wait until every event queued before this call has been processed,
    /// flushing any open batch. Retries still pending are not awaited.
    pub async fn flush(&self) -> Result<(), DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    /// Process what is queued, flush open batches and stop the consumer.
    pub async fn shutdown(&self) {
        // Already closed is fine.
        let _ = self.tx.send(Command::Shutdown).await;
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Event dispatcher task failed: {}", e);
            }
        }
    }

    /// Listeners of `event_type`, in call order.
    pub fn listeners(&self, event_type: &str) -> Vec<ListenerInfo> {
        self.shared
            .listeners
            .get(event_type)
            .map(|ls| ls.iter().map(|l| l.info()).collect())
            .unwrap_or_default()
    }

    /// Remove every listener idle for longer than its idle timeout.
    pub fn prune_idle_listeners(&self) -> usize {
        let now = self.shared.clock.now_ms();
        let types: Vec<String> = self
            .shared
            .listeners
            .iter()
            .map(|e| e.key().clone())
            .collect();
        types
            .iter()
            .map(|t| self.shared.prune_idle(t, now))
            .sum()
    }

    /// Events abandoned after exhausting retries, oldest first.
    pub fn abandoned(&self) -> Vec<AbandonedEvent> {
        lock(&self.shared.quarantine).iter().cloned().collect()
    }

    /// Snapshot of the counters.
    pub fn statistics(&self) -> DispatcherStatistics {
        let m = &self.shared.metrics;
        DispatcherStatistics {
            emitted: m.emitted.load(Ordering::Relaxed),
            processed: m.processed.load(Ordering::Relaxed),
            duplicates: m.duplicates.load(Ordering::Relaxed),
            throttled: m.throttled.load(Ordering::Relaxed),
            batched: m.batched.load(Ordering::Relaxed),
            overflowed: m.overflowed.load(Ordering::Relaxed),
            listener_calls: m.listener_calls.load(Ordering::Relaxed),
            listener_errors: m.listener_errors.load(Ordering::Relaxed),
            retries: m.retries.load(Ordering::Relaxed),
            abandoned: m.abandoned.load(Ordering::Relaxed),
            pruned_listeners: m.pruned_listeners.load(Ordering::Relaxed),
            listeners: self.shared.listeners.iter().map(|e| e.len()).sum(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn policy_for(&self, event_type: &str) -> EventPolicy {
        let mut policy = self
            .policies
            .get(event_type)
            .map(|p| p.value().clone())
            .unwrap_or_default();
        if let Some(listeners) = self.listeners.get(event_type) {
            for listener in listeners.iter() {
                policy.absorb(&listener.options.policy());
            }
        }
        policy
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        for mut entry in self.listeners.iter_mut() {
            if let Some(position) = entry.iter().position(|l| l.id == id) {
                let listener = entry.remove(position);
                listener.deactivate();
                tracing::debug!("Removed listener {} from {}", id, listener.event_type);
                return true;
            }
        }
        false
    }

    fn prune_idle(&self, event_type: &str, now_ms: u64) -> usize {
        let Some(mut listeners) = self.listeners.get_mut(event_type) else {
            return 0;
        };
        let before = listeners.len();
        listeners.retain(|l| {
            let idle = l
                .options
                .idle_timeout
                .is_some_and(|t| {
                    now_ms.saturating_sub(l.last_active.load(Ordering::Relaxed))
                        >= t.as_millis() as u64
                });
            if idle {
                l.deactivate();
                tracing::debug!("Pruned idle listener {} from {}", l.id, event_type);
            }
            !idle
        });
        let pruned = before - listeners.len();
        self.metrics
            .pruned_listeners
            .fetch_add(pruned as u64, Ordering::Relaxed);
        pruned
    }

    fn deliver(self: &Arc<Self>, event: &Event) {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        self.prune_idle(&event.event_type, self.clock.now_ms());

        // Snapshot so callbacks can (un)subscribe without deadlocking.
        let listeners: Vec<Arc<Listener>> = match self.listeners.get(&event.event_type) {
            Some(ls) => ls.value().clone(),
            None => return,
        };

        for listener in listeners {
            if !listener.is_active() {
                continue;
            }
            if let Err(error) = self.invoke(&listener, event) {
                tracing::warn!(
                    "Listener {} failed on {}: {}",
                    listener.id,
                    event.event_type,
                    error
                );
                self.schedule_retry(listener, event.clone(), error);
            }
        }
    }

    fn invoke(&self, listener: &Listener, event: &Event) -> Result<(), ListenerError> {
        self.metrics.listener_calls.fetch_add(1, Ordering::Relaxed);
        listener.call_count.fetch_add(1, Ordering::Relaxed);
        listener
            .last_active
            .store(self.clock.now_ms(), Ordering::Relaxed);

        let result = catch_unwind(AssertUnwindSafe(|| (listener.callback)(event)))
            .unwrap_or_else(|panic| Err(ListenerError::Panicked(panic_message(panic.as_ref()))));

        if result.is_err() {
            self.metrics.listener_errors.fetch_add(1, Ordering::Relaxed);
            listener.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn schedule_retry(self: &Arc<Self>, listener: Arc<Listener>, event: Event, error: ListenerError) {
        let max_retries = self.config.max_retries;
        if max_retries == 0 {
            self.abandon(&listener, event, 0, error);
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let delay = shared.config.retry_delay();
            let mut last_error = error;

            for attempt in 1..=max_retries {
                tokio::time::sleep(delay).await;
                if !listener.is_active() {
                    tracing::debug!("Listener {} removed, dropping retry", listener.id);
                    return;
                }
                shared.metrics.retries.fetch_add(1, Ordering::Relaxed);
                match shared.invoke(&listener, &event) {
                    Ok(()) => {
                        tracing::debug!(
                            "Listener {} recovered on retry {} of {}",
                            listener.id,
                            attempt,
                            event.event_type
                        );
                        return;
                    }
                    Err(e) => last_error = e,
                }
            }

            shared.abandon(&listener, event, max_retries, last_error);
        });
    }

    fn abandon(&self, listener: &Listener, event: Event, retries: u32, last_error: ListenerError) {
        self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            "Abandoned {} for listener {} after {} retries: {}",
            event.event_type,
            listener.id,
            retries,
            last_error
        );

        let capacity = self.config.quarantine_capacity;
        if capacity == 0 {
            return;
        }
        let mut quarantine = lock(&self.quarantine);
        if quarantine.len() >= capacity {
            quarantine.pop_front();
        }
        quarantine.push_back(AbandonedEvent {
            listener: listener.id,
            event,
            retries,
            last_error,
        });
    }

    fn flush_batch(self: &Arc<Self>, batcher: &mut EventBatcher) {
        if batcher.is_empty() {
            return;
        }
        let events = batcher.drain(|t| self.policy_for(t).merge);
        tracing::trace!("Flushing {} batched event types", events.len());
        for event in events {
            self.deliver(&event);
        }
    }

    fn process(self: &Arc<Self>, event: Event, filter: &mut EventFilter, batcher: &mut EventBatcher) {
        let policy = self.policy_for(&event.event_type);
        let now = self.clock.now_ms();

        match filter.admit(&event, &policy, now) {
            Admission::Duplicate => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropped duplicate {}", event.event_type);
            }
            Admission::Throttled => {
                self.metrics.throttled.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Throttled {}", event.event_type);
            }
            Admission::Accept if policy.batchable => {
                self.metrics.batched.fetch_add(1, Ordering::Relaxed);
                if batcher.push(event, now) {
                    self.flush_batch(batcher);
                }
            }
            Admission::Accept => self.deliver(&event),
        }
    }
}

async fn run_consumer(shared: Arc<Shared>, mut rx: mpsc::Receiver<Command>) {
    let mut filter = EventFilter::new();
    let mut batcher = EventBatcher::new(
        shared.config.max_batched_events,
        shared.config.batch_timeout_ms,
    );

    loop {
        let command = match batcher.deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_sub(shared.clock.now_ms());
                tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {
                        shared.flush_batch(&mut batcher);
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match command {
            Some(Command::Emit(event)) => shared.process(event, &mut filter, &mut batcher),
            Some(Command::Flush(done)) => {
                shared.flush_batch(&mut batcher);
                // The waiter may have given up.
                let _ = done.send(());
            }
            Some(Command::Shutdown) | None => {
                shared.flush_batch(&mut batcher);
                break;
            }
        }
    }

    tracing::debug!("Event dispatcher stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
