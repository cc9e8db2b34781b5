//! Event filtering and batching state for the event dispatcher.
//!
//! The dispatcher's consumer loop runs every event through an
//! [`EventFilter`] (duplicate filter, then leading-edge throttle) and, for
//! batchable types, through an [`EventBatcher`]. Both are plain state
//! machines driven by an explicit `now_ms`, so they can be tested without
//! timers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default time a batch may stay open.
pub const DEFAULT_EVENT_BATCH_TIMEOUT_MS: u64 = 100;

/// Default number of buffered events (across all types) that forces a flush.
pub const DEFAULT_MAX_BATCHED_EVENTS: usize = 20;

/// Listener priority. Higher priorities are called first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Called last.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Called before normal listeners.
    High,
    /// Called first.
    Critical,
}

/// How buffered payloads of one event type combine into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRule {
    /// Keep only the most recent payload.
    #[default]
    Latest,
    /// Collect every payload into an array, flattening array payloads.
    Concat,
    /// Merge objects key-wise (later wins) or arrays element-wise without
    /// duplicates. Mixed shapes fall back to [`MergeRule::Latest`].
    Union,
}

impl MergeRule {
    /// Combine `payloads`, oldest first.
    pub fn merge(&self, payloads: Vec<Value>) -> Value {
        match self {
            MergeRule::Latest => payloads.into_iter().last().unwrap_or(Value::Null),
            MergeRule::Concat => {
                let mut out = Vec::new();
                for payload in payloads {
                    match payload {
                        Value::Array(items) => out.extend(items),
                        other => out.push(other),
                    }
                }
                Value::Array(out)
            }
            MergeRule::Union => union(payloads),
        }
    }
}

fn union(payloads: Vec<Value>) -> Value {
    if payloads.iter().all(Value::is_object) {
        let mut out = Map::new();
        for payload in payloads {
            if let Value::Object(fields) = payload {
                out.extend(fields);
            }
        }
        return Value::Object(out);
    }

    if payloads.iter().all(Value::is_array) {
        let mut out: Vec<Value> = Vec::new();
        for payload in payloads {
            if let Value::Array(items) = payload {
                for item in items {
                    if !out.contains(&item) {
                        out.push(item);
                    }
                }
            }
        }
        return Value::Array(out);
    }

    MergeRule::Latest.merge(payloads)
}

/// Per-event-type dispatch policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventPolicy {
    /// Minimum interval between two dispatches of the type (0 = off).
    #[serde(default)]
    pub throttle_ms: u64,
    /// Drop a payload equal to the previous one.
    #[serde(default)]
    pub dedupe: bool,
    /// Buffer and merge instead of dispatching immediately.
    #[serde(default)]
    pub batchable: bool,
    /// How buffered payloads merge.
    #[serde(default)]
    pub merge: MergeRule,
}

impl EventPolicy {
    /// Fold a listener's options into the type policy.
    ///
    /// The strictest setting wins: the longest throttle, and dedupe or
    /// batching as soon as any listener asks for it.
    pub fn absorb(&mut self, other: &EventPolicy) {
        self.throttle_ms = self.throttle_ms.max(other.throttle_ms);
        self.dedupe |= other.dedupe;
        self.batchable |= other.batchable;
        if other.merge != MergeRule::Latest {
            self.merge = other.merge;
        }
    }
}

/// An emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type name, e.g. `room-updated`.
    pub event_type: String,
    /// Payload.
    pub data: Value,
    /// Emission time (ms).
    pub emitted_at: u64,
    /// Number of emitted events folded into this one (1 when not batched).
    pub merged: usize,
}

impl Event {
    /// A single, unbatched event.
    pub fn new(event_type: impl Into<String>, data: Value, emitted_at: u64) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            emitted_at,
            merged: 1,
        }
    }
}

/// Outcome of running an event through the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch (or batch) the event.
    Accept,
    /// Same payload as the previous event of the type.
    Duplicate,
    /// Inside the throttle window of the previous dispatch.
    Throttled,
}

/// Duplicate and throttle state, per event type.
#[derive(Debug, Default)]
pub struct EventFilter {
    last_payload: HashMap<String, Value>,
    last_accepted: HashMap<String, u64>,
}

impl EventFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `event` passes under `policy` at `now_ms`.
    pub fn admit(&mut self, event: &Event, policy: &EventPolicy, now_ms: u64) -> Admission {
        if policy.dedupe {
            let previous = self
                .last_payload
                .insert(event.event_type.clone(), event.data.clone());
            if previous.as_ref() == Some(&event.data) {
                return Admission::Duplicate;
            }
        }

        if policy.throttle_ms > 0 {
            if let Some(last) = self.last_accepted.get(&event.event_type) {
                if now_ms.saturating_sub(*last) < policy.throttle_ms {
                    return Admission::Throttled;
                }
            }
        }

        self.last_accepted.insert(event.event_type.clone(), now_ms);
        Admission::Accept
    }
}

/// Buffers batchable events until a timeout or a total cap.
#[derive(Debug)]
pub struct EventBatcher {
    max_events: usize,
    timeout_ms: u64,
    buffered: usize,
    opened_at: Option<u64>,
    // First-arrival order of event types.
    order: Vec<String>,
    buffers: HashMap<String, Vec<Event>>,
}

impl EventBatcher {
    /// Create a batcher flushing after `timeout_ms` or at `max_events` buffered events.
    pub fn new(max_events: usize, timeout_ms: u64) -> Self {
        Self {
            max_events: max_events.max(1),
            timeout_ms,
            buffered: 0,
            opened_at: None,
            order: Vec::new(),
            buffers: HashMap::new(),
        }
    }

    /// Buffer `event`. Returns true when the cap is reached and the caller
    /// should flush now.
    pub fn push(&mut self, event: Event, now_ms: u64) -> bool {
        if self.opened_at.is_none() {
            self.opened_at = Some(now_ms);
        }
        let buffer = self
            .buffers
            .entry(event.event_type.clone())
            .or_insert_with(|| {
                self.order.push(event.event_type.clone());
                Vec::new()
            });
        buffer.push(event);
        self.buffered += 1;
        self.buffered >= self.max_events
    }

    /// When the open batch must be flushed, if one is open.
    pub fn deadline(&self) -> Option<u64> {
        self.opened_at.map(|t| t + self.timeout_ms)
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.buffered
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Drain every buffer into one merged event per type, in first-arrival
    /// order. `rule_for` picks the merge rule of each type.
    pub fn drain<F>(&mut self, rule_for: F) -> Vec<Event>
    where
        F: Fn(&str) -> MergeRule,
    {
        let order = std::mem::take(&mut self.order);
        let mut buffers = std::mem::take(&mut self.buffers);
        self.buffered = 0;
        self.opened_at = None;

        order
            .into_iter()
            .filter_map(|event_type| {
                let events = buffers.remove(&event_type)?;
                let merged = events.len();
                let emitted_at = events.last().map_or(0, |e| e.emitted_at);
                let data = rule_for(&event_type).merge(events.into_iter().map(|e| e.data).collect());
                Some(Event {
                    event_type,
                    data,
                    emitted_at,
                    merged,
                })
            })
            .collect()
    }
}

impl Default for EventBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCHED_EVENTS, DEFAULT_EVENT_BATCH_TIMEOUT_MS)
    }
}
