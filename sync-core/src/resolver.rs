//! Conflict detection and resolution.
//!
//! [`ConflictResolver`] is a policy engine: given an operation, the room
//! snapshot it targets and the operations currently in flight, it decides
//! whether there is a conflict ([`ConflictResolver::detect`]) and what to do
//! about it ([`ConflictResolver::resolve`]).
//!
//! Every strategy is a pure function of its inputs, so the same conflict
//! always resolves the same way no matter which client evaluates it or in
//! which order the competing operations were seen. The only state kept is a
//! bounded history of past resolutions and running counters, both read-only
//! from the outside.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use roomsync_types::{Operation, OperationId, OperationType, Phase, PlayerId, RoomState};

use crate::rules::{default_rules, ConflictKind, ResolutionRule, ResolutionStrategy};

/// Two operations closer than this are considered concurrent.
pub const CONCURRENCY_WINDOW_MS: u64 = 1000;

/// Default number of resolutions remembered.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Rejection reason for operations beaten by an earlier one.
pub const EARLIER_OPERATION_WINS: &str = "other operation more early";

/// A detected incompatibility, ready to be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// What kind of conflict this is.
    pub kind: ConflictKind,
    /// The operation being decided.
    pub operation: Operation,
    /// The room snapshot the operation targets.
    pub current_state: RoomState,
    /// In-flight operations that compete with `operation`.
    pub conflicting_operations: Vec<Operation>,
    /// Human-readable explanation.
    pub reason: String,
}

/// What the caller must do after a resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionAction {
    /// Perform the write as submitted.
    Proceed,
    /// Do not write.
    Reject,
    /// Re-read, then resubmit after `backoff`.
    Retry {
        /// Retry signals left after this one.
        remaining: u32,
        /// Delay before resubmitting.
        backoff: Duration,
    },
    /// Write this state instead of the submitted update.
    Merge(Box<RoomState>),
}

impl ResolutionAction {
    /// Short tag for logs and history.
    pub fn tag(&self) -> ActionTag {
        match self {
            ResolutionAction::Proceed => ActionTag::Proceed,
            ResolutionAction::Reject => ActionTag::Reject,
            ResolutionAction::Retry { .. } => ActionTag::Retry,
            ResolutionAction::Merge(_) => ActionTag::Merge,
        }
    }
}

/// Data-free discriminant of [`ResolutionAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionTag {
    /// See [`ResolutionAction::Proceed`].
    Proceed,
    /// See [`ResolutionAction::Reject`].
    Reject,
    /// See [`ResolutionAction::Retry`].
    Retry,
    /// See [`ResolutionAction::Merge`].
    Merge,
}

impl ActionTag {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::Proceed => "proceed",
            ActionTag::Reject => "reject",
            ActionTag::Retry => "retry",
            ActionTag::Merge => "merge",
        }
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Whether a rule was found and applied.
    pub success: bool,
    /// What the caller must do.
    pub action: ResolutionAction,
    /// Why.
    pub reason: String,
    /// The operation that won, for strategies that pick one.
    pub winner: Option<OperationId>,
    /// The strategy that produced this outcome.
    pub strategy: Option<ResolutionStrategy>,
}

impl Resolution {
    fn decided(
        strategy: ResolutionStrategy,
        action: ResolutionAction,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            action,
            reason: reason.into(),
            winner: None,
            strategy: Some(strategy),
        }
    }

    fn with_winner(mut self, winner: OperationId) -> Self {
        self.winner = Some(winner);
        self
    }
}

/// One entry of the resolution history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Conflict kind.
    pub kind: ConflictKind,
    /// Operation that was decided.
    pub operation_id: OperationId,
    /// Its type.
    pub op_type: OperationType,
    /// Its submitter.
    pub player_id: PlayerId,
    /// Resulting action.
    pub action: ActionTag,
    /// Whether a rule applied.
    pub success: bool,
    /// Operation timestamp.
    pub timestamp: u64,
}

/// Running counters, exposed for operational tooling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverStatistics {
    /// Resolve calls.
    pub total_conflicts: u64,
    /// Resolve calls for which a rule applied.
    pub resolved_conflicts: u64,
    /// Resolve calls without a usable rule.
    pub failed_resolutions: u64,
    /// Resolve calls per kind.
    pub by_kind: BTreeMap<ConflictKind, u64>,
    /// Entries currently in the history.
    pub history_len: usize,
}

impl ResolverStatistics {
    /// Percentage of conflicts that were resolved (0 when there were none).
    pub fn success_rate(&self) -> f64 {
        if self.total_conflicts == 0 {
            return 0.0;
        }
        self.resolved_conflicts as f64 / self.total_conflicts as f64 * 100.0
    }
}

/// Rule-driven conflict detector and resolver.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    rules: BTreeMap<ConflictKind, ResolutionRule>,
    history: VecDeque<HistoryRecord>,
    history_capacity: usize,
    stats: ResolverStatistics,
}

impl ConflictResolver {
    /// Create a resolver with the built-in rules.
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    /// Create a resolver with a custom rule table.
    pub fn with_rules(rules: BTreeMap<ConflictKind, ResolutionRule>) -> Self {
        Self {
            rules,
            history: VecDeque::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            stats: ResolverStatistics::default(),
        }
    }

    /// Bound the history to `capacity` entries.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        while self.history.len() > capacity {
            self.history.pop_front();
        }
        self
    }

    /// Replace the rule for one kind.
    pub fn set_rule(&mut self, kind: ConflictKind, rule: ResolutionRule) {
        self.rules.insert(kind, rule);
    }

    /// Remove the rule for one kind; conflicts of that kind will fail to resolve.
    pub fn remove_rule(&mut self, kind: ConflictKind) -> Option<ResolutionRule> {
        self.rules.remove(&kind)
    }

    /// The rule for one kind.
    pub fn rule(&self, kind: ConflictKind) -> Option<&ResolutionRule> {
        self.rules.get(&kind)
    }

    /// Classify `operation` against `current` and the operations in flight.
    ///
    /// `active` may contain `operation` itself; it is ignored. Kinds are
    /// checked in [`ConflictKind::ALL`] order and the first match wins.
    pub fn detect(
        &self,
        operation: &Operation,
        current: &RoomState,
        active: &[Operation],
    ) -> Option<Conflict> {
        let others: Vec<&Operation> = active.iter().filter(|o| o.id != operation.id).collect();
        let rivals = |op_type: OperationType| -> Vec<Operation> {
            others
                .iter()
                .filter(|o| o.op_type == op_type && o.player_id != operation.player_id)
                .map(|o| (*o).clone())
                .collect()
        };
        let conflict = |kind: ConflictKind, with: Vec<Operation>, reason: String| Conflict {
            kind,
            operation: operation.clone(),
            current_state: current.clone(),
            conflicting_operations: with,
            reason,
        };

        match operation.op_type {
            OperationType::Reveal => {
                let reveals = rivals(OperationType::Reveal);
                if !reveals.is_empty() {
                    return Some(conflict(
                        ConflictKind::SimultaneousReveal,
                        reveals,
                        format!("another reveal is in flight (phase {})", current.phase),
                    ));
                }
            }
            OperationType::Reset => {
                let resets = rivals(OperationType::Reset);
                if !resets.is_empty() {
                    return Some(conflict(
                        ConflictKind::SimultaneousReset,
                        resets,
                        "another reset is in flight".to_string(),
                    ));
                }
            }
            OperationType::Vote if current.phase == Phase::Revealing => {
                return Some(conflict(
                    ConflictKind::VoteDuringReveal,
                    Vec::new(),
                    "vote submitted while votes are revealed".to_string(),
                ));
            }
            _ => {}
        }

        if operation.op_type == OperationType::Reset && current.phase == Phase::Voting {
            let votes: Vec<Operation> = others
                .iter()
                .filter(|o| o.op_type == OperationType::Vote)
                .map(|o| (*o).clone())
                .collect();
            if !votes.is_empty() {
                return Some(conflict(
                    ConflictKind::ResetDuringVote,
                    votes,
                    "reset while votes are in flight".to_string(),
                ));
            }
        }

        if let Some(stale) = self.stale_version(operation, current) {
            return Some(stale);
        }

        let concurrent: Vec<Operation> = others
            .iter()
            .filter(|o| {
                o.player_id != operation.player_id
                    && o.timestamp.abs_diff(operation.timestamp) < CONCURRENCY_WINDOW_MS
                    && o.payload.overlaps(&operation.payload)
            })
            .map(|o| (*o).clone())
            .collect();
        if !concurrent.is_empty() {
            return Some(conflict(
                ConflictKind::ConcurrentStateChange,
                concurrent,
                format!(
                    "overlapping change within {}ms of another player",
                    CONCURRENCY_WINDOW_MS
                ),
            ));
        }

        None
    }

    /// The version mismatch check on its own.
    ///
    /// [`detect`](Self::detect) reports only the first matching kind, so an
    /// operation whose reveal, reset or concurrency conflict resolved to
    /// proceed or merge must still pass this check before it is written.
    pub fn stale_version(&self, operation: &Operation, current: &RoomState) -> Option<Conflict> {
        let expected = operation.expected_version?;
        if expected == current.version {
            return None;
        }
        Some(Conflict {
            kind: ConflictKind::VersionMismatch,
            operation: operation.clone(),
            current_state: current.clone(),
            conflicting_operations: Vec::new(),
            reason: format!(
                "expected version {} but room is at {}",
                expected, current.version
            ),
        })
    }

    /// Decide the outcome of `conflict` with the rule for its kind.
    ///
    /// Always records the call in the history and counters.
    pub fn resolve(&mut self, conflict: &Conflict) -> Resolution {
        let resolution = match self.rules.get(&conflict.kind) {
            Some(rule) => apply_strategy(rule, conflict),
            None => Resolution {
                success: false,
                action: ResolutionAction::Reject,
                reason: format!("no resolution rule for {}", conflict.kind),
                winner: None,
                strategy: None,
            },
        };

        self.record(conflict, &resolution);
        resolution
    }

    /// Snapshot of the counters.
    pub fn statistics(&self) -> ResolverStatistics {
        ResolverStatistics {
            history_len: self.history.len(),
            ..self.stats.clone()
        }
    }

    /// Past resolutions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.history.iter()
    }

    /// Zero the counters and forget the history.
    pub fn reset_statistics(&mut self) {
        self.stats = ResolverStatistics::default();
        self.history.clear();
    }

    fn record(&mut self, conflict: &Conflict, resolution: &Resolution) {
        self.stats.total_conflicts += 1;
        if resolution.success {
            self.stats.resolved_conflicts += 1;
        } else {
            self.stats.failed_resolutions += 1;
        }
        *self.stats.by_kind.entry(conflict.kind).or_insert(0) += 1;

        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistoryRecord {
            kind: conflict.kind,
            operation_id: conflict.operation.id,
            op_type: conflict.operation.op_type,
            player_id: conflict.operation.player_id.clone(),
            action: resolution.action.tag(),
            success: resolution.success,
            timestamp: conflict.operation.timestamp,
        });
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_strategy(rule: &ResolutionRule, conflict: &Conflict) -> Resolution {
    let op = &conflict.operation;
    let strategy = rule.strategy;

    match strategy {
        ResolutionStrategy::FirstWriterWins => {
            // Total order: timestamp, then player, then id. Independent of
            // the order the candidates arrived in.
            let winner = std::iter::once(op)
                .chain(conflict.conflicting_operations.iter())
                .min_by(|a, b| {
                    a.timestamp
                        .cmp(&b.timestamp)
                        .then_with(|| a.player_id.cmp(&b.player_id))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .unwrap_or(op);

            if winner.id == op.id {
                Resolution::decided(strategy, ResolutionAction::Proceed, "earliest operation")
                    .with_winner(op.id)
            } else {
                Resolution::decided(strategy, ResolutionAction::Reject, EARLIER_OPERATION_WINS)
                    .with_winner(winner.id)
            }
        }
        ResolutionStrategy::LastWriterWins => {
            Resolution::decided(strategy, ResolutionAction::Proceed, "latest write wins")
                .with_winner(op.id)
        }
        ResolutionStrategy::PriorityBased => {
            let priority = op.op_type.priority();
            if priority >= rule.priority {
                Resolution::decided(
                    strategy,
                    ResolutionAction::Proceed,
                    format!("{} priority {} >= {}", op.op_type, priority, rule.priority),
                )
                .with_winner(op.id)
            } else {
                Resolution::decided(
                    strategy,
                    ResolutionAction::Reject,
                    format!("{} priority {} < {}", op.op_type, priority, rule.priority),
                )
            }
        }
        ResolutionStrategy::Ignore => Resolution::decided(
            strategy,
            ResolutionAction::Reject,
            rule.message
                .clone()
                .unwrap_or_else(|| format!("{} ignored", conflict.kind)),
        ),
        ResolutionStrategy::RetryWithBackoff => {
            if op.attempt < rule.retry_attempts {
                Resolution::decided(
                    strategy,
                    ResolutionAction::Retry {
                        remaining: rule.retry_attempts - op.attempt - 1,
                        backoff: rule.backoff_delay(),
                    },
                    conflict.reason.clone(),
                )
            } else {
                Resolution::decided(
                    strategy,
                    ResolutionAction::Reject,
                    format!("retry attempts exhausted ({})", rule.retry_attempts),
                )
            }
        }
        ResolutionStrategy::Merge => {
            let mut merged = op.payload.apply(&conflict.current_state);
            merged.merged_by = Some(op.player_id.clone());
            merged.last_merge = Some(op.timestamp);
            Resolution::decided(
                strategy,
                ResolutionAction::Merge(Box::new(merged)),
                "update merged onto current state",
            )
            .with_winner(op.id)
        }
    }
}
