//! Conflict kinds and the static rules that decide their outcome.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Classification of an incompatibility between an operation and the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two players revealing at once.
    SimultaneousReveal,
    /// Two players resetting at once.
    SimultaneousReset,
    /// A vote arriving after the votes were shown.
    VoteDuringReveal,
    /// A reset racing in-flight votes.
    ResetDuringVote,
    /// The caller's expected version is not the stored one.
    VersionMismatch,
    /// Overlapping changes from different players within the concurrency window.
    ConcurrentStateChange,
}

impl ConflictKind {
    /// All kinds, in detection precedence order.
    pub const ALL: [ConflictKind; 6] = [
        ConflictKind::SimultaneousReveal,
        ConflictKind::SimultaneousReset,
        ConflictKind::VoteDuringReveal,
        ConflictKind::ResetDuringVote,
        ConflictKind::VersionMismatch,
        ConflictKind::ConcurrentStateChange,
    ];

    /// snake_case name, as used in configuration and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::SimultaneousReveal => "simultaneous_reveal",
            ConflictKind::SimultaneousReset => "simultaneous_reset",
            ConflictKind::VoteDuringReveal => "vote_during_reveal",
            ConflictKind::ResetDuringVote => "reset_during_vote",
            ConflictKind::VersionMismatch => "version_mismatch",
            ConflictKind::ConcurrentStateChange => "concurrent_state_change",
        }
    }

    /// Look a kind up by its snake_case name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict of a given kind is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Earliest timestamp proceeds, everyone else is rejected.
    FirstWriterWins,
    /// The incoming operation always proceeds.
    LastWriterWins,
    /// Proceed iff the operation type's priority reaches the rule's priority.
    PriorityBased,
    /// Always reject with the rule's message.
    Ignore,
    /// Ask the caller to re-read and resubmit, a bounded number of times.
    RetryWithBackoff,
    /// Apply the operation's update onto the current state.
    Merge,
}

/// Static configuration for one conflict kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRule {
    /// Strategy to apply.
    pub strategy: ResolutionStrategy,
    /// Threshold for [`ResolutionStrategy::PriorityBased`].
    #[serde(default)]
    pub priority: u8,
    /// Maximum retry signals for [`ResolutionStrategy::RetryWithBackoff`].
    #[serde(default)]
    pub retry_attempts: u32,
    /// Delay the caller should wait before retrying.
    #[serde(default)]
    pub backoff_delay_ms: u64,
    /// Fixed rejection message.
    #[serde(default)]
    pub message: Option<String>,
}

impl ResolutionRule {
    /// A rule with the given strategy and no retry, priority or message.
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            strategy,
            priority: 0,
            retry_attempts: 0,
            backoff_delay_ms: 0,
            message: None,
        }
    }

    /// Set the priority threshold.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget and delay.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.backoff_delay_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the rejection message.
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    /// Backoff as a Duration.
    pub fn backoff_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_delay_ms)
    }
}

/// The built-in rule table.
pub fn default_rules() -> BTreeMap<ConflictKind, ResolutionRule> {
    let mut rules = BTreeMap::new();
    rules.insert(
        ConflictKind::SimultaneousReveal,
        ResolutionRule::new(ResolutionStrategy::FirstWriterWins).with_priority(10),
    );
    rules.insert(
        ConflictKind::SimultaneousReset,
        ResolutionRule::new(ResolutionStrategy::FirstWriterWins).with_priority(8),
    );
    rules.insert(
        ConflictKind::VoteDuringReveal,
        ResolutionRule::new(ResolutionStrategy::Ignore)
            .with_priority(5)
            .with_message("cannot vote while revealing"),
    );
    rules.insert(
        ConflictKind::ResetDuringVote,
        ResolutionRule::new(ResolutionStrategy::PriorityBased).with_priority(8),
    );
    rules.insert(
        ConflictKind::VersionMismatch,
        ResolutionRule::new(ResolutionStrategy::RetryWithBackoff)
            .with_priority(7)
            .with_retry(3, Duration::from_millis(1000)),
    );
    rules.insert(
        ConflictKind::ConcurrentStateChange,
        ResolutionRule::new(ResolutionStrategy::Merge).with_priority(6),
    );
    rules
}
