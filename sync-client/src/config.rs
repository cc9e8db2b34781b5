//! Configuration loading for roomsync.
//!
//! Configuration is loaded from a TOML file (default: `roomsync.toml`).
//! Every field has a default, and so does every section, so an empty file is
//! a valid configuration.

use roomsync_core::{
    default_rules, ConflictKind, ConflictResolver, EventPolicy, MergeRule, ResolutionRule,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sync layer configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Event dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Conflict resolver configuration.
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Sync layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Buffer batchable operations instead of writing them one by one (default: true).
    #[serde(default = "default_batching_enabled")]
    pub batching_enabled: bool,
    /// Buffered operations that force a flush (default: 10).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Milliseconds between the first buffered operation and the flush (default: 500).
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Seconds before an in-flight operation is forgotten (default: 30).
    #[serde(default = "default_operation_ttl_secs")]
    pub operation_ttl_secs: u64,
    /// Milliseconds a single store call may take (default: 5000).
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

/// Event dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Capacity of the event queue (default: 1000).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Milliseconds a batch of events stays open (default: 100).
    #[serde(default = "default_event_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Buffered events, across all types, that force a flush (default: 20).
    #[serde(default = "default_max_batched_events")]
    pub max_batched_events: usize,
    /// Retries for a failing listener before the event is abandoned (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Milliseconds between two retries (default: 250).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Abandoned events kept for inspection (default: 100).
    #[serde(default = "default_quarantine_capacity")]
    pub quarantine_capacity: usize,
    /// Per-event-type policies.
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, EventPolicy>,
}

/// Conflict resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Resolutions remembered in the history (default: 100).
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Rule overrides keyed by conflict kind name.
    #[serde(default)]
    pub rules: BTreeMap<String, ResolutionRule>,
}

// Default value functions
fn default_batching_enabled() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    10
}

fn default_batch_timeout_ms() -> u64 {
    500
}

fn default_operation_ttl_secs() -> u64 {
    30
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1_000
}

fn default_event_batch_timeout_ms() -> u64 {
    100
}

fn default_max_batched_events() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_quarantine_capacity() -> usize {
    100
}

fn default_policies() -> BTreeMap<String, EventPolicy> {
    let mut policies = BTreeMap::new();
    policies.insert(
        crate::events::ROOM_UPDATED.to_string(),
        EventPolicy {
            dedupe: true,
            ..EventPolicy::default()
        },
    );
    policies.insert(
        crate::events::VOTES_UPDATED.to_string(),
        EventPolicy {
            batchable: true,
            merge: MergeRule::Union,
            ..EventPolicy::default()
        },
    );
    policies
}

fn default_history_capacity() -> usize {
    100
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batching_enabled: default_batching_enabled(),
            max_batch_size: default_max_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            operation_ttl_secs: default_operation_ttl_secs(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl SyncConfig {
    /// Batch timeout as a Duration.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Operation TTL as a Duration.
    pub fn operation_ttl(&self) -> Duration {
        Duration::from_secs(self.operation_ttl_secs)
    }

    /// Store timeout as a Duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_timeout_ms: default_event_batch_timeout_ms(),
            max_batched_events: default_max_batched_events(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            quarantine_capacity: default_quarantine_capacity(),
            policies: default_policies(),
        }
    }
}

impl DispatcherConfig {
    /// Retry delay as a Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            rules: BTreeMap::new(),
        }
    }
}

impl ResolverConfig {
    /// Build a resolver with the built-in rules plus the overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override names an unknown conflict kind.
    pub fn build(&self) -> Result<ConflictResolver, ConfigError> {
        let mut rules = default_rules();
        for (name, rule) in &self.rules {
            let kind = ConflictKind::parse(name)
                .ok_or_else(|| ConfigError::UnknownConflictKind(name.clone()))?;
            rules.insert(kind, rule.clone());
        }
        Ok(ConflictResolver::with_rules(rules).with_history_capacity(self.history_capacity))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to render configuration.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),
    /// A rule override names no known conflict kind.
    #[error("unknown conflict kind: {0}")]
    UnknownConflictKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomsync_core::ResolutionStrategy;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.sync.max_batch_size, 10);
        assert_eq!(config.sync.batch_timeout(), Duration::from_millis(500));
        assert_eq!(config.sync.operation_ttl(), Duration::from_secs(30));
        assert_eq!(config.dispatcher.queue_capacity, 1000);
        assert_eq!(config.dispatcher.max_retries, 3);
        assert_eq!(config.resolver.history_capacity, 100);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[sync]
max_batch_size = 4
batch_timeout_ms = 250

[dispatcher]
queue_capacity = 16
retry_delay_ms = 10

[dispatcher.policies.players-updated]
throttle_ms = 1000
dedupe = true

[resolver]
history_capacity = 8

[resolver.rules.vote_during_reveal]
strategy = "ignore"
message = "voting is closed"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.max_batch_size, 4);
        assert_eq!(config.sync.batch_timeout_ms, 250);
        assert!(config.sync.batching_enabled);
        assert_eq!(config.dispatcher.queue_capacity, 16);
        assert_eq!(config.dispatcher.retry_delay(), Duration::from_millis(10));
        assert_eq!(
            config.dispatcher.policies["players-updated"].throttle_ms,
            1000
        );
        assert_eq!(config.resolver.history_capacity, 8);

        let resolver = config.resolver.build().unwrap();
        let rule = resolver.rule(ConflictKind::VoteDuringReveal).unwrap();
        assert_eq!(rule.strategy, ResolutionStrategy::Ignore);
        assert_eq!(rule.message.as_deref(), Some("voting is closed"));
        // Untouched kinds keep their built-in rule.
        assert_eq!(
            resolver.rule(ConflictKind::VersionMismatch).unwrap().retry_attempts,
            3
        );
    }

    #[test]
    fn unknown_rule_kind_is_rejected() {
        let toml = r#"
[resolver.rules.double_reveal]
strategy = "ignore"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.resolver.build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownConflictKind(ref k) if k == "double_reveal"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/roomsync.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn rendered_config_parses_back() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
