//! Configuration for the multiplexer, lookups and caches.
//!
//! Every duration is stored in milliseconds so the structs round-trip through
//! JSON settings unchanged; accessors hand out [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relays used when a caller does not name any.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Configuration for [`RelayMultiplexer`](crate::RelayMultiplexer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultiplexerConfig {
    /// Quiet period before filter changes are flushed to a relay
    pub debounce_ms: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self { debounce_ms: 100 }
    }
}

impl MultiplexerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Deadline applied to every one-shot (EOSE-terminated) query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutPolicy {
    /// Wall-clock limit for a one-shot query or batch flush
    pub one_shot_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { one_shot_ms: 5_000 }
    }
}

impl TimeoutPolicy {
    pub fn one_shot(&self) -> Duration {
        Duration::from_millis(self.one_shot_ms)
    }
}

/// Configuration for a [`BatchFetcher`](crate::BatchFetcher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetcherConfig {
    /// Queue length that triggers an immediate flush
    pub batch_size: usize,
    /// Idle time after the last enqueue before a partial batch is flushed
    pub idle_ms: u64,
    /// Relays queried by each flush
    pub relays: Vec<String>,
    /// Deadline for each flush
    pub timeouts: TimeoutPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            idle_ms: 100,
            relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            timeouts: TimeoutPolicy::default(),
        }
    }
}

impl FetcherConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

/// Configuration for a [`LookupCache`](crate::LookupCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of entries to keep (0 = unbounded)
    pub max_entries: usize,
    /// Whether to enable caching
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        assert_eq!(MultiplexerConfig::default().debounce(), Duration::from_millis(100));
        assert_eq!(TimeoutPolicy::default().one_shot(), Duration::from_secs(5));
        let fetcher = FetcherConfig::default();
        assert_eq!(fetcher.batch_size, 50);
        assert_eq!(fetcher.idle(), Duration::from_millis(100));
        assert!(!fetcher.relays.is_empty());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: FetcherConfig =
            serde_json::from_str(r#"{"batchSize": 10, "timeouts": {"oneShotMs": 250}}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.idle_ms, 100);
        assert_eq!(config.timeouts.one_shot(), Duration::from_millis(250));
    }

    #[test]
    fn test_camel_case_serialization() {
        let json = serde_json::to_value(MultiplexerConfig::default()).unwrap();
        assert_eq!(json, serde_json::json!({"debounceMs": 100}));
    }
}
