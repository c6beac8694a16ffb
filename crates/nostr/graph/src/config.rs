//! Graph runtime configuration.

use nostr_client::{DEFAULT_RELAYS, FetcherConfig, MultiplexerConfig, TimeoutPolicy};
use serde::{Deserialize, Serialize};

/// Configuration for a [`NodeGraph`](crate::NodeGraph)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphConfig {
    /// Relays used by sources that name none
    pub default_relays: Vec<String>,
    /// Deadline for backward (one-shot) sources
    pub timeouts: TimeoutPolicy,
    pub multiplexer: MultiplexerConfig,
    /// Profile lookups requested by displays
    pub fetcher: FetcherConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            timeouts: TimeoutPolicy::default(),
            multiplexer: MultiplexerConfig::default(),
            fetcher: FetcherConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: GraphConfig =
            serde_json::from_str(r#"{"defaultRelays":["wss://a.example"],"timeouts":{"oneShotMs":250}}"#)
                .unwrap();
        assert_eq!(config.default_relays, vec!["wss://a.example".to_string()]);
        assert_eq!(config.timeouts.one_shot_ms, 250);
        assert_eq!(config.multiplexer, MultiplexerConfig::default());
        assert_eq!(config.fetcher.batch_size, 50);
    }
}
