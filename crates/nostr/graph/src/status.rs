//! Per-node subscription status.

use nostr_client::RelayStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a node's relay subscriptions, as shown on the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    /// Not subscribed: no path to a display, or nothing to query
    #[default]
    Idle,
    Connecting,
    /// Query sent, stored events streaming
    Subscribing,
    /// Stored events delivered (or a one-shot query ended)
    EndOfStream,
    Error(String),
    Closed,
}

impl NodeStatus {
    /// Position on the happy path, used to pick the least advanced relay.
    fn progress(&self) -> u8 {
        match self {
            NodeStatus::Idle => 0,
            NodeStatus::Connecting => 1,
            NodeStatus::Subscribing => 2,
            NodeStatus::EndOfStream => 3,
            NodeStatus::Closed => 4,
            NodeStatus::Error(_) => 5,
        }
    }

    /// Combine the statuses of every relay a source queries.
    ///
    /// Any error wins; otherwise the least advanced relay decides.
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a NodeStatus>) -> NodeStatus {
        let mut combined: Option<&NodeStatus> = None;
        for status in statuses {
            if matches!(status, NodeStatus::Error(_)) {
                return status.clone();
            }
            combined = match combined {
                Some(current) if current.progress() <= status.progress() => Some(current),
                _ => Some(status),
            };
        }
        combined.cloned().unwrap_or(NodeStatus::Idle)
    }
}

impl From<&RelayStatus> for NodeStatus {
    fn from(status: &RelayStatus) -> Self {
        match status {
            RelayStatus::Connecting | RelayStatus::Connected => NodeStatus::Connecting,
            RelayStatus::Subscribed => NodeStatus::Subscribing,
            RelayStatus::EndOfStoredEvents => NodeStatus::EndOfStream,
            RelayStatus::Error(message) => NodeStatus::Error(message.clone()),
            RelayStatus::Closed => NodeStatus::Closed,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Idle => f.write_str("idle"),
            NodeStatus::Connecting => f.write_str("connecting"),
            NodeStatus::Subscribing => f.write_str("subscribing"),
            NodeStatus::EndOfStream => f.write_str("end of stream"),
            NodeStatus::Error(message) => write!(f, "error: {message}"),
            NodeStatus::Closed => f.write_str("closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_picks_least_advanced() {
        let statuses = [NodeStatus::EndOfStream, NodeStatus::Subscribing, NodeStatus::Closed];
        assert_eq!(NodeStatus::aggregate(&statuses), NodeStatus::Subscribing);
        assert_eq!(NodeStatus::aggregate(&[]), NodeStatus::Idle);
    }

    #[test]
    fn test_aggregate_error_wins() {
        let statuses = [
            NodeStatus::Connecting,
            NodeStatus::Error("refused".into()),
            NodeStatus::EndOfStream,
        ];
        assert_eq!(NodeStatus::aggregate(&statuses), NodeStatus::Error("refused".into()));
    }

    #[test]
    fn test_from_relay_status() {
        assert_eq!(NodeStatus::from(&RelayStatus::Connected), NodeStatus::Connecting);
        assert_eq!(
            NodeStatus::from(&RelayStatus::EndOfStoredEvents),
            NodeStatus::EndOfStream
        );
        assert_eq!(NodeStatus::from(&RelayStatus::Closed), NodeStatus::Closed);
    }
}
