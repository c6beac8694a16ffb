//! Subscription ids and per-query EOSE tracking.

use std::collections::HashSet;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Tracks which relays a one-shot query still waits on.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Relays the query was sent to
    relays: HashSet<String>,
    /// Relays that have sent EOSE
    eose_relays: HashSet<String>,
}

impl SubscriptionTracker {
    /// Track EOSE for the given relays.
    pub fn new(relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            eose_relays: HashSet::new(),
        }
    }

    /// Mark EOSE received from a relay. Returns true once every relay has sent it.
    pub fn mark_eose(&mut self, relay_url: &str) -> bool {
        if self.relays.contains(relay_url) {
            self.eose_relays.insert(relay_url.to_string());
        }
        self.all_eose()
    }

    /// Whether EOSE has been received from all relays.
    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty() && self.relays.len() == self.eose_relays.len()
    }

    /// Relays that have not sent EOSE yet.
    pub fn waiting_on(&self) -> impl Iterator<Item = &str> {
        self.relays
            .difference(&self.eose_relays)
            .map(String::as_str)
    }
}
