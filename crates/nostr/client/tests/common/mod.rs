#![allow(dead_code)]

use nostr::Event;
use nostr_client::{RelayStatus, SubscriptionHandler};
use parking_lot::Mutex;
use std::sync::Once;
use std::time::Duration;

pub const RELAY: &str = "wss://relay.example";
pub const OTHER_RELAY: &str = "wss://other.example";

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// 64-char hex string derived from `n`.
pub fn hex_id(n: u64) -> String {
    format!("{n:064x}")
}

pub fn event(n: u64, pubkey: &str, kind: u16, created_at: u64) -> Event {
    Event {
        id: hex_id(n),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags: vec![],
        content: format!("event {n}"),
        sig: String::new(),
    }
}

/// Let spawned tasks run without reaching any pending timer.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Handler that records everything it is told.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub eose: Mutex<usize>,
    pub statuses: Mutex<Vec<RelayStatus>>,
}

impl Recorder {
    pub fn event_ids(&self) -> Vec<String> {
        let mut ids = self.events.lock().clone();
        ids.sort();
        ids
    }

    pub fn eose_count(&self) -> usize {
        *self.eose.lock()
    }

    pub fn last_status(&self) -> Option<RelayStatus> {
        self.statuses.lock().last().cloned()
    }
}

impl SubscriptionHandler for Recorder {
    fn on_event(&self, _relay_url: &str, event: &Event) {
        self.events.lock().push(event.id.clone());
    }

    fn on_eose(&self, _relay_url: &str) {
        *self.eose.lock() += 1;
    }

    fn on_status(&self, _relay_url: &str, status: &RelayStatus) {
        self.statuses.lock().push(status.clone());
    }
}
