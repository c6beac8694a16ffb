#![allow(dead_code)]

use nostr::{Event, KIND_METADATA};
use nostr_client::testing::MockTransport;
use nostr_client::{FetcherConfig, TimeoutPolicy};
use nostr_graph::{GraphConfig, NodeGraph, NodeId, Value};
use std::sync::{Arc, Once};
use std::time::Duration;

pub const RELAY: &str = "wss://relay.example";
pub const SILENT_RELAY: &str = "wss://silent.example";
pub const PROFILE_RELAY: &str = "wss://profiles.example";

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

pub fn alice() -> String {
    hex_id(0xa11ce)
}

pub fn bob() -> String {
    hex_id(0xb0b)
}

pub fn note(n: u64, pubkey: &str, kind: u16, content: &str) -> Event {
    Event {
        id: hex_id(n),
        pubkey: pubkey.to_string(),
        created_at: 1_000 + n,
        kind,
        tags: vec![],
        content: content.to_string(),
        sig: String::new(),
    }
}

pub fn metadata(n: u64, pubkey: &str, name: &str) -> Event {
    Event {
        content: format!(r#"{{"name":"{name}"}}"#),
        ..note(n, pubkey, KIND_METADATA, "")
    }
}

/// Graph over a mock transport: sources default to [`RELAY`], profiles are
/// looked up on [`PROFILE_RELAY`], one-shot deadline of one second.
pub fn setup() -> (Arc<MockTransport>, NodeGraph) {
    init_tracing();
    let transport = MockTransport::new();
    let config = GraphConfig {
        default_relays: vec![RELAY.to_string()],
        timeouts: TimeoutPolicy { one_shot_ms: 1_000 },
        fetcher: FetcherConfig {
            relays: vec![PROFILE_RELAY.to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let graph = NodeGraph::with_transport(transport.clone(), config);
    (transport, graph)
}

/// Long enough for the multiplexer to flush and the mock relay to answer.
pub async fn past_debounce() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

/// Ids of the events a display holds, in display order.
pub fn display_ids(graph: &NodeGraph, display: NodeId) -> Vec<String> {
    graph
        .display_events(display)
        .unwrap()
        .into_iter()
        .map(|event| event.id)
        .collect()
}

/// Sorted keys of an output socket's values.
pub fn output_keys(graph: &NodeGraph, node: NodeId, socket: &str) -> Vec<String> {
    let mut keys: Vec<String> = graph
        .output_values(node, socket)
        .unwrap()
        .iter()
        .map(Value::key)
        .collect();
    keys.sort();
    keys
}
