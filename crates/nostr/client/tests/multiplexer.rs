//! Relay multiplexer behavior against the recording transport.

mod common;

use common::{OTHER_RELAY, RELAY, Recorder, event, hex_id, init_tracing, settle};
use nostr::Filter;
use nostr_client::testing::MockTransport;
use nostr_client::{
    ClientMessage, MultiplexerConfig, QueryOutcome, RelayMultiplexer, RelayStatus, TransportEvent,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const ALICE: &str = "alice";
const BOB: &str = "bob";

fn setup() -> (Arc<MockTransport>, RelayMultiplexer) {
    init_tracing();
    let transport = MockTransport::new();
    let mux = RelayMultiplexer::new(transport.clone(), MultiplexerConfig::default());
    (transport, mux)
}

async fn past_debounce() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn as_set(filters: Vec<Filter>) -> HashSet<Filter> {
    filters.into_iter().collect()
}

#[tokio::test(start_paused = true)]
async fn test_one_wire_query_carries_filter_union() {
    let (transport, mux) = setup();
    let f1 = Filter::new().kinds([1]);
    let f2 = Filter::new().authors([ALICE]);
    let f3 = Filter::new().kinds([7]).since(100);

    mux.subscribe(RELAY, "c1", vec![f1.clone()], Arc::new(Recorder::default()));
    mux.subscribe(RELAY, "c2", vec![f2.clone(), f1.clone()], Arc::new(Recorder::default()));
    mux.subscribe(RELAY, "c3", vec![f3.clone()], Arc::new(Recorder::default()));
    past_debounce().await;

    let requests = transport.requests(RELAY);
    assert_eq!(requests.len(), 1);
    let (_, filters) = &requests[0];
    assert_eq!(filters.len(), 3);
    assert_eq!(as_set(filters.clone()), as_set(vec![f1, f2, f3]));
    assert_eq!(as_set(mux.current_filters(RELAY)), as_set(filters.clone()));
    assert_eq!(transport.connect_count(RELAY), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_changes_coalesce_into_one_flush() {
    let (transport, mux) = setup();
    let handler = Arc::new(Recorder::default());

    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(mux.update_filters(RELAY, "c1", vec![Filter::new().kinds([1, 6])]));
    tokio::time::sleep(Duration::from_millis(60)).await;
    mux.subscribe(RELAY, "c2", vec![Filter::new().kinds([7])], handler);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(transport.requests(RELAY).is_empty());

    past_debounce().await;
    let requests = transport.requests(RELAY);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        as_set(requests[0].1.clone()),
        as_set(vec![Filter::new().kinds([1, 6]), Filter::new().kinds([7])])
    );
}

#[tokio::test(start_paused = true)]
async fn test_events_are_rematched_per_subscriber() {
    let (transport, mux) = setup();
    let notes = Arc::new(Recorder::default());
    let alice = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "notes", vec![Filter::new().kinds([1])], notes.clone());
    mux.subscribe(RELAY, "alice", vec![Filter::new().authors([ALICE])], alice.clone());
    past_debounce().await;

    let (sub_id, _) = transport.last_request(RELAY).unwrap();
    // Matches the union but only the "notes" filter.
    transport.push_event(RELAY, &sub_id, event(1, BOB, 1, 10));
    // Matches the union but only the "alice" filter.
    transport.push_event(RELAY, &sub_id, event(2, ALICE, 7, 10));
    // Matches both.
    transport.push_event(RELAY, &sub_id, event(3, ALICE, 1, 10));
    // Matches neither.
    transport.push_event(RELAY, &sub_id, event(4, BOB, 7, 10));
    settle().await;

    assert_eq!(notes.event_ids(), vec![hex_id(1), hex_id(3)]);
    assert_eq!(alice.event_ids(), vec![hex_id(2), hex_id(3)]);
}

#[tokio::test(start_paused = true)]
async fn test_events_for_stale_subscription_are_dropped() {
    let (transport, mux) = setup();
    let handler = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    past_debounce().await;
    let (old_id, _) = transport.last_request(RELAY).unwrap();

    mux.update_filters(RELAY, "c1", vec![Filter::new().kinds([1, 7])]);
    past_debounce().await;
    let (new_id, _) = transport.last_request(RELAY).unwrap();
    assert_ne!(old_id, new_id);
    assert_eq!(transport.closes(RELAY), vec![old_id.clone()]);

    transport.push_event(RELAY, &old_id, event(1, BOB, 1, 10));
    transport.push_event(RELAY, &new_id, event(2, BOB, 7, 10));
    settle().await;
    assert_eq!(handler.event_ids(), vec![hex_id(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_replaces_filters() {
    let (transport, mux) = setup();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());

    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], first.clone());
    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([7])], second.clone());
    past_debounce().await;

    assert_eq!(mux.subscriber_count(RELAY), 1);
    assert_eq!(
        mux.consumer_filters(RELAY, "c1"),
        Some(vec![Filter::new().kinds([7])])
    );
    let (sub_id, filters) = transport.last_request(RELAY).unwrap();
    assert_eq!(filters, vec![Filter::new().kinds([7])]);

    transport.push_event(RELAY, &sub_id, event(1, BOB, 7, 10));
    settle().await;
    assert!(first.event_ids().is_empty());
    assert_eq!(second.event_ids(), vec![hex_id(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_absent_consumer_is_noop() {
    let (transport, mux) = setup();
    mux.unsubscribe(RELAY, "nobody");
    assert!(mux.relay_urls().is_empty());

    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], Arc::new(Recorder::default()));
    past_debounce().await;
    mux.unsubscribe(RELAY, "nobody");
    past_debounce().await;

    assert_eq!(mux.subscriber_count(RELAY), 1);
    assert_eq!(transport.requests(RELAY).len(), 1);
    assert!(transport.closes(RELAY).is_empty());
    assert!(!mux.update_filters(RELAY, "nobody", vec![]));
    assert!(!mux.update_filters(OTHER_RELAY, "c1", vec![]));
}

#[tokio::test(start_paused = true)]
async fn test_last_unsubscribe_disposes_connection() {
    let (transport, mux) = setup();
    let handler = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    mux.subscribe(RELAY, "c2", vec![Filter::new().kinds([7])], handler.clone());
    past_debounce().await;
    let (sub_id, _) = transport.last_request(RELAY).unwrap();

    mux.unsubscribe(RELAY, "c1");
    assert_eq!(mux.relay_urls(), vec![RELAY.to_string()]);
    assert_eq!(transport.disconnect_count(RELAY), 0);

    mux.unsubscribe(RELAY, "c2");
    assert!(mux.relay_urls().is_empty());
    assert_eq!(transport.closes(RELAY), vec![sub_id]);
    assert_eq!(transport.disconnect_count(RELAY), 1);
    assert!(!transport.is_connected(RELAY));

    // A fresh subscription opens a fresh connection.
    mux.subscribe(RELAY, "c3", vec![Filter::new().kinds([1])], handler);
    past_debounce().await;
    assert_eq!(transport.connect_count(RELAY), 2);
    assert_eq!(transport.requests(RELAY).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_delivery_immediately() {
    let (transport, mux) = setup();
    let keep = Arc::new(Recorder::default());
    let leave = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "keep", vec![Filter::new().kinds([1])], keep.clone());
    mux.subscribe(RELAY, "leave", vec![Filter::new().kinds([1])], leave.clone());
    past_debounce().await;
    let (sub_id, _) = transport.last_request(RELAY).unwrap();

    // Queued before the unsubscribe, processed after it.
    transport.push_event(RELAY, &sub_id, event(1, BOB, 1, 10));
    mux.unsubscribe(RELAY, "leave");
    settle().await;

    assert_eq!(keep.event_ids(), vec![hex_id(1)]);
    assert!(leave.event_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_eose_fans_out_once_per_wire_eose() {
    let (transport, mux) = setup();
    let a = Arc::new(Recorder::default());
    let b = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "a", vec![Filter::new().kinds([1])], a.clone());
    mux.subscribe(RELAY, "b", vec![Filter::new().kinds([7])], b.clone());
    past_debounce().await;
    let (sub_id, _) = transport.last_request(RELAY).unwrap();

    transport.push_eose(RELAY, &sub_id);
    transport.push_eose(RELAY, &sub_id);
    transport.push_eose(RELAY, "unrelated");
    settle().await;

    assert_eq!(a.eose_count(), 1);
    assert_eq!(b.eose_count(), 1);
    assert_eq!(a.last_status(), Some(RelayStatus::EndOfStoredEvents));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reflushes_union() {
    let (transport, mux) = setup();
    let handler = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    past_debounce().await;
    assert_eq!(transport.requests(RELAY).len(), 1);

    transport.push(RELAY, TransportEvent::Disconnected);
    transport.push(RELAY, TransportEvent::Connected);
    settle().await;

    let requests = transport.requests(RELAY);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1, vec![Filter::new().kinds([1])]);
    assert_eq!(mux.subscriber_count(RELAY), 1);
    assert_eq!(handler.last_status(), Some(RelayStatus::Subscribed));
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_keep_registration() {
    let (transport, mux) = setup();
    let handler = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    past_debounce().await;
    let (sub_id, _) = transport.last_request(RELAY).unwrap();

    transport.push(RELAY, TransportEvent::Error("socket reset".to_string()));
    settle().await;
    assert_eq!(
        handler.last_status(),
        Some(RelayStatus::Error("socket reset".to_string()))
    );
    assert_eq!(mux.subscriber_count(RELAY), 1);

    transport.push_event(RELAY, &sub_id, event(1, BOB, 1, 10));
    settle().await;
    assert_eq!(handler.event_ids(), vec![hex_id(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_is_retried_on_next_flush() {
    let (transport, mux) = setup();
    transport.refuse(OTHER_RELAY);
    let handler = Arc::new(Recorder::default());

    mux.subscribe(OTHER_RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    assert!(matches!(handler.last_status(), Some(RelayStatus::Error(_))));
    assert_eq!(mux.relay_urls(), vec![OTHER_RELAY.to_string()]);

    past_debounce().await;
    assert!(transport.connect_count(OTHER_RELAY) >= 2);
    assert!(transport.requests(OTHER_RELAY).is_empty());
    assert_eq!(mux.subscriber_count(OTHER_RELAY), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_closed_subscription_reports_closed() {
    let (transport, mux) = setup();
    let handler = Arc::new(Recorder::default());
    mux.subscribe(RELAY, "c1", vec![Filter::new().kinds([1])], handler.clone());
    past_debounce().await;
    let (sub_id, _) = transport.last_request(RELAY).unwrap();

    transport.push(
        RELAY,
        TransportEvent::Message(nostr_client::RelayMessage::Closed {
            subscription_id: sub_id,
            message: "error: too many subscriptions".to_string(),
        }),
    );
    settle().await;
    assert_eq!(handler.last_status(), Some(RelayStatus::Closed));
    assert!(mux.current_filters(RELAY).is_empty());
    assert_eq!(mux.subscriber_count(RELAY), 1);
}

#[tokio::test(start_paused = true)]
async fn test_query_dedupes_across_relays_and_cleans_up() {
    let (transport, mux) = setup();
    transport.store(RELAY, [event(1, ALICE, 1, 10), event(2, ALICE, 1, 20)]);
    transport.store(OTHER_RELAY, [event(2, ALICE, 1, 20), event(3, ALICE, 1, 30)]);

    let relays = vec![RELAY.to_string(), OTHER_RELAY.to_string()];
    let result = mux
        .query(&relays, vec![Filter::new().authors([ALICE])], Duration::from_secs(5))
        .await;

    assert_eq!(result.outcome, QueryOutcome::Complete);
    let mut ids: Vec<String> = result.events.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec![hex_id(1), hex_id(2), hex_id(3)]);
    assert!(mux.relay_urls().is_empty());
    assert_eq!(transport.disconnect_count(RELAY), 1);
    assert_eq!(transport.disconnect_count(OTHER_RELAY), 1);
}

#[tokio::test(start_paused = true)]
async fn test_query_times_out_on_silent_relay() {
    let (transport, mux) = setup();
    transport.store(RELAY, [event(1, ALICE, 1, 10)]);

    let relays = vec![RELAY.to_string(), OTHER_RELAY.to_string()];
    let started = tokio::time::Instant::now();
    let mut streamed = Vec::new();
    let result = mux
        .query_with(
            &relays,
            vec![Filter::new().kinds([1])],
            Duration::from_secs(2),
            |relay, event| streamed.push((relay.to_string(), event.id.clone())),
        )
        .await;

    assert_eq!(result.outcome, QueryOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(streamed, vec![(RELAY.to_string(), hex_id(1))]);
    assert_eq!(result.events.len(), 1);
    assert!(mux.relay_urls().is_empty());
    assert!(
        transport
            .sent(OTHER_RELAY)
            .iter()
            .any(|m| matches!(m, ClientMessage::Close { .. }))
    );
}
