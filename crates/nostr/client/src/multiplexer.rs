//! Relay subscription multiplexer.
//!
//! Many logical consumers register filters against a relay URL; the
//! multiplexer keeps at most one wire subscription per relay carrying the
//! union of those filters, and routes each inbound event only to the
//! consumers whose own filters match it.
//!
//! Filter churn is coalesced: every change cancels and reschedules a single
//! debounce timer per relay, and the union is sent when it fires.

use crate::config::MultiplexerConfig;
use crate::message::{ClientMessage, RelayMessage};
use crate::subscription::{SubscriptionTracker, generate_subscription_id};
use crate::transport::{RelayTransport, TransportEvent, TransportReceiver};
use nostr::{Event, Filter, matches_any};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay state as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// Waiting for the transport to open the connection
    Connecting,
    /// Connection open, no query sent yet
    Connected,
    /// Query sent, stored events streaming
    Subscribed,
    /// Relay finished sending stored events
    EndOfStoredEvents,
    /// Transport or relay failure; the subscription stays registered
    Error(String),
    /// Relay closed the subscription
    Closed,
}

/// Callbacks for one consumer's subscription on one relay.
///
/// Callbacks are never invoked while the multiplexer holds its internal lock,
/// so they may call back into the multiplexer.
pub trait SubscriptionHandler: Send + Sync {
    /// An event matching this consumer's filters arrived.
    fn on_event(&self, relay_url: &str, event: &Event);

    /// The relay finished sending stored events for this consumer's filters.
    fn on_eose(&self, _relay_url: &str) {}

    /// The relay connection or subscription changed state.
    fn on_status(&self, _relay_url: &str, _status: &RelayStatus) {}
}

struct Subscriber {
    filters: Vec<Filter>,
    handler: Arc<dyn SubscriptionHandler>,
    /// Cleared on unsubscribe/replace so in-flight deliveries are dropped
    active: Arc<AtomicBool>,
    /// Wire subscription carrying this subscriber's current filters
    wire_id: Option<String>,
}

struct RelaySubscription {
    generation: u64,
    subscribers: BTreeMap<String, Subscriber>,
    wire_id: Option<String>,
    sent_filters: Vec<Filter>,
    eose_received: bool,
    connected: bool,
    flush_on_connect: bool,
    pending_flush: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl RelaySubscription {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            subscribers: BTreeMap::new(),
            wire_id: None,
            sent_filters: Vec::new(),
            eose_received: false,
            connected: false,
            flush_on_connect: false,
            pending_flush: None,
            reader: None,
        }
    }

    /// Union of every subscriber's filters, duplicates removed.
    fn union_filters(&self) -> Vec<Filter> {
        let mut seen = HashSet::new();
        self.subscribers
            .values()
            .flat_map(|sub| sub.filters.iter())
            .filter(|filter| seen.insert(*filter))
            .cloned()
            .collect()
    }

    fn targets(&self, mut include: impl FnMut(&Subscriber) -> bool) -> Vec<Target> {
        self.subscribers
            .values()
            .filter(|sub| include(*sub))
            .map(|sub| Target {
                handler: sub.handler.clone(),
                active: sub.active.clone(),
            })
            .collect()
    }

    fn all_targets(&self) -> Vec<Target> {
        self.targets(|_| true)
    }

    fn shutdown_tasks(&mut self) {
        if let Some(task) = self.pending_flush.take() {
            task.abort();
        }
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }
}

struct Target {
    handler: Arc<dyn SubscriptionHandler>,
    active: Arc<AtomicBool>,
}

enum Notice<'a> {
    Event(&'a Event),
    Eose,
    Status(RelayStatus),
}

fn deliver(relay_url: &str, targets: &[Target], notice: Notice<'_>) {
    for target in targets {
        if !target.active.load(Ordering::Acquire) {
            continue;
        }
        match &notice {
            Notice::Event(event) => target.handler.on_event(relay_url, event),
            Notice::Eose => {
                target.handler.on_eose(relay_url);
                target
                    .handler
                    .on_status(relay_url, &RelayStatus::EndOfStoredEvents);
            }
            Notice::Status(status) => target.handler.on_status(relay_url, status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Debounce,
    Reconnect,
}

struct Shared {
    transport: Arc<dyn RelayTransport>,
    config: MultiplexerConfig,
    relays: Mutex<HashMap<String, RelaySubscription>>,
    next_generation: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (url, relay) in self.relays.get_mut().iter_mut() {
            relay.shutdown_tasks();
            self.transport.disconnect(url);
        }
    }
}

impl Shared {
    /// Open the transport connection for `relay` if it has no reader.
    /// Returns the connect error, if any.
    fn ensure_open(self: &Arc<Self>, url: &str, relay: &mut RelaySubscription) -> Option<String> {
        if relay.reader.is_some() {
            return None;
        }
        match self.transport.connect(url) {
            Ok(rx) => {
                relay.reader = Some(spawn_reader(self, url.to_string(), relay.generation, rx));
                None
            }
            Err(e) => {
                warn!(relay = %url, error = %e, "Failed to connect to relay");
                relay.flush_on_connect = true;
                Some(e.to_string())
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>, url: &str, relay: &mut RelaySubscription) {
        if let Some(task) = relay.pending_flush.take() {
            task.abort();
        }
        let weak = Arc::downgrade(self);
        let url = url.to_string();
        let generation = relay.generation;
        let debounce = self.config.debounce();
        relay.pending_flush = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(shared) = weak.upgrade() {
                shared.flush(&url, generation, FlushReason::Debounce);
            }
        }));
    }

    /// Send the current filter union to the relay as one wire subscription.
    fn flush(self: &Arc<Self>, url: &str, generation: u64, reason: FlushReason) {
        let (targets, status) = {
            let mut relays = self.relays.lock();
            let Some(relay) = relays.get_mut(url) else {
                return;
            };
            if relay.generation != generation {
                return;
            }
            if reason == FlushReason::Debounce {
                relay.pending_flush = None;
            }

            if let Some(error) = self.ensure_open(url, relay) {
                (relay.all_targets(), RelayStatus::Error(error))
            } else if !relay.connected {
                debug!(relay = %url, "Relay not connected yet, deferring flush");
                relay.flush_on_connect = true;
                return;
            } else {
                let filters = relay.union_filters();
                let up_to_date = relay.wire_id.is_some()
                    && filters == relay.sent_filters
                    && relay
                        .subscribers
                        .values()
                        .all(|sub| sub.filters.is_empty() || sub.wire_id == relay.wire_id);
                if reason == FlushReason::Debounce && up_to_date {
                    debug!(relay = %url, "Relay filters unchanged, skipping flush");
                    return;
                }

                let previous = relay.wire_id.take();
                relay.sent_filters.clear();
                relay.eose_received = false;
                for sub in relay.subscribers.values_mut() {
                    sub.wire_id = None;
                }

                if let Some(subscription_id) = previous
                    && reason == FlushReason::Debounce
                    && let Err(e) = self
                        .transport
                        .send(url, ClientMessage::Close { subscription_id })
                {
                    warn!(relay = %url, error = %e, "Failed to close previous subscription");
                }

                if filters.is_empty() {
                    debug!(relay = %url, "No filters registered, relay idle");
                    return;
                }

                let subscription_id = generate_subscription_id();
                let request = ClientMessage::Req {
                    subscription_id: subscription_id.clone(),
                    filters: filters.clone(),
                };
                match self.transport.send(url, request) {
                    Ok(()) => {
                        debug!(
                            relay = %url,
                            subscription_id = %subscription_id,
                            filters = filters.len(),
                            subscribers = relay.subscribers.len(),
                            ?reason,
                            "Flushed relay subscription"
                        );
                        for sub in relay.subscribers.values_mut() {
                            if !sub.filters.is_empty() {
                                sub.wire_id = Some(subscription_id.clone());
                            }
                        }
                        relay.wire_id = Some(subscription_id);
                        relay.sent_filters = filters;
                        (
                            relay.targets(|sub| !sub.filters.is_empty()),
                            RelayStatus::Subscribed,
                        )
                    }
                    Err(e) => {
                        warn!(relay = %url, error = %e, "Failed to send subscription");
                        relay.flush_on_connect = true;
                        (relay.all_targets(), RelayStatus::Error(e.to_string()))
                    }
                }
            }
        };
        deliver(url, &targets, Notice::Status(status));
    }

    fn handle_transport_event(self: &Arc<Self>, url: &str, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let (targets, reflush) = {
                    let mut relays = self.relays.lock();
                    let Some(relay) = relays
                        .get_mut(url)
                        .filter(|relay| relay.generation == generation)
                    else {
                        return;
                    };
                    relay.connected = true;
                    let reflush = relay.flush_on_connect || relay.wire_id.is_some();
                    relay.flush_on_connect = false;
                    (relay.all_targets(), reflush)
                };
                info!(relay = %url, "Relay connected");
                deliver(url, &targets, Notice::Status(RelayStatus::Connected));
                if reflush {
                    self.flush(url, generation, FlushReason::Reconnect);
                }
            }
            TransportEvent::Message(message) => self.handle_message(url, generation, message),
            TransportEvent::Error(error) => {
                warn!(relay = %url, error = %error, "Relay transport error");
                let targets = self.targets_for(url, generation, |_| {});
                deliver(url, &targets, Notice::Status(RelayStatus::Error(error)));
            }
            TransportEvent::Disconnected => {
                info!(relay = %url, "Relay disconnected");
                let targets = self.targets_for(url, generation, |relay| relay.connected = false);
                deliver(
                    url,
                    &targets,
                    Notice::Status(RelayStatus::Error("connection closed".to_string())),
                );
            }
        }
    }

    fn handle_message(&self, url: &str, generation: u64, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let targets = {
                    let relays = self.relays.lock();
                    let Some(relay) = relays
                        .get(url)
                        .filter(|relay| relay.generation == generation)
                    else {
                        return;
                    };
                    if relay.wire_id.as_deref() != Some(subscription_id.as_str()) {
                        debug!(relay = %url, subscription_id = %subscription_id, "Dropping event for stale subscription");
                        return;
                    }
                    relay.targets(|sub| matches_any(&sub.filters, &event))
                };
                deliver(url, &targets, Notice::Event(&event));
            }
            RelayMessage::Eose { subscription_id } => {
                let targets = {
                    let mut relays = self.relays.lock();
                    let Some(relay) = relays
                        .get_mut(url)
                        .filter(|relay| relay.generation == generation)
                    else {
                        return;
                    };
                    if relay.eose_received
                        || relay.wire_id.as_deref() != Some(subscription_id.as_str())
                    {
                        return;
                    }
                    relay.eose_received = true;
                    relay.targets(|sub| sub.wire_id.as_deref() == Some(subscription_id.as_str()))
                };
                debug!(relay = %url, subscription_id = %subscription_id, subscribers = targets.len(), "End of stored events");
                deliver(url, &targets, Notice::Eose);
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let targets = {
                    let mut relays = self.relays.lock();
                    let Some(relay) = relays
                        .get_mut(url)
                        .filter(|relay| relay.generation == generation)
                    else {
                        return;
                    };
                    if relay.wire_id.as_deref() != Some(subscription_id.as_str()) {
                        return;
                    }
                    relay.wire_id = None;
                    relay.sent_filters.clear();
                    let targets = relay.targets(|sub| sub.wire_id.is_some());
                    for sub in relay.subscribers.values_mut() {
                        sub.wire_id = None;
                    }
                    targets
                };
                warn!(relay = %url, subscription_id = %subscription_id, message = %message, "Relay closed subscription");
                deliver(url, &targets, Notice::Status(RelayStatus::Closed));
            }
            RelayMessage::Notice { message } => {
                info!(relay = %url, message = %message, "Relay notice");
            }
            RelayMessage::Ok {
                event_id, success, ..
            } => {
                debug!(relay = %url, event_id = %event_id, success, "Ignoring OK frame");
            }
        }
    }

    fn targets_for(
        &self,
        url: &str,
        generation: u64,
        update: impl FnOnce(&mut RelaySubscription),
    ) -> Vec<Target> {
        let mut relays = self.relays.lock();
        match relays
            .get_mut(url)
            .filter(|relay| relay.generation == generation)
        {
            Some(relay) => {
                update(relay);
                relay.all_targets()
            }
            None => Vec::new(),
        }
    }
}

fn spawn_reader(
    shared: &Arc<Shared>,
    url: String,
    generation: u64,
    mut rx: TransportReceiver,
) -> JoinHandle<()> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.handle_transport_event(&url, generation, event);
        }
        // Channel closed by the transport: forget the reader so the next
        // flush reconnects.
        if let Some(shared) = weak.upgrade() {
            shared.handle_transport_event(&url, generation, TransportEvent::Disconnected);
            let mut relays = shared.relays.lock();
            if let Some(relay) = relays
                .get_mut(&url)
                .filter(|relay| relay.generation == generation)
            {
                relay.reader = None;
                relay.flush_on_connect = true;
            }
        }
    })
}

/// How a one-shot query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Every relay sent EOSE (or closed the subscription)
    Complete,
    /// The deadline elapsed first; results are partial
    TimedOut,
}

/// Events collected by a one-shot query, deduplicated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub events: Vec<Event>,
    pub outcome: QueryOutcome,
}

impl QueryResult {
    pub fn is_complete(&self) -> bool {
        self.outcome == QueryOutcome::Complete
    }
}

enum QueryNotice {
    Event(String, Event),
    Done(String),
}

struct QueryHandler {
    tx: mpsc::UnboundedSender<QueryNotice>,
}

impl SubscriptionHandler for QueryHandler {
    fn on_event(&self, relay_url: &str, event: &Event) {
        let _ = self
            .tx
            .send(QueryNotice::Event(relay_url.to_string(), event.clone()));
    }

    fn on_eose(&self, relay_url: &str) {
        let _ = self.tx.send(QueryNotice::Done(relay_url.to_string()));
    }

    fn on_status(&self, relay_url: &str, status: &RelayStatus) {
        if *status == RelayStatus::Closed {
            let _ = self.tx.send(QueryNotice::Done(relay_url.to_string()));
        }
    }
}

/// Unsubscribes a one-shot query from every relay when dropped, including
/// when the awaiting task is aborted.
struct QueryGuard<'a> {
    multiplexer: &'a RelayMultiplexer,
    relays: Vec<String>,
    consumer_id: String,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        for relay in &self.relays {
            self.multiplexer.unsubscribe(relay, &self.consumer_id);
        }
    }
}

/// Per-relay registry merging many consumers into one wire subscription.
///
/// Cheap to clone; clones share state. Must be used from within a tokio
/// runtime. Transport methods are called with the registry lock held, so a
/// transport must never call back into the multiplexer synchronously.
#[derive(Clone)]
pub struct RelayMultiplexer {
    shared: Arc<Shared>,
}

impl RelayMultiplexer {
    /// Create a multiplexer over the given transport.
    pub fn new(transport: Arc<dyn RelayTransport>, config: MultiplexerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                relays: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register (or replace) `consumer_id`'s filters on `relay_url`.
    ///
    /// The first subscriber for a relay opens the connection; the filter union
    /// is sent after the debounce window.
    pub fn subscribe(
        &self,
        relay_url: &str,
        consumer_id: &str,
        filters: Vec<Filter>,
        handler: Arc<dyn SubscriptionHandler>,
    ) {
        let shared = &self.shared;
        let active = Arc::new(AtomicBool::new(true));
        let target = Target {
            handler: handler.clone(),
            active: active.clone(),
        };

        let status = {
            let mut relays = shared.relays.lock();
            let relay = match relays.entry(relay_url.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    info!(relay = %relay_url, "Opening relay subscription");
                    let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
                    entry.insert(RelaySubscription::new(generation))
                }
            };

            let subscriber = Subscriber {
                filters,
                handler,
                active,
                wire_id: None,
            };
            if let Some(previous) = relay.subscribers.insert(consumer_id.to_string(), subscriber) {
                previous.active.store(false, Ordering::Release);
                debug!(relay = %relay_url, consumer = %consumer_id, "Replaced subscriber filters");
            }

            let status = match shared.ensure_open(relay_url, relay) {
                Some(error) => RelayStatus::Error(error),
                None if relay.connected => RelayStatus::Connected,
                None => RelayStatus::Connecting,
            };
            shared.schedule_flush(relay_url, relay);
            status
        };

        deliver(relay_url, &[target], Notice::Status(status));
    }

    /// Replace the filters of an existing subscriber. Returns false when the
    /// consumer is not registered on this relay.
    pub fn update_filters(&self, relay_url: &str, consumer_id: &str, filters: Vec<Filter>) -> bool {
        let mut relays = self.shared.relays.lock();
        let Some(relay) = relays.get_mut(relay_url) else {
            return false;
        };
        let Some(subscriber) = relay.subscribers.get_mut(consumer_id) else {
            return false;
        };
        subscriber.filters = filters;
        subscriber.wire_id = None;
        self.shared.schedule_flush(relay_url, relay);
        true
    }

    /// Remove a subscriber. Delivery to it stops immediately. Removing the
    /// last subscriber of a relay closes the wire subscription and the
    /// connection. Unknown consumers are ignored.
    pub fn unsubscribe(&self, relay_url: &str, consumer_id: &str) {
        let mut relays = self.shared.relays.lock();
        let Some(relay) = relays.get_mut(relay_url) else {
            return;
        };
        let Some(subscriber) = relay.subscribers.remove(consumer_id) else {
            return;
        };
        subscriber.active.store(false, Ordering::Release);

        if !relay.subscribers.is_empty() {
            self.shared.schedule_flush(relay_url, relay);
            return;
        }

        if let Some(mut relay) = relays.remove(relay_url) {
            relay.shutdown_tasks();
            if let Some(subscription_id) = relay.wire_id.take()
                && let Err(e) = self
                    .shared
                    .transport
                    .send(relay_url, ClientMessage::Close { subscription_id })
            {
                warn!(relay = %relay_url, error = %e, "Failed to close subscription");
            }
            self.shared.transport.disconnect(relay_url);
            info!(relay = %relay_url, "Disposed relay subscription");
        }
    }

    /// Relays with at least one subscriber, sorted.
    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.shared.relays.lock().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Number of subscribers registered on a relay.
    pub fn subscriber_count(&self, relay_url: &str) -> usize {
        self.shared
            .relays
            .lock()
            .get(relay_url)
            .map_or(0, |relay| relay.subscribers.len())
    }

    /// The filter union most recently sent to a relay.
    pub fn current_filters(&self, relay_url: &str) -> Vec<Filter> {
        self.shared
            .relays
            .lock()
            .get(relay_url)
            .map(|relay| relay.sent_filters.clone())
            .unwrap_or_default()
    }

    /// The filters a consumer registered on a relay.
    pub fn consumer_filters(&self, relay_url: &str, consumer_id: &str) -> Option<Vec<Filter>> {
        self.shared
            .relays
            .lock()
            .get(relay_url)?
            .subscribers
            .get(consumer_id)
            .map(|sub| sub.filters.clone())
    }

    /// One-shot query: collect events until every relay sends EOSE or the
    /// deadline elapses.
    pub async fn query(&self, relays: &[String], filters: Vec<Filter>, deadline: Duration) -> QueryResult {
        self.query_with(relays, filters, deadline, |_, _| {}).await
    }

    /// Like [`query`](Self::query), also streaming each new event to `on_event`.
    pub async fn query_with(
        &self,
        relays: &[String],
        filters: Vec<Filter>,
        deadline: Duration,
        mut on_event: impl FnMut(&str, &Event) + Send,
    ) -> QueryResult {
        let mut events = Vec::new();
        if relays.is_empty() || filters.is_empty() {
            return QueryResult {
                events,
                outcome: QueryOutcome::Complete,
            };
        }

        let consumer_id = format!("query-{}", generate_subscription_id());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn SubscriptionHandler> = Arc::new(QueryHandler { tx });
        let mut tracker = SubscriptionTracker::new(relays.iter().cloned());
        let _guard = QueryGuard {
            multiplexer: self,
            relays: relays.to_vec(),
            consumer_id: consumer_id.clone(),
        };
        for relay in relays {
            self.subscribe(relay, &consumer_id, filters.clone(), handler.clone());
        }
        drop(handler);

        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut seen = HashSet::new();
        let outcome = loop {
            match tokio::time::timeout_at(deadline_at, rx.recv()).await {
                Ok(Some(QueryNotice::Event(relay, event))) => {
                    if seen.insert(event.id.clone()) {
                        on_event(&relay, &event);
                        events.push(event);
                    }
                }
                Ok(Some(QueryNotice::Done(relay))) => {
                    if tracker.mark_eose(&relay) {
                        break QueryOutcome::Complete;
                    }
                }
                Ok(None) => break QueryOutcome::Complete,
                Err(_) => {
                    debug!(
                        consumer = %consumer_id,
                        waiting_on = ?tracker.waiting_on().collect::<Vec<_>>(),
                        "One-shot query deadline elapsed"
                    );
                    break QueryOutcome::TimedOut;
                }
            }
        };

        QueryResult { events, outcome }
    }
}
