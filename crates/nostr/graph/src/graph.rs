//! The node graph runtime.
//!
//! All graph state sits behind one lock. Edits and relay callbacks mutate it
//! and collect [`Effect`]s (multiplexer and fetcher calls); effects run after
//! the lock is released, so those services may call straight back into the
//! graph.

use crate::channel::{ChannelMessage, SignalChannel, SubscriptionToken};
use crate::config::GraphConfig;
use crate::control::{Control, ControlValue, apply_control, node_controls};
use crate::display::{Branch, Completion, DisplayState, completion};
use crate::error::{GraphError, Result};
use crate::node::{Connection, NodeId, NodeKind};
use crate::operator::{OperatorKind, OperatorState, Side};
use crate::search::{Matcher, SearchParams};
use crate::source::{DynamicInputs, SourceParams, Strategy, derive_filters, derive_relays, normalize_relay};
use crate::status::NodeStatus;
use crate::value::{Polarity, Signal, Value};
use nostr::{Event, Filter, display_order, matches_any};
use nostr_client::{
    ClientError, LookupCache, Profile, ProfileFetcher, RelayMultiplexer, RelayStatus, RelayTransport,
    SubscriptionHandler,
};
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Multiplexer consumer id of a source node.
fn consumer_id(node: NodeId) -> String {
    format!("graph-source-{node}")
}

/// Deferred call into the multiplexer or the profile fetcher.
enum Effect {
    Subscribe {
        relay: String,
        consumer: String,
        filters: Vec<Filter>,
        handler: Arc<dyn SubscriptionHandler>,
    },
    Unsubscribe {
        relay: String,
        consumer: String,
    },
    RequestProfile {
        display: NodeId,
        pubkey: String,
    },
    CancelProfiles {
        display: NodeId,
    },
}

/// Values present on one input socket, counted across the edges feeding it.
#[derive(Debug, Default)]
struct InputValues {
    entries: BTreeMap<String, InputEntry>,
    next_seq: u64,
}

#[derive(Debug)]
struct InputEntry {
    value: Value,
    count: usize,
    seq: u64,
}

impl InputValues {
    /// Returns true when membership changed.
    fn apply(&mut self, signal: &Signal) -> bool {
        let key = signal.value.key();
        match (signal.polarity, self.entries.entry(key)) {
            (Polarity::Add, Entry::Occupied(mut entry)) => {
                entry.get_mut().count += 1;
                false
            }
            (Polarity::Add, Entry::Vacant(entry)) => {
                entry.insert(InputEntry {
                    value: signal.value.clone(),
                    count: 1,
                    seq: self.next_seq,
                });
                self.next_seq += 1;
                true
            }
            (Polarity::Remove, Entry::Occupied(mut entry)) => {
                entry.get_mut().count -= 1;
                if entry.get().count == 0 {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            (Polarity::Remove, Entry::Vacant(_)) => false,
        }
    }

    fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().map(|entry| &entry.value)
    }

    /// Most recently added value still present.
    fn latest(&self) -> Option<&Value> {
        self.entries
            .values()
            .max_by_key(|entry| entry.seq)
            .map(|entry| &entry.value)
    }
}

/// Current values of one output socket.
#[derive(Debug, Default)]
struct OutputSet {
    values: BTreeMap<String, Value>,
    channel: SignalChannel,
}

impl OutputSet {
    /// Returns true when membership changed; changes are published.
    fn apply(&mut self, signal: &Signal) -> bool {
        let key = signal.value.key();
        let changed = match (signal.polarity, self.values.entry(key)) {
            (Polarity::Add, Entry::Vacant(entry)) => {
                entry.insert(signal.value.clone());
                true
            }
            (Polarity::Remove, Entry::Occupied(entry)) => {
                entry.remove();
                true
            }
            _ => false,
        };
        if changed {
            self.channel.publish(signal);
        }
        changed
    }
}

#[derive(Debug, Default)]
struct SourceRuntime {
    /// Filters derived on the last reconcile
    filters: Vec<Filter>,
    relays: Vec<String>,
    strategy: Strategy,
    /// Relays holding a live multiplexer subscription
    subscribed: BTreeSet<String>,
    /// Bumped on every (re)subscription; stale callbacks are ignored
    epoch: u64,
    eose: HashSet<String>,
    /// One-shot query finished
    done: bool,
    deadline: Option<JoinHandle<()>>,
    relay_status: BTreeMap<String, NodeStatus>,
    status: NodeStatus,
    events: BTreeMap<String, Event>,
    authors: HashMap<String, usize>,
}

impl SourceRuntime {
    /// Record `event`; returns (new event, first event of its author).
    fn insert(&mut self, event: &Event) -> (bool, bool) {
        if self.events.contains_key(&event.id) {
            return (false, false);
        }
        self.events.insert(event.id.clone(), event.clone());
        let count = self.authors.entry(event.pubkey.clone()).or_default();
        *count += 1;
        (true, *count == 1)
    }

    /// Drop events no longer matching `filters`; returns each with whether
    /// its author is now gone.
    fn retain_matching(&mut self, filters: &[Filter]) -> Vec<(Event, bool)> {
        let stale: Vec<String> = self
            .events
            .values()
            .filter(|event| !matches_any(filters, event))
            .map(|event| event.id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in stale {
            let Some(event) = self.events.remove(&id) else {
                continue;
            };
            let gone = match self.authors.get_mut(&event.pubkey) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                _ => {
                    self.authors.remove(&event.pubkey);
                    true
                }
            };
            removed.push((event, gone));
        }
        removed
    }

    /// Close every subscription and cancel the deadline.
    fn stop(&mut self, node: NodeId, effects: &mut Vec<Effect>) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        let consumer = consumer_id(node);
        for relay in std::mem::take(&mut self.subscribed) {
            effects.push(Effect::Unsubscribe {
                relay,
                consumer: consumer.clone(),
            });
        }
        self.relay_status.clear();
    }

    fn computed_status(&self) -> NodeStatus {
        if self.done {
            NodeStatus::EndOfStream
        } else if self.subscribed.is_empty() {
            NodeStatus::Idle
        } else if self.relay_status.is_empty() {
            NodeStatus::Connecting
        } else {
            NodeStatus::aggregate(self.relay_status.values())
        }
    }

    fn branch(&self) -> Branch {
        Branch {
            forward: self.strategy == Strategy::Forward,
            engaged: self.done || !self.subscribed.is_empty(),
            done: self.done,
        }
    }
}

#[derive(Debug)]
enum Runtime {
    Source(Box<SourceRuntime>),
    Operator(OperatorState),
    Search(Matcher),
    Display(DisplayState),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    inputs: BTreeMap<&'static str, InputValues>,
    outputs: BTreeMap<&'static str, OutputSet>,
    runtime: Runtime,
}

impl Node {
    fn new(kind: NodeKind, runtime: Runtime) -> Self {
        let inputs = kind
            .inputs()
            .iter()
            .map(|socket| (socket.name, InputValues::default()))
            .collect();
        let mut outputs: BTreeMap<&'static str, OutputSet> = kind
            .outputs()
            .iter()
            .map(|socket| (socket.name, OutputSet::default()))
            .collect();
        if let Some(status) = outputs.get_mut("status") {
            status.apply(&Signal::add(Value::RelayStatus(NodeStatus::Idle)));
        }
        Self {
            kind,
            inputs,
            outputs,
            runtime,
        }
    }

    /// Strings carried on an input socket.
    fn input_strings(&self, name: &str) -> Vec<String> {
        self.inputs
            .get(name)
            .map(|input| {
                input
                    .values()
                    .filter_map(|value| value.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn input_number(&self, name: &str) -> Option<u64> {
        self.inputs
            .get(name)
            .and_then(InputValues::latest)
            .and_then(Value::as_u64)
    }

    fn channels(&mut self) -> impl Iterator<Item = &mut SignalChannel> {
        let display = match &mut self.runtime {
            Runtime::Display(display) => Some(&mut display.channel),
            _ => None,
        };
        self.outputs
            .values_mut()
            .map(|output| &mut output.channel)
            .chain(display)
    }
}

/// A signal on its way to a node input.
struct Delivery {
    node: NodeId,
    input: &'static str,
    signal: Signal,
}

struct GraphState {
    config: GraphConfig,
    nodes: BTreeMap<NodeId, Node>,
    connections: BTreeSet<Connection>,
    queue: VecDeque<Delivery>,
    this: Weak<GraphInner>,
}

impl GraphState {
    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    fn source(&self, id: NodeId) -> Result<&SourceRuntime> {
        match &self.node(id)?.runtime {
            Runtime::Source(rt) => Ok(&**rt),
            _ => Err(GraphError::WrongKind(id, "source")),
        }
    }

    fn display(&self, id: NodeId) -> Result<(&Node, &DisplayState)> {
        let node = self.node(id)?;
        match &node.runtime {
            Runtime::Display(display) => Ok((node, display)),
            _ => Err(GraphError::WrongKind(id, "display")),
        }
    }

    /// Every node with a path into one of `roots`.
    fn upstream_of(&self, roots: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            for connection in &self.connections {
                if connection.target_node == id && seen.insert(connection.source_node) {
                    stack.push(connection.source_node);
                }
            }
        }
        seen
    }

    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            for connection in &self.connections {
                if connection.source_node == id && seen.insert(connection.target_node) {
                    stack.push(connection.target_node);
                }
            }
        }
        false
    }

    fn upstream_sources(&self, id: NodeId) -> Vec<&SourceRuntime> {
        self.upstream_of([id])
            .into_iter()
            .filter_map(|upstream| match &self.nodes.get(&upstream)?.runtime {
                Runtime::Source(rt) => Some(&**rt),
                _ => None,
            })
            .collect()
    }

    fn is_connected(&self, node: NodeId, input: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.target_node == node && c.target_input == input)
    }

    /// Queue `signal` for every edge leaving `socket` of `node`.
    fn fan_out(&mut self, node: NodeId, socket: &str, signal: &Signal) {
        for connection in &self.connections {
            if connection.source_node != node || connection.source_output != socket {
                continue;
            }
            let Some(target) = self.nodes.get(&connection.target_node) else {
                continue;
            };
            if let Some(input) = target.kind.input(&connection.target_input) {
                self.queue.push_back(Delivery {
                    node: connection.target_node,
                    input: input.name,
                    signal: signal.clone(),
                });
            }
        }
    }

    /// Update an output set and propagate the change downstream.
    fn emit(&mut self, node: NodeId, socket: &'static str, signal: Signal) {
        let changed = self
            .nodes
            .get_mut(&node)
            .and_then(|n| n.outputs.get_mut(socket))
            .is_some_and(|output| output.apply(&signal));
        if changed {
            self.fan_out(node, socket, &signal);
        }
    }

    /// Replay the current values of a connection's source socket into its
    /// target as `polarity` signals.
    fn replay(&mut self, connection: &Connection, polarity: Polarity) {
        let Some(target) = self.nodes.get(&connection.target_node) else {
            return;
        };
        let Some(input) = target.kind.input(&connection.target_input) else {
            return;
        };
        let values: Vec<Value> = self
            .nodes
            .get(&connection.source_node)
            .and_then(|source| source.outputs.get(connection.source_output.as_str()))
            .map(|output| output.values.values().cloned().collect())
            .unwrap_or_default();
        for value in values {
            self.queue.push_back(Delivery {
                node: connection.target_node,
                input: input.name,
                signal: Signal { value, polarity },
            });
        }
    }

    fn deliver(&mut self, delivery: Delivery, effects: &mut Vec<Effect>) {
        let Delivery { node: id, input, signal } = delivery;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let changed = node
            .inputs
            .get_mut(input)
            .is_some_and(|values| values.apply(&signal));
        if !changed {
            return;
        }

        let output = match (&node.kind, &mut node.runtime) {
            (NodeKind::Operator(op), Runtime::Operator(state)) => {
                Side::from_socket(input).and_then(|side| state.apply(*op, side, &signal))
            }
            (NodeKind::Search(_), Runtime::Search(matcher)) => {
                let passes = signal
                    .value
                    .as_event()
                    .is_some_and(|event| !signal.is_add() || matcher.accepts(event));
                passes.then_some(signal)
            }
            (NodeKind::Display, Runtime::Display(display)) => {
                display.channel.publish(&signal);
                if signal.is_add()
                    && let Some(event) = signal.value.as_event()
                    && display.requested.insert(event.pubkey.clone())
                {
                    effects.push(Effect::RequestProfile {
                        display: id,
                        pubkey: event.pubkey.clone(),
                    });
                }
                None
            }
            // Sources pick up input changes on the next reconcile.
            _ => None,
        };
        if let Some(signal) = output {
            self.emit(id, "events", signal);
        }
    }

    /// Run queued deliveries and re-derive source subscriptions until the
    /// graph is stable.
    fn settle(&mut self, effects: &mut Vec<Effect>) {
        loop {
            while let Some(delivery) = self.queue.pop_front() {
                self.deliver(delivery, effects);
            }
            let displays: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, node)| matches!(node.kind, NodeKind::Display))
                .map(|(id, _)| *id)
                .collect();
            let reachable = self.upstream_of(displays);
            let sources: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, node)| matches!(node.kind, NodeKind::Source(_)))
                .map(|(id, _)| *id)
                .collect();
            for id in sources {
                self.reconcile_source(id, reachable.contains(&id), effects);
            }
            if self.queue.is_empty() {
                break;
            }
        }
    }

    /// Bring one source's subscriptions in line with its parameters, inputs
    /// and reachability. Sources whose query did not change are untouched.
    fn reconcile_source(&mut self, id: NodeId, reachable: bool, effects: &mut Vec<Effect>) {
        let authors_connected = self.is_connected(id, "authors");
        let ids_connected = self.is_connected(id, "ids");
        let this = self.this.clone();
        let timeout = self.config.timeouts.one_shot();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let NodeKind::Source(params) = &node.kind else {
            return;
        };
        let inputs = DynamicInputs {
            authors: authors_connected.then(|| node.input_strings("authors")),
            ids: ids_connected.then(|| node.input_strings("ids")),
            relays: node
                .input_strings("relays")
                .iter()
                .filter_map(|relay| normalize_relay(relay).ok())
                .collect(),
            since: node.input_number("since"),
            until: node.input_number("until"),
            limit: node.input_number("limit"),
        };
        let filters = derive_filters(params, &inputs);
        let relays = derive_relays(params, &inputs, &self.config.default_relays);
        let strategy = params.strategy;
        let Runtime::Source(rt) = &mut node.runtime else {
            return;
        };

        let filters_changed = filters != rt.filters;
        let mut retracted = Vec::new();
        if filters_changed {
            retracted = rt.retain_matching(&filters);
            rt.filters = filters;
        }
        let query_changed = filters_changed || relays != rt.relays || strategy != rt.strategy;
        rt.relays = relays;
        rt.strategy = strategy;

        let active = reachable && !rt.filters.is_empty() && !rt.relays.is_empty();
        if !active {
            if !rt.subscribed.is_empty() {
                debug!(node = %id, "Source idle, closing subscriptions");
            }
            rt.stop(id, effects);
            rt.done = false;
        } else if query_changed || (rt.subscribed.is_empty() && !rt.done) {
            rt.epoch += 1;
            rt.eose.clear();
            rt.done = false;
            if let Some(deadline) = rt.deadline.take() {
                deadline.abort();
            }
            rt.relay_status.clear();

            let consumer = consumer_id(id);
            let wanted: BTreeSet<String> = rt.relays.iter().cloned().collect();
            for relay in rt.subscribed.difference(&wanted) {
                effects.push(Effect::Unsubscribe {
                    relay: relay.clone(),
                    consumer: consumer.clone(),
                });
            }
            let handler: Arc<dyn SubscriptionHandler> = Arc::new(SourceHandler {
                graph: this.clone(),
                node: id,
                epoch: rt.epoch,
            });
            for relay in &wanted {
                effects.push(Effect::Subscribe {
                    relay: relay.clone(),
                    consumer: consumer.clone(),
                    filters: rt.filters.clone(),
                    handler: handler.clone(),
                });
            }
            info!(
                node = %id,
                relays = wanted.len(),
                strategy = rt.strategy.as_str(),
                epoch = rt.epoch,
                "Source subscribing"
            );
            rt.subscribed = wanted;
            if rt.strategy == Strategy::Backward {
                rt.deadline = Some(spawn_deadline(this, timeout, id, rt.epoch));
            }
        }

        for (event, author_gone) in retracted {
            self.retract_source_event(id, event, author_gone);
        }
        self.refresh_source_status(id);
    }

    fn retract_source_event(&mut self, id: NodeId, event: Event, author_gone: bool) {
        self.emit(id, "ids", Signal::remove(Value::EventId(event.id.clone())));
        if author_gone {
            self.emit(id, "pubkeys", Signal::remove(Value::Pubkey(event.pubkey.clone())));
        }
        self.emit(id, "events", Signal::remove(Value::Event(event)));
    }

    /// Publish a source's status on its `status` output when it changed.
    fn refresh_source_status(&mut self, id: NodeId) {
        let Some(Runtime::Source(rt)) = self.nodes.get_mut(&id).map(|node| &mut node.runtime) else {
            return;
        };
        let status = rt.computed_status();
        if status == rt.status {
            return;
        }
        let previous = std::mem::replace(&mut rt.status, status.clone());
        debug!(node = %id, %status, "Source status");
        self.emit(id, "status", Signal::remove(Value::RelayStatus(previous)));
        self.emit(id, "status", Signal::add(Value::RelayStatus(status)));
    }

    /// Runtime of source `id` if `epoch` is still current.
    fn current_source(&mut self, id: NodeId, epoch: u64) -> Option<&mut SourceRuntime> {
        match &mut self.nodes.get_mut(&id)?.runtime {
            Runtime::Source(rt) if rt.epoch == epoch => Some(&mut **rt),
            _ => None,
        }
    }

    fn source_event(&mut self, id: NodeId, epoch: u64, event: &Event) {
        let Some(rt) = self.current_source(id, epoch) else {
            return;
        };
        if !matches_any(&rt.filters, event) {
            return;
        }
        let (new_event, new_author) = rt.insert(event);
        if !new_event {
            return;
        }
        self.emit(id, "events", Signal::add(Value::Event(event.clone())));
        self.emit(id, "ids", Signal::add(Value::EventId(event.id.clone())));
        if new_author {
            self.emit(id, "pubkeys", Signal::add(Value::Pubkey(event.pubkey.clone())));
        }
    }

    fn source_eose(&mut self, id: NodeId, epoch: u64, relay: &str, effects: &mut Vec<Effect>) {
        let Some(rt) = self.current_source(id, epoch) else {
            return;
        };
        rt.eose.insert(relay.to_string());
        let finished = rt.strategy == Strategy::Backward
            && !rt.done
            && rt.subscribed.iter().all(|relay| rt.eose.contains(relay));
        if finished {
            debug!(node = %id, "One-shot source reached end of stored events");
            rt.stop(id, effects);
            rt.done = true;
        }
        self.refresh_source_status(id);
    }

    fn source_relay_status(&mut self, id: NodeId, epoch: u64, relay: &str, status: &RelayStatus) {
        let Some(rt) = self.current_source(id, epoch) else {
            return;
        };
        if !rt.subscribed.contains(relay) {
            return;
        }
        rt.relay_status.insert(relay.to_string(), NodeStatus::from(status));
        self.refresh_source_status(id);
    }

    fn source_deadline(&mut self, id: NodeId, epoch: u64, effects: &mut Vec<Effect>) {
        let timeout_ms = self.config.timeouts.one_shot_ms;
        let Some(rt) = self.current_source(id, epoch) else {
            return;
        };
        if rt.done || rt.subscribed.is_empty() {
            return;
        }
        rt.deadline = None;
        warn!(
            node = %id,
            pending = rt.subscribed.iter().filter(|relay| !rt.eose.contains(*relay)).count(),
            error = %ClientError::LookupTimeout(timeout_ms),
            "One-shot source hit its deadline"
        );
        rt.stop(id, effects);
        rt.done = true;
        self.refresh_source_status(id);
    }

    fn store_profile(&mut self, display: NodeId, profile: Profile) {
        if let Some(Node {
            runtime: Runtime::Display(state),
            ..
        }) = self.nodes.get_mut(&display)
        {
            state.profiles.insert(profile.pubkey.clone(), profile);
        }
    }

    /// Re-run a search node over everything currently on its input.
    fn rematch_search(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let Runtime::Search(matcher) = &node.runtime else {
            return;
        };
        let signals: Vec<Signal> = node
            .inputs
            .get("events")
            .into_iter()
            .flat_map(InputValues::values)
            .filter_map(|value| {
                let event = value.as_event()?;
                Some(if matcher.accepts(event) {
                    Signal::add(value.clone())
                } else {
                    Signal::remove(value.clone())
                })
            })
            .collect();
        for signal in signals {
            self.emit(id, "events", signal);
        }
    }
}

fn spawn_deadline(graph: Weak<GraphInner>, timeout: Duration, node: NodeId, epoch: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = graph.upgrade() {
            inner.update(|state, effects| state.source_deadline(node, epoch, effects));
        }
    })
}

/// Receives one source's relay traffic for one subscription epoch.
struct SourceHandler {
    graph: Weak<GraphInner>,
    node: NodeId,
    epoch: u64,
}

impl SubscriptionHandler for SourceHandler {
    fn on_event(&self, _relay_url: &str, event: &Event) {
        if let Some(inner) = self.graph.upgrade() {
            inner.update(|state, _| state.source_event(self.node, self.epoch, event));
        }
    }

    fn on_eose(&self, relay_url: &str) {
        if let Some(inner) = self.graph.upgrade() {
            inner.update(|state, effects| state.source_eose(self.node, self.epoch, relay_url, effects));
        }
    }

    fn on_status(&self, relay_url: &str, status: &RelayStatus) {
        if let Some(inner) = self.graph.upgrade() {
            inner.update(|state, _| state.source_relay_status(self.node, self.epoch, relay_url, status));
        }
    }
}

struct GraphInner {
    state: Mutex<GraphState>,
    multiplexer: RelayMultiplexer,
    profiles: ProfileFetcher,
}

impl GraphInner {
    /// Mutate the state, settle it, then run the collected effects with the
    /// lock released.
    fn update<T>(self: &Arc<Self>, f: impl FnOnce(&mut GraphState, &mut Vec<Effect>) -> T) -> T {
        let mut effects = Vec::new();
        let out = {
            let mut state = self.state.lock();
            let out = f(&mut state, &mut effects);
            state.settle(&mut effects);
            out
        };
        self.apply(effects);
        out
    }

    fn apply(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Subscribe {
                    relay,
                    consumer,
                    filters,
                    handler,
                } => self.multiplexer.subscribe(&relay, &consumer, filters, handler),
                Effect::Unsubscribe { relay, consumer } => {
                    self.multiplexer.unsubscribe(&relay, &consumer);
                }
                Effect::RequestProfile { display, pubkey } => {
                    let graph = Arc::downgrade(self);
                    self.profiles
                        .queue_request_for(&display.to_string(), &pubkey, move |outcome| {
                            if let Some(profile) = outcome.found()
                                && let Some(inner) = graph.upgrade()
                            {
                                inner.state.lock().store_profile(display, profile);
                            }
                        });
                }
                Effect::CancelProfiles { display } => {
                    self.profiles.cancel_owner(&display.to_string());
                }
            }
        }
    }
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (id, node) in &mut state.nodes {
            match &mut node.runtime {
                Runtime::Source(rt) => {
                    if let Some(deadline) = rt.deadline.take() {
                        deadline.abort();
                    }
                    for relay in std::mem::take(&mut rt.subscribed) {
                        self.multiplexer.unsubscribe(&relay, &consumer_id(*id));
                    }
                }
                Runtime::Display(_) => self.profiles.cancel_owner(&id.to_string()),
                _ => {}
            }
        }
    }
}

/// Handle for a watcher registered with [`NodeGraph::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Watch {
    pub node: NodeId,
    pub socket: &'static str,
    token: SubscriptionToken,
}

/// A live query graph.
///
/// Cheap to clone; clones share the same graph. Edits must be made from
/// within a tokio runtime, since sources subscribe through the multiplexer
/// and one-shot sources arm a deadline timer.
#[derive(Clone)]
pub struct NodeGraph {
    inner: Arc<GraphInner>,
}

impl NodeGraph {
    pub fn new(multiplexer: RelayMultiplexer, profiles: ProfileFetcher, config: GraphConfig) -> Self {
        let inner = Arc::new_cyclic(|this| GraphInner {
            state: Mutex::new(GraphState {
                config,
                nodes: BTreeMap::new(),
                connections: BTreeSet::new(),
                queue: VecDeque::new(),
                this: this.clone(),
            }),
            multiplexer,
            profiles,
        });
        Self { inner }
    }

    /// Build the multiplexer and profile fetcher from `config`.
    pub fn with_transport(transport: Arc<dyn RelayTransport>, config: GraphConfig) -> Self {
        let multiplexer = RelayMultiplexer::new(transport, config.multiplexer.clone());
        let profiles = ProfileFetcher::new(
            multiplexer.clone(),
            Arc::new(LookupCache::new()),
            config.fetcher.clone(),
        );
        Self::new(multiplexer, profiles, config)
    }

    pub fn multiplexer(&self) -> &RelayMultiplexer {
        &self.inner.multiplexer
    }

    pub fn profiles(&self) -> &ProfileFetcher {
        &self.inner.profiles
    }

    /// Add a node. Parameters are validated first.
    pub fn add_node(&self, kind: NodeKind) -> Result<NodeId> {
        let (kind, runtime) = match kind {
            NodeKind::Source(params) => (
                NodeKind::Source(params.normalized()?),
                Runtime::Source(Box::default()),
            ),
            NodeKind::Operator(op) => (NodeKind::Operator(op), Runtime::Operator(OperatorState::new())),
            NodeKind::Search(params) => {
                let matcher = Matcher::compile(&params)?;
                (NodeKind::Search(params), Runtime::Search(matcher))
            }
            NodeKind::Display => (NodeKind::Display, Runtime::Display(DisplayState::default())),
        };
        let id = NodeId::new();
        debug!(node = %id, kind = kind.name(), "Adding node");
        self.inner.update(|state, _| {
            state.nodes.insert(id, Node::new(kind, runtime));
        });
        Ok(id)
    }

    /// Remove a node and every edge touching it. Downstream nodes see the
    /// node's outputs retracted; its subscriptions, deadline and profile
    /// lookups are cancelled.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        self.inner.update(|state, effects| {
            state.node(id)?;
            let touching: Vec<Connection> = state
                .connections
                .iter()
                .filter(|c| c.source_node == id || c.target_node == id)
                .cloned()
                .collect();
            for connection in &touching {
                if connection.source_node == id {
                    state.replay(connection, Polarity::Remove);
                }
                state.connections.remove(connection);
            }

            let Some(mut node) = state.nodes.remove(&id) else {
                return Ok(());
            };
            match &mut node.runtime {
                Runtime::Source(rt) => rt.stop(id, effects),
                Runtime::Display(_) => effects.push(Effect::CancelProfiles { display: id }),
                _ => {}
            }
            for channel in node.channels() {
                channel.complete();
            }
            info!(node = %id, kind = node.kind.name(), edges = touching.len(), "Removed node");
            Ok(())
        })
    }

    /// Connect an output to an input. Types must match exactly,
    /// single-connection inputs take one edge and cycles are refused.
    pub fn connect(&self, connection: Connection) -> Result<()> {
        self.inner.update(|state, _| {
            let source = state.node(connection.source_node)?;
            let target = state.node(connection.target_node)?;
            let output = source.kind.output(&connection.source_output).ok_or_else(|| {
                GraphError::UnknownSocket {
                    node: connection.source_node,
                    socket: connection.source_output.clone(),
                    direction: "output",
                }
            })?;
            let input = target.kind.input(&connection.target_input).ok_or_else(|| {
                GraphError::UnknownSocket {
                    node: connection.target_node,
                    socket: connection.target_input.clone(),
                    direction: "input",
                }
            })?;
            if output.ty != input.ty {
                return Err(GraphError::TypeMismatch {
                    from: output.ty,
                    to: input.ty,
                });
            }
            if state.connections.contains(&connection) {
                return Err(GraphError::DuplicateConnection);
            }
            if !input.multiple && state.is_connected(connection.target_node, input.name) {
                return Err(GraphError::InputOccupied {
                    node: connection.target_node,
                    socket: connection.target_input.clone(),
                });
            }
            if state.reaches(connection.target_node, connection.source_node) {
                return Err(GraphError::Cycle);
            }

            debug!(
                from = %connection.source_node,
                output = %connection.source_output,
                to = %connection.target_node,
                input = %connection.target_input,
                "Connecting"
            );
            state.connections.insert(connection.clone());
            state.replay(&connection, Polarity::Add);
            Ok(())
        })
    }

    /// Remove an edge, retracting what flowed across it.
    pub fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.inner.update(|state, _| {
            if !state.connections.contains(connection) {
                return Err(GraphError::UnknownConnection);
            }
            state.replay(connection, Polarity::Remove);
            state.connections.remove(connection);
            Ok(())
        })
    }

    pub fn update_source(&self, id: NodeId, params: SourceParams) -> Result<()> {
        let params = params.normalized()?;
        self.inner.update(|state, _| {
            let node = state.node_mut(id)?;
            let NodeKind::Source(current) = &mut node.kind else {
                return Err(GraphError::WrongKind(id, "source"));
            };
            *current = params;
            Ok(())
        })
    }

    pub fn update_search(&self, id: NodeId, params: SearchParams) -> Result<()> {
        let matcher = Matcher::compile(&params)?;
        self.inner.update(|state, _| {
            let node = state.node_mut(id)?;
            let (NodeKind::Search(current), Runtime::Search(compiled)) = (&mut node.kind, &mut node.runtime)
            else {
                return Err(GraphError::WrongKind(id, "search"));
            };
            *current = params;
            *compiled = matcher;
            state.rematch_search(id);
            Ok(())
        })
    }

    pub fn update_operator(&self, id: NodeId, op: OperatorKind) -> Result<()> {
        self.inner.update(|state, _| {
            let node = state.node_mut(id)?;
            let (NodeKind::Operator(current), Runtime::Operator(operator)) =
                (&mut node.kind, &mut node.runtime)
            else {
                return Err(GraphError::WrongKind(id, "operator"));
            };
            *current = op;
            let changes = operator.reevaluate(op);
            for signal in changes {
                state.emit(id, "events", signal);
            }
            Ok(())
        })
    }

    /// Editor controls for a node's parameters.
    pub fn controls(&self, id: NodeId) -> Result<Vec<(&'static str, Control)>> {
        let state = self.inner.state.lock();
        Ok(node_controls(&state.node(id)?.kind))
    }

    /// Apply an edit made through one of the node's controls.
    pub fn set_control(&self, id: NodeId, key: &str, value: ControlValue) -> Result<()> {
        let kind = {
            let state = self.inner.state.lock();
            apply_control(&state.node(id)?.kind, key, value)?
        };
        match kind {
            NodeKind::Source(params) => self.update_source(id, params),
            NodeKind::Search(params) => self.update_search(id, params),
            NodeKind::Operator(op) => self.update_operator(id, op),
            NodeKind::Display => Ok(()),
        }
    }

    /// Events accumulated by a display, newest first, one per id.
    pub fn display_events(&self, id: NodeId) -> Result<Vec<Event>> {
        let state = self.inner.state.lock();
        let (node, _) = state.display(id)?;
        let mut events: Vec<Event> = node
            .inputs
            .get("events")
            .into_iter()
            .flat_map(InputValues::values)
            .filter_map(|value| value.as_event().cloned())
            .collect();
        events.sort_by(display_order);
        Ok(events)
    }

    pub fn display_completion(&self, id: NodeId) -> Result<Completion> {
        let state = self.inner.state.lock();
        state.display(id)?;
        let branches: Vec<Branch> = state
            .upstream_sources(id)
            .into_iter()
            .map(SourceRuntime::branch)
            .collect();
        Ok(completion(&branches))
    }

    /// Profile of `pubkey` fetched on behalf of a display.
    pub fn display_profile(&self, id: NodeId, pubkey: &str) -> Result<Option<Profile>> {
        let state = self.inner.state.lock();
        let (_, display) = state.display(id)?;
        Ok(display.profiles.get(pubkey).cloned())
    }

    /// A source's own status; other nodes report the combined status of
    /// the sources feeding them.
    pub fn node_status(&self, id: NodeId) -> Result<NodeStatus> {
        let state = self.inner.state.lock();
        if let Runtime::Source(rt) = &state.node(id)?.runtime {
            return Ok(rt.status.clone());
        }
        let statuses: Vec<NodeStatus> = state
            .upstream_sources(id)
            .into_iter()
            .map(|rt| rt.status.clone())
            .collect();
        Ok(NodeStatus::aggregate(&statuses))
    }

    /// Filters a source currently derives, whether or not it is subscribed.
    pub fn source_filters(&self, id: NodeId) -> Result<Vec<Filter>> {
        let state = self.inner.state.lock();
        Ok(state.source(id)?.filters.clone())
    }

    /// Relays a source queries.
    pub fn source_relays(&self, id: NodeId) -> Result<Vec<String>> {
        let state = self.inner.state.lock();
        Ok(state.source(id)?.relays.clone())
    }

    /// Snapshot of an output socket's current values.
    pub fn output_values(&self, id: NodeId, socket: &str) -> Result<Vec<Value>> {
        let state = self.inner.state.lock();
        let node = state.node(id)?;
        let output = node.outputs.get(socket).ok_or_else(|| GraphError::UnknownSocket {
            node: id,
            socket: socket.to_string(),
            direction: "output",
        })?;
        Ok(output.values.values().cloned().collect())
    }

    pub fn nodes(&self) -> Vec<(NodeId, NodeKind)> {
        let state = self.inner.state.lock();
        state
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.kind.clone()))
            .collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.state.lock().connections.iter().cloned().collect()
    }

    /// Observe the signals of an output socket, or of a display's `events`.
    /// The receiver gets [`ChannelMessage::Complete`] when the node is
    /// removed.
    pub fn watch(
        &self,
        id: NodeId,
        socket: &str,
    ) -> Result<(Watch, mpsc::UnboundedReceiver<ChannelMessage>)> {
        let mut state = self.inner.state.lock();
        let node = state.node_mut(id)?;
        let found = match (&mut node.runtime, node.kind.output(socket)) {
            (Runtime::Display(display), _) if socket == "events" => {
                Some(("events", &mut display.channel))
            }
            (_, Some(output)) => node
                .outputs
                .get_mut(output.name)
                .map(|set| (output.name, &mut set.channel)),
            _ => None,
        };
        let Some((name, channel)) = found else {
            return Err(GraphError::UnknownSocket {
                node: id,
                socket: socket.to_string(),
                direction: "output",
            });
        };
        let (token, rx) = channel.subscribe();
        Ok((
            Watch {
                node: id,
                socket: name,
                token,
            },
            rx,
        ))
    }

    /// Stop a watcher. Returns false when it is already gone.
    pub fn unwatch(&self, watch: &Watch) -> bool {
        let mut state = self.inner.state.lock();
        let Some(node) = state.nodes.get_mut(&watch.node) else {
            return false;
        };
        let channel = match &mut node.runtime {
            Runtime::Display(display) => Some(&mut display.channel),
            _ => node.outputs.get_mut(watch.socket).map(|output| &mut output.channel),
        };
        channel.is_some_and(|channel| channel.unsubscribe(watch.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_values_count_edges() {
        let mut input = InputValues::default();
        let alice = Value::Pubkey("a".repeat(64));
        assert!(input.apply(&Signal::add(alice.clone())));
        assert!(!input.apply(&Signal::add(alice.clone())));
        assert!(!input.apply(&Signal::remove(alice.clone())));
        assert_eq!(input.values().count(), 1);
        assert!(input.apply(&Signal::remove(alice.clone())));
        assert!(!input.apply(&Signal::remove(alice)));
    }

    #[test]
    fn test_latest_input_wins() {
        let mut input = InputValues::default();
        input.apply(&Signal::add(Value::Datetime(500)));
        input.apply(&Signal::add(Value::Datetime(100)));
        assert_eq!(input.latest(), Some(&Value::Datetime(100)));
        input.apply(&Signal::remove(Value::Datetime(100)));
        assert_eq!(input.latest(), Some(&Value::Datetime(500)));
    }

    #[test]
    fn test_output_set_publishes_changes_only() {
        let mut output = OutputSet::default();
        let (_, mut rx) = output.channel.subscribe();
        let id = Value::EventId("1".repeat(64));
        assert!(output.apply(&Signal::add(id.clone())));
        assert!(!output.apply(&Signal::add(id.clone())));
        assert!(output.apply(&Signal::remove(id.clone())));
        assert!(!output.apply(&Signal::remove(id.clone())));

        assert_eq!(rx.try_recv().unwrap(), ChannelMessage::Signal(Signal::add(id.clone())));
        assert_eq!(rx.try_recv().unwrap(), ChannelMessage::Signal(Signal::remove(id)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_retain_matching_tracks_authors() {
        let mut rt = SourceRuntime::default();
        let event = |n: u8, pubkey: &str| Event {
            id: format!("{n:064x}"),
            pubkey: pubkey.to_string(),
            created_at: 1,
            kind: n as u16,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(rt.insert(&event(1, "alice")), (true, true));
        assert_eq!(rt.insert(&event(1, "alice")), (false, false));
        assert_eq!(rt.insert(&event(2, "alice")), (true, false));
        assert_eq!(rt.insert(&event(3, "bob")), (true, true));

        let removed = rt.retain_matching(&[Filter::new().kinds([1, 2])]);
        assert_eq!(removed, vec![(event(3, "bob"), true)]);
        let removed = rt.retain_matching(&[Filter::new().kinds([2])]);
        assert_eq!(removed, vec![(event(1, "alice"), false)]);
    }
}
