//! Batched lookup fetcher.
//!
//! Coalesces many single-key lookups (profile by pubkey, event by id) into
//! one one-shot relay query per batch. A batch is flushed when the queue
//! reaches `batch_size` or when no key has been queued for `idle_ms`.
//!
//! Replaceable kinds (profiles) hold their results until the query ends so
//! the newest version across relays wins; other kinds resolve on the first
//! matching event.
//!
//! Every request resolves exactly once: with the value, with `NotFound` when
//! the query finishes without it (EOSE or deadline), or with `Cancelled` when
//! the fetcher is stopped first.

use crate::cache::LookupCache;
use crate::config::FetcherConfig;
use crate::error::ClientError;
use crate::lookup::LookupKind;
use crate::multiplexer::{QueryOutcome, RelayMultiplexer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Terminal result of a lookup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome<V> {
    Found(V),
    /// The query finished without a result for this key
    NotFound,
    /// The fetcher was stopped before the request resolved
    Cancelled,
}

impl<V> LookupOutcome<V> {
    pub fn found(self) -> Option<V> {
        match self {
            LookupOutcome::Found(value) => Some(value),
            LookupOutcome::NotFound | LookupOutcome::Cancelled => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LookupOutcome::Found(_))
    }
}

type Callback<V> = Box<dyn FnOnce(LookupOutcome<V>) + Send>;

struct Waiter<V> {
    owner: Option<String>,
    callback: Callback<V>,
}

struct PendingKey<V> {
    waiters: Vec<Waiter<V>>,
    /// Batch the key was flushed in; `None` while still queued
    batch: Option<u64>,
}

struct BatchState<V> {
    pending: HashMap<String, PendingKey<V>>,
    queue: Vec<String>,
    idle_timer: Option<JoinHandle<()>>,
    generation: u64,
    next_batch: u64,
}

impl<V> BatchState<V> {
    /// Move the queue into a new batch.
    fn take_batch(&mut self) -> (u64, Vec<String>) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        self.next_batch += 1;
        let batch = self.next_batch;
        let keys = std::mem::take(&mut self.queue);
        for key in &keys {
            if let Some(pending) = self.pending.get_mut(key) {
                pending.batch = Some(batch);
            }
        }
        (batch, keys)
    }
}

struct FetcherShared<L: LookupKind> {
    multiplexer: RelayMultiplexer,
    cache: Arc<LookupCache<L::Value>>,
    config: FetcherConfig,
    state: Mutex<BatchState<L::Value>>,
    _kind: PhantomData<fn() -> L>,
}

impl<L: LookupKind> FetcherShared<L> {
    fn schedule_idle_flush(self: &Arc<Self>, state: &mut BatchState<L::Value>) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let generation = state.generation;
        let idle = self.config.idle();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let batch = {
                let mut state = shared.state.lock();
                if state.generation != generation || state.queue.is_empty() {
                    return;
                }
                state.idle_timer = None;
                state.take_batch()
            };
            shared.start_flush(generation, batch);
        }));
    }

    fn start_flush(self: &Arc<Self>, generation: u64, (batch, keys): (u64, Vec<String>)) {
        let shared = self.clone();
        tokio::spawn(async move { shared.run_flush(generation, batch, keys).await });
    }

    async fn run_flush(self: Arc<Self>, generation: u64, batch: u64, keys: Vec<String>) {
        debug!(lookup = L::NAME, batch, keys = keys.len(), "Flushing lookup batch");
        let filters = L::batch_filters(&keys);
        let deadline = self.config.timeouts.one_shot();
        let shared = self.clone();
        let best: Arc<Mutex<HashMap<String, L::Value>>> = Arc::default();
        let candidates = best.clone();
        let result = self
            .multiplexer
            .query_with(&self.config.relays, filters, deadline, move |_relay, event| {
                let Some((key, value)) = L::extract(event) else {
                    return;
                };
                if !L::REPLACEABLE {
                    shared.resolve_found(generation, key, value);
                    return;
                }
                let mut candidates = candidates.lock();
                if candidates
                    .get(&key)
                    .is_none_or(|current| L::supersedes(&value, current))
                {
                    candidates.insert(key, value);
                }
            })
            .await;

        if result.outcome == QueryOutcome::TimedOut {
            warn!(
                lookup = L::NAME,
                batch,
                error = %ClientError::LookupTimeout(self.config.timeouts.one_shot_ms),
                "Lookup batch incomplete"
            );
        }

        let mut best = std::mem::take(&mut *best.lock());
        let mut found: Vec<(Waiter<L::Value>, L::Value)> = Vec::new();
        let mut missing: Vec<Waiter<L::Value>> = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            for key in &keys {
                // Keys resolved or cancelled meanwhile, or re-queued in a
                // later batch, are not this batch's to settle.
                if !state
                    .pending
                    .get(key)
                    .is_some_and(|pending| pending.batch == Some(batch))
                {
                    continue;
                }
                let Some(pending) = state.pending.remove(key) else {
                    continue;
                };
                match best.remove(key) {
                    Some(value) => {
                        self.cache.insert(key.clone(), value.clone());
                        found.extend(pending.waiters.into_iter().map(|w| (w, value.clone())));
                    }
                    None => missing.extend(pending.waiters),
                }
            }
        }
        if !missing.is_empty() {
            debug!(lookup = L::NAME, batch, waiters = missing.len(), "Lookup misses");
        }
        for (waiter, value) in found {
            (waiter.callback)(LookupOutcome::Found(value));
        }
        for waiter in missing {
            (waiter.callback)(LookupOutcome::NotFound);
        }
    }

    fn resolve_found(&self, generation: u64, key: String, value: L::Value) {
        let waiters = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            let Some(pending) = state.pending.remove(&key) else {
                return;
            };
            if pending.batch.is_none() {
                state.queue.retain(|queued| *queued != key);
            }
            self.cache.insert(key, value.clone());
            pending.waiters
        };
        for waiter in waiters {
            (waiter.callback)(LookupOutcome::Found(value.clone()));
        }
    }
}

/// Coalescing lookup service for one [`LookupKind`].
///
/// Cheap to clone; clones share the queue and cache.
pub struct BatchFetcher<L: LookupKind> {
    shared: Arc<FetcherShared<L>>,
}

impl<L: LookupKind> Clone for BatchFetcher<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L: LookupKind> BatchFetcher<L> {
    pub fn new(
        multiplexer: RelayMultiplexer,
        cache: Arc<LookupCache<L::Value>>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            shared: Arc::new(FetcherShared {
                multiplexer,
                cache,
                config,
                state: Mutex::new(BatchState {
                    pending: HashMap::new(),
                    queue: Vec::new(),
                    idle_timer: None,
                    generation: 0,
                    next_batch: 0,
                }),
                _kind: PhantomData,
            }),
        }
    }

    /// The cache results are written to.
    pub fn cache(&self) -> &Arc<LookupCache<L::Value>> {
        &self.shared.cache
    }

    /// Request `key`; `callback` fires exactly once.
    pub fn queue_request(
        &self,
        key: &str,
        callback: impl FnOnce(LookupOutcome<L::Value>) + Send + 'static,
    ) {
        self.enqueue(None, key, Box::new(callback));
    }

    /// Like [`queue_request`](Self::queue_request), tagged with an owner so
    /// the request can be dropped with [`cancel_owner`](Self::cancel_owner).
    pub fn queue_request_for(
        &self,
        owner: &str,
        key: &str,
        callback: impl FnOnce(LookupOutcome<L::Value>) + Send + 'static,
    ) {
        self.enqueue(Some(owner.to_string()), key, Box::new(callback));
    }

    /// Await the outcome for `key`.
    pub async fn fetch(&self, key: &str) -> LookupOutcome<L::Value> {
        let (tx, rx) = oneshot::channel();
        self.queue_request(key, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(LookupOutcome::Cancelled)
    }

    fn enqueue(&self, owner: Option<String>, key: &str, callback: Callback<L::Value>) {
        let Some(key) = L::normalize_key(key) else {
            debug!(lookup = L::NAME, key, "Rejecting malformed lookup key");
            callback(LookupOutcome::NotFound);
            return;
        };
        if let Some(value) = self.shared.cache.get(&key) {
            callback(LookupOutcome::Found(value));
            return;
        }

        let waiter = Waiter { owner, callback };
        let flush = {
            let mut state = self.shared.state.lock();
            if let Some(pending) = state.pending.get_mut(&key) {
                pending.waiters.push(waiter);
                return;
            }
            state.pending.insert(
                key.clone(),
                PendingKey {
                    waiters: vec![waiter],
                    batch: None,
                },
            );
            state.queue.push(key);

            if state.queue.len() >= self.shared.config.batch_size {
                Some((state.generation, state.take_batch()))
            } else {
                self.shared.schedule_idle_flush(&mut state);
                None
            }
        };
        if let Some((generation, batch)) = flush {
            self.shared.start_flush(generation, batch);
        }
    }

    /// Drop every waiter registered by `owner` without invoking it. Queued
    /// keys left without waiters are removed from the queue.
    pub fn cancel_owner(&self, owner: &str) {
        let dropped: Vec<Waiter<L::Value>> = {
            let mut state = self.shared.state.lock();
            let mut dropped = Vec::new();
            for pending in state.pending.values_mut() {
                let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut pending.waiters)
                    .into_iter()
                    .partition(|waiter| waiter.owner.as_deref() == Some(owner));
                pending.waiters = others;
                dropped.extend(mine);
            }
            state.pending.retain(|_, pending| !pending.waiters.is_empty());
            let BatchState { pending, queue, .. } = &mut *state;
            queue.retain(|key| pending.contains_key(key));
            dropped
        };
        if !dropped.is_empty() {
            debug!(lookup = L::NAME, owner, waiters = dropped.len(), "Cancelled lookups");
        }
    }

    /// Resolve every outstanding request with `Cancelled` and discard the
    /// results of flushes still in flight. Idempotent; the fetcher accepts new
    /// requests afterwards.
    pub fn stop(&self) {
        let waiters: Vec<Waiter<L::Value>> = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            state.queue.clear();
            state.generation += 1;
            state
                .pending
                .drain()
                .flat_map(|(_, pending)| pending.waiters)
                .collect()
        };
        if !waiters.is_empty() {
            debug!(lookup = L::NAME, waiters = waiters.len(), "Stopped fetcher");
        }
        for waiter in waiters {
            (waiter.callback)(LookupOutcome::Cancelled);
        }
    }

    /// Keys queued or in flight.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Keys queued and not yet flushed.
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}
