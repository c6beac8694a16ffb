//! In-memory transport for tests.
//!
//! `MockTransport` records every frame the multiplexer sends and lets a test
//! inject relay frames. Relays given stored events answer each REQ with the
//! matching events followed by EOSE, like a real relay replaying history.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::transport::{RelayTransport, TransportEvent, TransportReceiver};
use nostr::{Event, Filter, matches_any};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    channels: HashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    sent: Vec<(String, ClientMessage)>,
    connects: HashMap<String, usize>,
    disconnects: HashMap<String, usize>,
    refused: HashSet<String>,
    stored: HashMap<String, Vec<Event>>,
    manual_connect: bool,
}

/// Recording transport with scriptable relays.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Transport whose connections open immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport whose connections only open when the test pushes
    /// [`TransportEvent::Connected`].
    pub fn manual_connect() -> Arc<Self> {
        let transport = Self::default();
        transport.state.lock().manual_connect = true;
        Arc::new(transport)
    }

    /// Make `url` answer every REQ with the matching events and EOSE.
    pub fn store(&self, url: &str, events: impl IntoIterator<Item = Event>) {
        self.state
            .lock()
            .stored
            .entry(url.to_string())
            .or_default()
            .extend(events);
    }

    /// Make connection attempts to `url` fail.
    pub fn refuse(&self, url: &str) {
        self.state.lock().refused.insert(url.to_string());
    }

    /// Every frame sent to `url`, in order.
    pub fn sent(&self, url: &str) -> Vec<ClientMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(to, _)| to == url)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Every REQ sent to `url` as (subscription id, filters).
    pub fn requests(&self, url: &str) -> Vec<(String, Vec<Filter>)> {
        self.sent(url)
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::Req {
                    subscription_id,
                    filters,
                } => Some((subscription_id, filters)),
                ClientMessage::Close { .. } => None,
            })
            .collect()
    }

    /// The most recent REQ sent to `url`.
    pub fn last_request(&self, url: &str) -> Option<(String, Vec<Filter>)> {
        self.requests(url).pop()
    }

    /// Subscription ids closed on `url`.
    pub fn closes(&self, url: &str) -> Vec<String> {
        self.sent(url)
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::Close { subscription_id } => Some(subscription_id),
                ClientMessage::Req { .. } => None,
            })
            .collect()
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.state.lock().connects.get(url).copied().unwrap_or(0)
    }

    pub fn disconnect_count(&self, url: &str) -> usize {
        self.state.lock().disconnects.get(url).copied().unwrap_or(0)
    }

    /// Whether the multiplexer currently holds a connection to `url`.
    pub fn is_connected(&self, url: &str) -> bool {
        self.state.lock().channels.contains_key(url)
    }

    /// Inject a transport event on `url`. Returns false if not connected.
    pub fn push(&self, url: &str, event: TransportEvent) -> bool {
        self.state
            .lock()
            .channels
            .get(url)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn push_event(&self, url: &str, subscription_id: &str, event: Event) -> bool {
        self.push(
            url,
            TransportEvent::Message(RelayMessage::Event {
                subscription_id: subscription_id.to_string(),
                event,
            }),
        )
    }

    pub fn push_eose(&self, url: &str, subscription_id: &str) -> bool {
        self.push(
            url,
            TransportEvent::Message(RelayMessage::Eose {
                subscription_id: subscription_id.to_string(),
            }),
        )
    }
}

impl RelayTransport for MockTransport {
    fn connect(&self, url: &str) -> Result<TransportReceiver> {
        let mut state = self.state.lock();
        *state.connects.entry(url.to_string()).or_default() += 1;
        if state.refused.contains(url) {
            return Err(ClientError::Connection(format!("connection refused: {url}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if !state.manual_connect {
            let _ = tx.send(TransportEvent::Connected);
        }
        state.channels.insert(url.to_string(), tx);
        Ok(rx)
    }

    fn send(&self, url: &str, message: ClientMessage) -> Result<()> {
        let mut state = self.state.lock();
        let Some(tx) = state.channels.get(url).cloned() else {
            return Err(ClientError::NotConnected(url.to_string()));
        };
        if let ClientMessage::Req {
            subscription_id,
            filters,
        } = &message
            && let Some(stored) = state.stored.get(url)
        {
            for event in stored.iter().filter(|event| matches_any(filters, event)) {
                let _ = tx.send(TransportEvent::Message(RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event: event.clone(),
                }));
            }
            let _ = tx.send(TransportEvent::Message(RelayMessage::Eose {
                subscription_id: subscription_id.clone(),
            }));
        }
        state.sent.push((url.to_string(), message));
        Ok(())
    }

    fn disconnect(&self, url: &str) {
        let mut state = self.state.lock();
        state.channels.remove(url);
        *state.disconnects.entry(url.to_string()).or_default() += 1;
    }
}
