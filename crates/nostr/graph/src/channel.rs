//! Fan-out channel for observing a node's output signals.

use crate::value::Signal;
use tokio::sync::mpsc;

/// Handle returned by [`SignalChannel::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// Item received by a channel subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Signal(Signal),
    /// The producer is gone; nothing follows.
    Complete,
}

/// Single-producer, multi-consumer signal broadcast.
///
/// Completion is sent once. Subscribing to a completed channel yields a
/// receiver that holds only [`ChannelMessage::Complete`].
#[derive(Debug, Default)]
pub struct SignalChannel {
    subscribers: Vec<(SubscriptionToken, mpsc::UnboundedSender<ChannelMessage>)>,
    next_token: u64,
    completed: bool,
}

impl SignalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> (SubscriptionToken, mpsc::UnboundedReceiver<ChannelMessage>) {
        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        if self.completed {
            let _ = tx.send(ChannelMessage::Complete);
        } else {
            self.subscribers.push((token, tx));
        }
        (token, rx)
    }

    /// Returns false when the token is not subscribed.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(t, _)| *t != token);
        self.subscribers.len() != before
    }

    /// Send `signal` to every subscriber. Dropped receivers are pruned.
    pub fn publish(&mut self, signal: &Signal) {
        if self.completed {
            return;
        }
        self.subscribers
            .retain(|(_, tx)| tx.send(ChannelMessage::Signal(signal.clone())).is_ok());
    }

    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        for (_, tx) in self.subscribers.drain(..) {
            let _ = tx.send(ChannelMessage::Complete);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
