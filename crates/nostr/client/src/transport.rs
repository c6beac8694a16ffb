//! Seam between the multiplexer and a relay connection implementation.
//!
//! The multiplexer never touches sockets. A transport owns one connection per
//! relay URL, queues outgoing frames without blocking, and reports everything
//! that happens on the connection through the channel returned by `connect`.

use crate::error::Result;
use crate::message::{ClientMessage, RelayMessage};
use tokio::sync::mpsc;

/// Something that happened on a relay connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection (re)established; previously sent subscriptions are gone
    Connected,
    /// Inbound relay frame
    Message(RelayMessage),
    /// Connection or protocol failure; the transport may retry on its own
    Error(String),
    /// Connection closed
    Disconnected,
}

/// Receiving half handed out by [`RelayTransport::connect`].
pub type TransportReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Relay connection provider.
///
/// Calls must return promptly: they are made from the multiplexer's timer and
/// reader tasks.
pub trait RelayTransport: Send + Sync + 'static {
    /// Open (or reuse) the connection to `url`. Establishment is reported
    /// asynchronously as [`TransportEvent::Connected`].
    fn connect(&self, url: &str) -> Result<TransportReceiver>;

    /// Queue a frame for `url`.
    fn send(&self, url: &str, message: ClientMessage) -> Result<()>;

    /// Close the connection to `url` and drop its event channel.
    fn disconnect(&self, url: &str);
}
