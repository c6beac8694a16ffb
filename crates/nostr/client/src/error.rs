//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection error reported by the transport
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame could not be handed to the relay connection
    #[error("Send error: {0}")]
    Send(String),

    /// Not connected
    #[error("Not connected to relay {0}")]
    NotConnected(String),

    /// Wire message could not be encoded or decoded
    #[error("Message error: {0}")]
    Message(#[from] crate::message::MessageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid filter
    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] nostr::FilterError),

    /// One-shot query or batch flush exceeded its deadline
    #[error("Lookup timed out after {0}ms")]
    LookupTimeout(u64),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
