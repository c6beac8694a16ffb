//! Error types for graph editing.

use crate::node::NodeId;
use crate::value::ValueType;
use thiserror::Error;

/// Errors raised while editing the graph. Runtime relay failures never
/// surface here; they show up as [`NodeStatus::Error`](crate::NodeStatus).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {node} has no {direction} socket {socket:?}")]
    UnknownSocket {
        node: NodeId,
        socket: String,
        direction: &'static str,
    },

    #[error("cannot connect a {from} output to a {to} input")]
    TypeMismatch { from: ValueType, to: ValueType },

    #[error("input {socket:?} of node {node} accepts a single connection")]
    InputOccupied { node: NodeId, socket: String },

    #[error("connection already exists")]
    DuplicateConnection,

    #[error("connection would create a cycle")]
    Cycle,

    #[error("no such connection")]
    UnknownConnection,

    #[error("node {0} is not a {1} node")]
    WrongKind(NodeId, &'static str),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid {field}: {reason}")]
    InvalidParam { field: String, reason: String },

    #[error("invalid value for control {0:?}")]
    InvalidControlValue(String),

    #[error(transparent)]
    Filter(#[from] nostr::FilterError),
}

impl GraphError {
    pub(crate) fn param(field: &str, reason: impl Into<String>) -> Self {
        GraphError::InvalidParam {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;
