//! Values carried along graph edges.

use crate::status::NodeStatus;
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a socket. Connections require equal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    Event,
    EventId,
    Pubkey,
    Integer,
    Datetime,
    Relay,
    Flag,
    Trigger,
    RelayStatus,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Event => "event",
            ValueType::EventId => "event id",
            ValueType::Pubkey => "pubkey",
            ValueType::Integer => "integer",
            ValueType::Datetime => "datetime",
            ValueType::Relay => "relay",
            ValueType::Flag => "flag",
            ValueType::Trigger => "trigger",
            ValueType::RelayStatus => "relay status",
        };
        f.write_str(name)
    }
}

/// A typed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    Event(Event),
    EventId(String),
    Pubkey(String),
    Integer(i64),
    /// Unix timestamp in seconds
    Datetime(u64),
    Relay(String),
    Flag(bool),
    Trigger,
    RelayStatus(NodeStatus),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Event(_) => ValueType::Event,
            Value::EventId(_) => ValueType::EventId,
            Value::Pubkey(_) => ValueType::Pubkey,
            Value::Integer(_) => ValueType::Integer,
            Value::Datetime(_) => ValueType::Datetime,
            Value::Relay(_) => ValueType::Relay,
            Value::Flag(_) => ValueType::Flag,
            Value::Trigger => ValueType::Trigger,
            Value::RelayStatus(_) => ValueType::RelayStatus,
        }
    }

    /// Identity of the value within a set: the event id for events, the
    /// payload itself otherwise.
    pub fn key(&self) -> String {
        match self {
            Value::Event(event) => event.id.clone(),
            Value::EventId(s) | Value::Pubkey(s) | Value::Relay(s) => s.clone(),
            Value::Integer(n) => n.to_string(),
            Value::Datetime(t) => t.to_string(),
            Value::Flag(b) => b.to_string(),
            Value::Trigger => "trigger".to_string(),
            Value::RelayStatus(status) => status.to_string(),
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Value::Event(event) => Some(event),
            _ => None,
        }
    }

    /// String payload of id-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::EventId(s) | Value::Pubkey(s) | Value::Relay(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload of integer and datetime values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(n) => u64::try_from(*n).ok(),
            Value::Datetime(t) => Some(*t),
            _ => None,
        }
    }
}

/// Whether a signal adds a value to, or retracts it from, the receiver's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Polarity {
    Add,
    Remove,
}

/// Unit of change flowing along an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub value: Value,
    pub polarity: Polarity,
}

impl Signal {
    pub fn add(value: Value) -> Self {
        Self {
            value,
            polarity: Polarity::Add,
        }
    }

    pub fn remove(value: Value) -> Self {
        Self {
            value,
            polarity: Polarity::Remove,
        }
    }

    pub fn is_add(&self) -> bool {
        self.polarity == Polarity::Add
    }
}
