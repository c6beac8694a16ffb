//! Node identities, kinds and socket declarations.

use crate::operator::OperatorKind;
use crate::search::SearchParams;
use crate::source::SourceParams;
use crate::value::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of a node within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An input socket declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSocket {
    pub name: &'static str,
    pub ty: ValueType,
    /// Whether more than one edge may feed this input
    pub multiple: bool,
}

/// An output socket declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSocket {
    pub name: &'static str,
    pub ty: ValueType,
}

const fn input(name: &'static str, ty: ValueType, multiple: bool) -> InputSocket {
    InputSocket { name, ty, multiple }
}

const fn output(name: &'static str, ty: ValueType) -> OutputSocket {
    OutputSocket { name, ty }
}

const SOURCE_INPUTS: &[InputSocket] = &[
    input("authors", ValueType::Pubkey, true),
    input("ids", ValueType::EventId, true),
    input("relays", ValueType::Relay, true),
    input("since", ValueType::Datetime, false),
    input("until", ValueType::Datetime, false),
    input("limit", ValueType::Integer, false),
];

const SOURCE_OUTPUTS: &[OutputSocket] = &[
    output("events", ValueType::Event),
    output("pubkeys", ValueType::Pubkey),
    output("ids", ValueType::EventId),
    output("status", ValueType::RelayStatus),
];

const OPERATOR_INPUTS: &[InputSocket] = &[
    input("a", ValueType::Event, false),
    input("b", ValueType::Event, false),
];

const SEARCH_INPUTS: &[InputSocket] = &[input("events", ValueType::Event, false)];

const EVENTS_OUTPUT: &[OutputSocket] = &[output("events", ValueType::Event)];

const DISPLAY_INPUTS: &[InputSocket] = &[input("events", ValueType::Event, true)];

/// What a node does, with its editable parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum NodeKind {
    Source(SourceParams),
    Operator(OperatorKind),
    Search(SearchParams),
    Display,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Source(_) => "source",
            NodeKind::Operator(_) => "operator",
            NodeKind::Search(_) => "search",
            NodeKind::Display => "display",
        }
    }

    pub fn inputs(&self) -> &'static [InputSocket] {
        match self {
            NodeKind::Source(_) => SOURCE_INPUTS,
            NodeKind::Operator(_) => OPERATOR_INPUTS,
            NodeKind::Search(_) => SEARCH_INPUTS,
            NodeKind::Display => DISPLAY_INPUTS,
        }
    }

    pub fn outputs(&self) -> &'static [OutputSocket] {
        match self {
            NodeKind::Source(_) => SOURCE_OUTPUTS,
            NodeKind::Operator(_) | NodeKind::Search(_) => EVENTS_OUTPUT,
            NodeKind::Display => &[],
        }
    }

    pub fn input(&self, name: &str) -> Option<&'static InputSocket> {
        self.inputs().iter().find(|socket| socket.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&'static OutputSocket> {
        self.outputs().iter().find(|socket| socket.name == name)
    }
}

/// An edge from one node's output to another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source_node: NodeId,
    pub source_output: String,
    pub target_node: NodeId,
    pub target_input: String,
}

impl Connection {
    pub fn new(
        source_node: NodeId,
        source_output: impl Into<String>,
        target_node: NodeId,
        target_input: impl Into<String>,
    ) -> Self {
        Self {
            source_node,
            source_output: source_output.into(),
            target_node,
            target_input: target_input.into(),
        }
    }
}
