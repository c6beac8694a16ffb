//! Live Nostr query graphs.
//!
//! A graph wires sources (relay queries), set operators, content searches
//! and displays together. Edits re-derive only the subscriptions they
//! affect; events flow through the graph as add/remove [`Signal`]s so every
//! node can retract what it emitted earlier.
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::RelayTransport;
//! use nostr_graph::{Connection, GraphConfig, NodeGraph, NodeKind, SearchParams, SourceParams};
//! use std::sync::Arc;
//!
//! async fn gm_timeline(transport: Arc<dyn RelayTransport>) -> nostr_graph::Result<()> {
//!     let graph = NodeGraph::with_transport(transport, GraphConfig::default());
//!     let notes = graph.add_node(NodeKind::Source(SourceParams::new().kinds([1])))?;
//!     let search = graph.add_node(NodeKind::Search(SearchParams::substring("gm")))?;
//!     let display = graph.add_node(NodeKind::Display)?;
//!     graph.connect(Connection::new(notes, "events", search, "events"))?;
//!     graph.connect(Connection::new(search, "events", display, "events"))?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!     for event in graph.display_events(display)? {
//!         println!("{}", event.content);
//!     }
//!     Ok(())
//! }
//! ```

mod channel;
mod config;
mod control;
mod display;
mod error;
mod graph;
mod node;
mod operator;
mod search;
mod source;
mod status;
mod value;

pub use channel::{ChannelMessage, SignalChannel, SubscriptionToken};
pub use config::GraphConfig;
pub use control::{
    CheckboxControl, Control, ControlValue, FilterControl, SelectControl, SelectOption, TextControl,
    node_controls,
};
pub use display::Completion;
pub use error::{GraphError, Result};
pub use graph::{NodeGraph, Watch};
pub use node::{Connection, InputSocket, NodeId, NodeKind, OutputSocket};
pub use operator::{OperatorKind, OperatorState, Side};
pub use search::{Matcher, SearchMode, SearchParams};
pub use source::{DynamicInputs, SourceParams, Strategy, derive_filters, derive_relays};
pub use status::NodeStatus;
pub use value::{Polarity, Signal, Value, ValueType};
