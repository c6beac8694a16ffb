//! Relay subscription plumbing for the Nostr query graph.
//!
//! This crate provides:
//! - Relay wire messages (NIP-01 REQ/CLOSE and EVENT/OK/EOSE/CLOSED/NOTICE)
//! - A transport seam so relay connections are supplied by the embedder
//! - [`RelayMultiplexer`]: one wire subscription per relay for many consumers
//! - One-shot (EOSE-terminated) queries with a deadline
//! - [`BatchFetcher`]: coalesced profile/event lookups backed by a shared cache
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::Filter;
//! use nostr_client::{MultiplexerConfig, RelayMultiplexer, RelayTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn recent_notes(transport: Arc<dyn RelayTransport>) {
//!     let mux = RelayMultiplexer::new(transport, MultiplexerConfig::default());
//!     let relays = vec!["wss://relay.damus.io".to_string()];
//!     let result = mux
//!         .query(&relays, vec![Filter::new().kinds([1]).limit(10)], Duration::from_secs(5))
//!         .await;
//!     for event in result.events {
//!         println!("{}: {}", event.pubkey, event.content);
//!     }
//! }
//! ```

mod cache;
mod config;
mod error;
mod fetcher;
mod lookup;
mod message;
mod multiplexer;
mod subscription;
mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::LookupCache;
pub use config::{CacheConfig, DEFAULT_RELAYS, FetcherConfig, MultiplexerConfig, TimeoutPolicy};
pub use error::{ClientError, Result};
pub use fetcher::{BatchFetcher, LookupOutcome};
pub use lookup::{EventLookup, LookupKind, Profile, ProfileLookup};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use multiplexer::{QueryOutcome, QueryResult, RelayMultiplexer, RelayStatus, SubscriptionHandler};
pub use subscription::{SubscriptionTracker, generate_subscription_id};
pub use transport::{RelayTransport, TransportEvent, TransportReceiver};

/// Profile fetcher type used by the graph runtime.
pub type ProfileFetcher = BatchFetcher<ProfileLookup>;

/// Event fetcher type.
pub type EventFetcher = BatchFetcher<EventLookup>;
