//! NIP-01: Basic protocol flow description.
//!
//! This module implements the parts of the core Nostr event structure the
//! query graph needs:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Kind classification (regular, replaceable, ephemeral, addressable)
//! - Display ordering of events
//!
//! Signing and verification are left to an external signer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed Nostr event.
///
/// Events are immutable once received; identity is the `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Parse an event from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, Nip01Error> {
        let event: Event = serde_json::from_str(json)?;
        if !is_hex_32(&event.id) || !is_hex_32(&event.pubkey) {
            return Err(Nip01Error::InvalidEvent(
                "id and pubkey must be 64 lowercase hex characters".to_string(),
            ));
        }
        Ok(event)
    }

    /// Serialize the event to JSON.
    pub fn to_json(&self) -> Result<String, Nip01Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Values of every tag named `name` (the element right after the name).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// The `d` tag value of an addressable event.
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_values("d").next()
    }
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
    /// Unknown classification
    Unknown,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_REPOST: u16 = 6;
pub const KIND_REACTION: u16 = 7;
pub const KIND_LONG_FORM: u16 = 30023;

/// Classify an event kind according to NIP-01 rules.
pub fn classify_kind(kind: u16) -> KindClassification {
    let k = kind as u32;

    // Regular: 1000 <= n < 10000 || 4 <= n < 45 || n == 1 || n == 2
    if (1000..10000).contains(&k) || (4..45).contains(&k) || k == 1 || k == 2 {
        return KindClassification::Regular;
    }

    // Replaceable: 10000 <= n < 20000 || n == 0 || n == 3
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        return KindClassification::Replaceable;
    }

    if (20000..30000).contains(&k) {
        return KindClassification::Ephemeral;
    }

    if (30000..40000).contains(&k) {
        return KindClassification::Addressable;
    }

    KindClassification::Unknown
}

/// Check if a kind is replaceable.
pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

/// Check if a kind is ephemeral.
pub fn is_ephemeral_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

/// Check if a kind is addressable.
pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| display_order(a, b));
}

/// The ordering used by [`sort_events`], exposed for sorted inserts.
pub fn display_order(a: &Event, b: &Event) -> std::cmp::Ordering {
    match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    }
}

/// Whether `value` is 64 lowercase hex characters.
pub fn is_hex_32(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
