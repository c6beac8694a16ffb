//! Nostr protocol types for the query graph.
//!
//! This crate provides:
//! - NIP-01: Event type, kind classification, display ordering
//! - NIP-01: Subscription filters and event matching
//! - NIP-19: bech32-encoded entities (npub, note, nprofile, nevent, naddr)
//! - NIP-21: `nostr:` URI prefix handling for pasted identifiers

mod filter;
pub mod nip01;
pub mod nip19;

pub use filter::{Filter, FilterError, MAX_LIMIT, matches_any};

pub use nip01::{
    Event, KIND_CONTACTS, KIND_LONG_FORM, KIND_METADATA, KIND_REACTION, KIND_REPOST,
    KIND_SHORT_TEXT_NOTE, KindClassification, Nip01Error, classify_kind, display_order,
    is_addressable_kind, is_ephemeral_kind, is_hex_32, is_replaceable_kind, sort_events,
};

pub use nip19::{
    AddressPointer, EventPointer, MAX_IDENTIFIER_LENGTH, Nip19Entity, Nip19Error, ProfilePointer,
    decode,
    decode_event_id, decode_pubkey, encode_naddr, encode_nevent, encode_note, encode_nprofile,
    encode_npub, strip_nostr_prefix, try_decode,
};
