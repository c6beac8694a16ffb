//! NIP-19: bech32-encoded entities.
//!
//! Bare entities (`npub`, `note`) carry a 32-byte payload. Shareable entities
//! (`nprofile`, `nevent`, `naddr`) carry a list of TLV records:
//!
//! | type | meaning | nprofile | nevent | naddr |
//! |------|---------|----------|--------|-------|
//! | 0 | special | pubkey (32 bytes) | event id (32 bytes) | `d` identifier (UTF-8) |
//! | 1 | relay | relay URL (UTF-8, repeatable) | relay URL | relay URL |
//! | 2 | author | - | author pubkey (32 bytes) | author pubkey (32 bytes) |
//! | 3 | kind | - | kind (u32 BE) | kind (u32 BE) |
//!
//! Unknown TLV types are skipped. Decoding never panics: [`try_decode`] and the
//! `decode_*` helpers return `None` for anything malformed, since the input is
//! usually text a user typed or pasted.

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{ByteIterExt, Checksum, Fe32IterExt, Hrp};
use thiserror::Error;

pub const NPUB_HRP: &str = "npub";
pub const NOTE_HRP: &str = "note";
pub const NPROFILE_HRP: &str = "nprofile";
pub const NEVENT_HRP: &str = "nevent";
pub const NADDR_HRP: &str = "naddr";

/// URI scheme prefix accepted in front of any entity (NIP-21).
pub const NOSTR_URI_SCHEME: &str = "nostr:";

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// Longest accepted identifier, hrp and separator included.
pub const MAX_IDENTIFIER_LENGTH: usize = 5000;

/// Plain bech32 (BIP-173) with the code length raised for TLV entities.
///
/// Bech32m strings fail the checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nip19Bech32 {}

impl Checksum for Nip19Bech32 {
    type MidstateRepr = u32;
    const CODE_LENGTH: usize = MAX_IDENTIFIER_LENGTH;
    const CHECKSUM_LENGTH: usize = 6;
    const GENERATOR_SH: [u32; 5] = [0x3b6a_57b2, 0x2650_8e6d, 0x1ea1_19fa, 0x3d42_33dd, 0x2a14_62b3];
    const TARGET_RESIDUE: u32 = 1;
}

/// Errors that can occur while encoding or decoding NIP-19 entities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip19Error {
    #[error("bech32 encode error: {0}")]
    Bech32Encode(String),

    #[error("bech32 decode error: {0}")]
    Bech32Decode(String),

    #[error("unsupported prefix: {0}")]
    UnsupportedPrefix(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("truncated TLV record of type {0}")]
    TruncatedTlv(u8),

    #[error("TLV value of type {0} is too long ({1} bytes)")]
    TlvTooLong(u8, usize),

    #[error("missing required TLV record of type {0}")]
    MissingTlv(u8),

    #[error("invalid UTF-8 in TLV record of type {0}")]
    InvalidUtf8(u8),
}

/// Reference to a profile with optional relay hints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfilePointer {
    /// Lowercase hex public key
    pub pubkey: String,
    pub relays: Vec<String>,
}

/// Reference to an event with optional relay hints, author and kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventPointer {
    /// Lowercase hex event id
    pub id: String,
    pub relays: Vec<String>,
    /// Lowercase hex pubkey of the author
    pub author: Option<String>,
    pub kind: Option<u32>,
}

/// Reference to an addressable (parameterized replaceable) event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressPointer {
    /// The `d` tag value
    pub identifier: String,
    /// Lowercase hex pubkey of the author
    pub pubkey: String,
    pub kind: u32,
    pub relays: Vec<String>,
}

impl AddressPointer {
    /// The `kind:pubkey:identifier` coordinate used in `a` tags.
    pub fn coordinate(&self) -> String {
        format!("{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

/// A decoded NIP-19 entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nip19Entity {
    Pubkey(String),
    Note(String),
    Profile(ProfilePointer),
    Event(EventPointer),
    Address(AddressPointer),
}

impl Nip19Entity {
    /// Encode the entity back to its bech32 form.
    pub fn encode(&self) -> Result<String, Nip19Error> {
        match self {
            Nip19Entity::Pubkey(pubkey) => encode_npub(pubkey),
            Nip19Entity::Note(id) => encode_note(id),
            Nip19Entity::Profile(profile) => encode_nprofile(profile),
            Nip19Entity::Event(event) => encode_nevent(event),
            Nip19Entity::Address(address) => encode_naddr(address),
        }
    }
}

/// Encode a hex public key as `npub`.
pub fn encode_npub(pubkey_hex: &str) -> Result<String, Nip19Error> {
    encode_bech32(NPUB_HRP, &hex_to_32(pubkey_hex)?)
}

/// Encode a hex event id as `note`.
pub fn encode_note(event_id_hex: &str) -> Result<String, Nip19Error> {
    encode_bech32(NOTE_HRP, &hex_to_32(event_id_hex)?)
}

/// Encode a profile pointer as `nprofile`.
pub fn encode_nprofile(profile: &ProfilePointer) -> Result<String, Nip19Error> {
    let mut tlv = TlvWriter::default();
    tlv.push(TLV_SPECIAL, &hex_to_32(&profile.pubkey)?)?;
    for relay in &profile.relays {
        tlv.push(TLV_RELAY, relay.as_bytes())?;
    }
    encode_bech32(NPROFILE_HRP, &tlv.bytes)
}

/// Encode an event pointer as `nevent`.
pub fn encode_nevent(event: &EventPointer) -> Result<String, Nip19Error> {
    let mut tlv = TlvWriter::default();
    tlv.push(TLV_SPECIAL, &hex_to_32(&event.id)?)?;
    for relay in &event.relays {
        tlv.push(TLV_RELAY, relay.as_bytes())?;
    }
    if let Some(author) = &event.author {
        tlv.push(TLV_AUTHOR, &hex_to_32(author)?)?;
    }
    if let Some(kind) = event.kind {
        tlv.push(TLV_KIND, &kind.to_be_bytes())?;
    }
    encode_bech32(NEVENT_HRP, &tlv.bytes)
}

/// Encode an address pointer as `naddr`.
pub fn encode_naddr(address: &AddressPointer) -> Result<String, Nip19Error> {
    let mut tlv = TlvWriter::default();
    tlv.push(TLV_SPECIAL, address.identifier.as_bytes())?;
    for relay in &address.relays {
        tlv.push(TLV_RELAY, relay.as_bytes())?;
    }
    tlv.push(TLV_AUTHOR, &hex_to_32(&address.pubkey)?)?;
    tlv.push(TLV_KIND, &address.kind.to_be_bytes())?;
    encode_bech32(NADDR_HRP, &tlv.bytes)
}

/// Decode any supported entity, reporting why decoding failed.
pub fn decode(input: &str) -> Result<Nip19Entity, Nip19Error> {
    let (hrp, data) = decode_bech32(input)?;

    match hrp.as_str() {
        NPUB_HRP => Ok(Nip19Entity::Pubkey(bytes_to_hex_32(&data)?)),
        NOTE_HRP => Ok(Nip19Entity::Note(bytes_to_hex_32(&data)?)),
        NPROFILE_HRP => {
            let mut profile = ProfilePointer::default();
            let mut found = false;
            for record in TlvReader::new(&data) {
                let (kind, value) = record?;
                match kind {
                    TLV_SPECIAL if !found => {
                        profile.pubkey = bytes_to_hex_32(value)?;
                        found = true;
                    }
                    TLV_RELAY => profile.relays.push(utf8(kind, value)?),
                    _ => {}
                }
            }
            if !found {
                return Err(Nip19Error::MissingTlv(TLV_SPECIAL));
            }
            Ok(Nip19Entity::Profile(profile))
        }
        NEVENT_HRP => {
            let mut event = EventPointer::default();
            let mut found = false;
            for record in TlvReader::new(&data) {
                let (kind, value) = record?;
                match kind {
                    TLV_SPECIAL if !found => {
                        event.id = bytes_to_hex_32(value)?;
                        found = true;
                    }
                    TLV_RELAY => event.relays.push(utf8(kind, value)?),
                    TLV_AUTHOR if event.author.is_none() => {
                        event.author = Some(bytes_to_hex_32(value)?)
                    }
                    TLV_KIND if event.kind.is_none() => event.kind = Some(be_u32(kind, value)?),
                    _ => {}
                }
            }
            if !found {
                return Err(Nip19Error::MissingTlv(TLV_SPECIAL));
            }
            Ok(Nip19Entity::Event(event))
        }
        NADDR_HRP => {
            let mut identifier = None;
            let mut pubkey = None;
            let mut kind_value = None;
            let mut relays = Vec::new();
            for record in TlvReader::new(&data) {
                let (kind, value) = record?;
                match kind {
                    TLV_SPECIAL if identifier.is_none() => identifier = Some(utf8(kind, value)?),
                    TLV_RELAY => relays.push(utf8(kind, value)?),
                    TLV_AUTHOR if pubkey.is_none() => pubkey = Some(bytes_to_hex_32(value)?),
                    TLV_KIND if kind_value.is_none() => kind_value = Some(be_u32(kind, value)?),
                    _ => {}
                }
            }
            Ok(Nip19Entity::Address(AddressPointer {
                identifier: identifier.ok_or(Nip19Error::MissingTlv(TLV_SPECIAL))?,
                pubkey: pubkey.ok_or(Nip19Error::MissingTlv(TLV_AUTHOR))?,
                kind: kind_value.ok_or(Nip19Error::MissingTlv(TLV_KIND))?,
                relays,
            }))
        }
        other => Err(Nip19Error::UnsupportedPrefix(other.to_string())),
    }
}

/// Decode any supported entity, returning `None` on malformed input.
pub fn try_decode(input: &str) -> Option<Nip19Entity> {
    decode(input).ok()
}

/// Resolve a pubkey from `npub`, `nprofile` or 64-character hex.
///
/// Stops reading TLV records as soon as the pubkey is found.
pub fn decode_pubkey(input: &str) -> Option<String> {
    decode_primary(input, &[NPUB_HRP, NPROFILE_HRP])
}

/// Resolve an event id from `note`, `nevent` or 64-character hex.
///
/// Stops reading TLV records as soon as the id is found.
pub fn decode_event_id(input: &str) -> Option<String> {
    decode_primary(input, &[NOTE_HRP, NEVENT_HRP])
}

/// Remove a leading `nostr:` scheme, if any.
pub fn strip_nostr_prefix(input: &str) -> &str {
    let input = input.trim();
    match input.get(..NOSTR_URI_SCHEME.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(NOSTR_URI_SCHEME) => {
            &input[NOSTR_URI_SCHEME.len()..]
        }
        _ => input,
    }
}

fn decode_primary(input: &str, accepted: &[&str]) -> Option<String> {
    let stripped = strip_nostr_prefix(input);
    if stripped.len() == 64 && stripped.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(stripped.to_ascii_lowercase());
    }

    let (hrp, data) = decode_bech32(stripped).ok()?;
    let hrp = hrp.as_str();
    if !accepted.contains(&hrp) {
        return None;
    }
    if hrp == NPUB_HRP || hrp == NOTE_HRP {
        return bytes_to_hex_32(&data).ok();
    }

    for record in TlvReader::new(&data) {
        let (kind, value) = record.ok()?;
        if kind == TLV_SPECIAL {
            return bytes_to_hex_32(value).ok();
        }
    }
    None
}

/// Decoded human-readable part, lowercased.
struct DecodedHrp(String);

impl DecodedHrp {
    fn as_str(&self) -> &str {
        &self.0
    }
}

fn encode_bech32(hrp: &str, data: &[u8]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::Bech32Encode(e.to_string()))?;
    let encoded: String = data
        .iter()
        .copied()
        .bytes_to_fes()
        .with_checksum::<Nip19Bech32>(&hrp)
        .chars()
        .collect();
    if encoded.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Nip19Error::Bech32Encode(format!(
            "encoded length {} exceeds {MAX_IDENTIFIER_LENGTH}",
            encoded.len()
        )));
    }
    Ok(encoded)
}

fn decode_bech32(input: &str) -> Result<(DecodedHrp, Vec<u8>), Nip19Error> {
    let input = strip_nostr_prefix(input);
    let checked = CheckedHrpstring::new::<Nip19Bech32>(input)
        .map_err(|e| Nip19Error::Bech32Decode(e.to_string()))?;
    Ok((
        DecodedHrp(checked.hrp().to_lowercase()),
        checked.byte_iter().collect(),
    ))
}

fn hex_to_32(value: &str) -> Result<[u8; 32], Nip19Error> {
    let bytes = hex::decode(value).map_err(|e| Nip19Error::InvalidHex(e.to_string()))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| Nip19Error::InvalidLength(len))
}

fn bytes_to_hex_32(bytes: &[u8]) -> Result<String, Nip19Error> {
    if bytes.len() != 32 {
        return Err(Nip19Error::InvalidLength(bytes.len()));
    }
    Ok(hex::encode(bytes))
}

fn utf8(kind: u8, value: &[u8]) -> Result<String, Nip19Error> {
    String::from_utf8(value.to_vec()).map_err(|_| Nip19Error::InvalidUtf8(kind))
}

fn be_u32(kind: u8, value: &[u8]) -> Result<u32, Nip19Error> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| Nip19Error::TruncatedTlv(kind))?;
    Ok(u32::from_be_bytes(bytes))
}

#[derive(Default)]
struct TlvWriter {
    bytes: Vec<u8>,
}

impl TlvWriter {
    fn push(&mut self, kind: u8, value: &[u8]) -> Result<(), Nip19Error> {
        let len = u8::try_from(value.len()).map_err(|_| Nip19Error::TlvTooLong(kind, value.len()))?;
        self.bytes.push(kind);
        self.bytes.push(len);
        self.bytes.extend_from_slice(value);
        Ok(())
    }
}

/// Iterates over `(type, value)` records; yields one error and stops on truncation.
struct TlvReader<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> TlvReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            failed: false,
        }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<(u8, &'a [u8]), Nip19Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        let kind = self.data[0];
        let Some(&len) = self.data.get(1) else {
            self.failed = true;
            return Some(Err(Nip19Error::TruncatedTlv(kind)));
        };
        let end = 2 + len as usize;
        if self.data.len() < end {
            self.failed = true;
            return Some(Err(Nip19Error::TruncatedTlv(kind)));
        }
        let data = self.data;
        let value = &data[2..end];
        self.data = &data[end..];
        Some(Ok((kind, value)))
    }
}
