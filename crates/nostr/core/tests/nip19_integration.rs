//! Integration tests for NIP-19 entity encoding and decoding

use bech32::{Bech32m, Hrp};
use nostr::{
    AddressPointer, EventPointer, MAX_IDENTIFIER_LENGTH, Nip19Entity, ProfilePointer, decode,
    decode_event_id, decode_pubkey, encode_naddr, encode_nevent, encode_note, encode_nprofile,
    encode_npub, try_decode,
};

const PUBKEY: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";
const EVENT_ID: &str = "46f6ef16ae82542cd1a2356a04a4e0fd65bd0a1a81b6a7c0b4cd4b8b3b5e1e2f";
const NPROFILE: &str = "nprofile1qqsrhuxx8l9ex335q7he0f09aej04zpazpl0ne2cgukyawd24mayt8gpp4mhxue69uhhytnc9e3k7mgpz4mhxue69uhkg6nzv9ejuumpv34kytnrdaksjlyr9p";

fn keys() -> Vec<String> {
    vec![
        PUBKEY.to_string(),
        EVENT_ID.to_string(),
        "0".repeat(64),
        "f".repeat(64),
        "0123456789abcdef".repeat(4),
    ]
}

#[test]
fn test_simple_identifiers_roundtrip() {
    for key in keys() {
        let npub = encode_npub(&key).expect("encode npub");
        assert!(npub.starts_with("npub1"));
        assert_eq!(decode(&npub).unwrap(), Nip19Entity::Pubkey(key.clone()));
        assert_eq!(decode_pubkey(&npub), Some(key.clone()));

        let note = encode_note(&key).expect("encode note");
        assert!(note.starts_with("note1"));
        assert_eq!(decode(&note).unwrap(), Nip19Entity::Note(key.clone()));
        assert_eq!(decode_event_id(&note), Some(key));
    }
}

#[test]
fn test_uppercase_hex_roundtrips_to_lowercase() {
    let upper = PUBKEY.to_uppercase();
    let npub = encode_npub(&upper).unwrap();
    assert_eq!(decode_pubkey(&npub).as_deref(), Some(PUBKEY));
    assert_eq!(decode_pubkey(&upper).as_deref(), Some(PUBKEY));
}

#[test]
fn test_known_nprofile_vector() {
    let decoded = decode(NPROFILE).expect("decode nprofile");
    assert_eq!(
        decoded,
        Nip19Entity::Profile(ProfilePointer {
            pubkey: PUBKEY.to_string(),
            relays: vec![
                "wss://r.x.com".to_string(),
                "wss://djbas.sadkb.com".to_string(),
            ],
        })
    );
    assert_eq!(decoded.encode().unwrap(), NPROFILE);
}

#[test]
fn test_nprofile_roundtrip() {
    let profile = ProfilePointer {
        pubkey: PUBKEY.to_string(),
        relays: vec!["wss://relay.damus.io".to_string(), "wss://nos.lol".to_string()],
    };
    let encoded = encode_nprofile(&profile).unwrap();
    assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Profile(profile));
}

#[test]
fn test_nevent_roundtrip_with_and_without_optionals() {
    let minimal = EventPointer {
        id: EVENT_ID.to_string(),
        ..Default::default()
    };
    let full = EventPointer {
        id: EVENT_ID.to_string(),
        relays: vec!["wss://relay.example".to_string()],
        author: Some(PUBKEY.to_string()),
        kind: Some(1),
    };
    for pointer in [minimal, full] {
        let encoded = encode_nevent(&pointer).unwrap();
        assert!(encoded.starts_with("nevent1"));
        assert_eq!(decode_event_id(&encoded).as_deref(), Some(EVENT_ID));
        assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Event(pointer));
    }
}

#[test]
fn test_naddr_roundtrip() {
    let address = AddressPointer {
        identifier: "banana-bread".to_string(),
        pubkey: PUBKEY.to_string(),
        kind: 30023,
        relays: vec!["wss://relay.example".to_string()],
    };
    let encoded = encode_naddr(&address).unwrap();
    assert!(encoded.starts_with("naddr1"));
    assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Address(address));
}

#[test]
fn test_naddr_with_empty_identifier() {
    let address = AddressPointer {
        identifier: String::new(),
        pubkey: PUBKEY.to_string(),
        kind: 10002,
        relays: vec![],
    };
    let encoded = encode_naddr(&address).unwrap();
    assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Address(address));
}

#[test]
fn test_malformed_input_returns_none() {
    let npub = encode_npub(PUBKEY).unwrap();

    // Flip the last checksum character.
    let mut bad_checksum = npub.clone();
    let last = bad_checksum.pop().unwrap();
    bad_checksum.push(if last == 'q' { 'p' } else { 'q' });

    // Mixed case is invalid bech32.
    let mixed_case = format!("NPUB{}", &npub[4..]);

    // Same payload under a bech32m checksum.
    let bech32m = bech32::encode::<Bech32m>(
        Hrp::parse("npub").unwrap(),
        &hex::decode(PUBKEY).unwrap(),
    )
    .unwrap();

    let inputs = [
        "",
        "npub1",
        "not_a_valid_identifier",
        "nostr:",
        bad_checksum.as_str(),
        mixed_case.as_str(),
        bech32m.as_str(),
        &npub[..npub.len() - 10],
        "abcd",
        "zz".repeat(32).as_str(),
    ]
    .map(str::to_string);

    for input in &inputs {
        assert_eq!(try_decode(input), None, "input {input:?}");
        assert_eq!(decode_pubkey(input), None, "input {input:?}");
        assert_eq!(decode_event_id(input), None, "input {input:?}");
    }
}

fn long_relay(n: usize) -> String {
    format!("wss://relay-{n}.example.com/{}", "p".repeat(150))
}

#[test]
fn test_identifiers_past_bech32_code_length_roundtrip() {
    let relays: Vec<String> = (0..4).map(long_relay).collect();
    assert!(relays.iter().all(|relay| relay.len() < 255));

    let profile = ProfilePointer {
        pubkey: PUBKEY.to_string(),
        relays: relays.clone(),
    };
    let nprofile = encode_nprofile(&profile).unwrap();
    assert!(nprofile.len() > 1023);
    assert_eq!(decode(&nprofile).unwrap(), Nip19Entity::Profile(profile));
    assert_eq!(decode_pubkey(&nprofile).as_deref(), Some(PUBKEY));

    let address = AddressPointer {
        identifier: "x".repeat(200),
        pubkey: PUBKEY.to_string(),
        kind: 30023,
        relays,
    };
    let naddr = encode_naddr(&address).unwrap();
    assert!(naddr.len() > 1023);
    assert_eq!(decode(&naddr).unwrap(), Nip19Entity::Address(address));
}

#[test]
fn test_identifier_length_is_capped() {
    let profile = ProfilePointer {
        pubkey: PUBKEY.to_string(),
        relays: (0..20).map(long_relay).collect(),
    };
    assert!(encode_nprofile(&profile).is_err());

    let oversized = format!("npub1{}", "q".repeat(MAX_IDENTIFIER_LENGTH));
    assert_eq!(try_decode(&oversized), None);
}

#[test]
fn test_encode_rejects_bad_hex() {
    assert!(encode_npub("xyz").is_err());
    assert!(encode_note(&"ab".repeat(31)).is_err());
}
