//! Lookup kinds served by the batch fetcher.

use nostr::{Event, Filter, KIND_METADATA, decode_event_id, decode_pubkey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// What a [`BatchFetcher`](crate::BatchFetcher) looks up and how.
pub trait LookupKind: Send + Sync + 'static {
    /// Resolved value stored in the cache
    type Value: Clone + Send + Sync + 'static;

    /// Name used in logs
    const NAME: &'static str;

    /// Canonical form of a requested key, or `None` if it can never resolve.
    fn normalize_key(key: &str) -> Option<String>;

    /// Filters fetching every key of a batch in one query.
    fn batch_filters(keys: &[String]) -> Vec<Filter>;

    /// The key and value carried by a result event, if it is one.
    fn extract(event: &Event) -> Option<(String, Self::Value)>;

    /// Values that newer events can replace. Keys of such a kind resolve
    /// when the batch query ends, with the value [`supersedes`] ranks best.
    ///
    /// [`supersedes`]: LookupKind::supersedes
    const REPLACEABLE: bool = false;

    /// Whether `candidate` should replace `current` for the same key.
    fn supersedes(_candidate: &Self::Value, _current: &Self::Value) -> bool {
        false
    }
}

/// Kind-0 metadata of a pubkey.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    /// Timestamp of the metadata event
    pub created_at: u64,
}

impl Profile {
    /// Parse a kind-0 event. Content that is not a JSON object yields a
    /// profile with only the pubkey set; non-string fields are ignored.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != KIND_METADATA {
            return None;
        }
        let mut profile = Profile {
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            ..Default::default()
        };
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(&event.content) else {
            debug!(pubkey = %event.pubkey, "Metadata content is not a JSON object");
            return Some(profile);
        };
        let text = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        profile.name = text("name");
        profile.display_name = text("display_name").or_else(|| text("displayName"));
        profile.picture = text("picture");
        profile.about = text("about");
        profile.nip05 = text("nip05");
        profile.lud16 = text("lud16");
        Some(profile)
    }

    /// Best human-readable label: display name, then name, then a short pubkey.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.pubkey.chars().take(8).collect())
    }
}

/// Profile by pubkey (hex, npub or nprofile).
pub struct ProfileLookup;

impl LookupKind for ProfileLookup {
    type Value = Profile;

    const NAME: &'static str = "profile";

    fn normalize_key(key: &str) -> Option<String> {
        decode_pubkey(key)
    }

    fn batch_filters(keys: &[String]) -> Vec<Filter> {
        vec![Filter::new().kinds([KIND_METADATA]).authors(keys.iter().cloned())]
    }

    fn extract(event: &Event) -> Option<(String, Profile)> {
        Profile::from_event(event).map(|profile| (event.pubkey.clone(), profile))
    }

    // Kind 0 is replaceable: relays may hold stale versions.
    const REPLACEABLE: bool = true;

    fn supersedes(candidate: &Profile, current: &Profile) -> bool {
        candidate.created_at > current.created_at
    }
}

/// Event by id (hex, note or nevent).
pub struct EventLookup;

impl LookupKind for EventLookup {
    type Value = Event;

    const NAME: &'static str = "event";

    fn normalize_key(key: &str) -> Option<String> {
        decode_event_id(key)
    }

    fn batch_filters(keys: &[String]) -> Vec<Filter> {
        vec![Filter::new().ids(keys.iter().cloned())]
    }

    fn extract(event: &Event) -> Option<(String, Event)> {
        Some((event.id.clone(), event.clone()))
    }
}
