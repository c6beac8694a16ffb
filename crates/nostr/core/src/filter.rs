//! NIP-01 subscription filters and event matching.
//!
//! A filter is a conjunction of constraints (AND within a filter); a list of
//! filters matches an event when any of them does (OR across filters).

use crate::nip01::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound accepted for `limit`.
pub const MAX_LIMIT: u64 = 5000;

/// Errors reported by [`Filter::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid tag filter key {0:?}: expected '#' followed by a single letter")]
    InvalidTagKey(String),

    #[error("limit too large: {0} (max {MAX_LIMIT})")]
    LimitTooLarge(u64),

    #[error("since ({since}) is after until ({until})")]
    InvertedRange { since: u64, until: u64 },
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events the relay should return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed as on the wire (`"#e"`, `"#p"`, ...)
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(
        mut self,
        letter: impl AsRef<str>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let key = format!("#{}", letter.as_ref().trim_start_matches('#'));
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// True when the filter carries no constraint at all.
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
            && self.tags.is_empty()
    }

    /// Check the filter is well formed before it is sent to a relay.
    pub fn validate(&self) -> Result<(), FilterError> {
        for key in self.tags.keys() {
            let mut chars = key.chars();
            let valid = chars.next() == Some('#')
                && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.next().is_none();
            if !valid {
                return Err(FilterError::InvalidTagKey(key.clone()));
            }
        }

        if let Some(limit) = self.limit
            && limit > MAX_LIMIT
        {
            return Err(FilterError::LimitTooLarge(limit));
        }

        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(FilterError::InvertedRange { since, until });
        }

        Ok(())
    }

    /// Check if an event matches this filter.
    ///
    /// `limit` only bounds the stored-event replay and is ignored here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| *id == event.id)
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors.iter().any(|author| *author == event.pubkey)
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            event
                .tag_values(name)
                .any(|tag_value| values.iter().any(|v| v == tag_value))
        })
    }
}

/// Check if an event matches any filter in the list.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn note(kind: u16, pubkey: &str, created_at: u64, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "e1".repeat(32),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags,
            content: "hello".to_string(),
            sig: String::new(),
        }
    }

    fn tag(name: &str, value: &str) -> Vec<String> {
        vec![name.to_string(), value.to_string()]
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&note(1, "alice", 10, vec![])));
    }

    #[test]
    fn test_kind_and_author_are_anded() {
        let filter = Filter::new().kinds([1]).authors(["alice"]);
        assert!(filter.matches(&note(1, "alice", 10, vec![])));
        assert!(!filter.matches(&note(7, "alice", 10, vec![])));
        assert!(!filter.matches(&note(1, "bob", 10, vec![])));
    }

    #[test]
    fn test_authors_are_exact_not_prefix() {
        let filter = Filter::new().authors(["ali"]);
        assert!(!filter.matches(&note(1, "alice", 10, vec![])));
    }

    #[test]
    fn test_since_until_inclusive() {
        let filter = Filter::new().since(10).until(20);
        assert!(filter.matches(&note(1, "a", 10, vec![])));
        assert!(filter.matches(&note(1, "a", 20, vec![])));
        assert!(!filter.matches(&note(1, "a", 9, vec![])));
        assert!(!filter.matches(&note(1, "a", 21, vec![])));
    }

    #[test]
    fn test_tag_values_or_within_key_and_across_keys() {
        let filter = Filter::new().tag("t", ["nostr", "rust"]).tag("p", ["bob"]);
        let both = note(1, "a", 1, vec![tag("t", "rust"), tag("p", "bob")]);
        let only_t = note(1, "a", 1, vec![tag("t", "nostr")]);
        let wrong_value = note(1, "a", 1, vec![tag("t", "go"), tag("p", "bob")]);
        assert!(filter.matches(&both));
        assert!(!filter.matches(&only_t));
        assert!(!filter.matches(&wrong_value));
    }

    #[test]
    fn test_matches_any_is_or_across_filters() {
        let filters = vec![Filter::new().kinds([1]), Filter::new().kinds([7])];
        assert!(matches_any(&filters, &note(7, "a", 1, vec![])));
        assert!(!matches_any(&filters, &note(3, "a", 1, vec![])));
        assert!(!matches_any(&[], &note(1, "a", 1, vec![])));
    }

    #[test]
    fn test_serialization_flattens_tags() {
        let filter = Filter::new().kinds([1]).limit(5).event_refs(["abc"]);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kinds": [1], "limit": 5, "#e": ["abc"]})
        );
        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_validate() {
        assert!(Filter::new().tag("e", ["x"]).validate().is_ok());
        assert_eq!(
            Filter::new().tag("ab", ["x"]).validate(),
            Err(FilterError::InvalidTagKey("#ab".to_string()))
        );
        assert_eq!(
            Filter::new().limit(MAX_LIMIT + 1).validate(),
            Err(FilterError::LimitTooLarge(MAX_LIMIT + 1))
        );
        assert!(Filter::new().since(5).until(4).validate().is_err());
    }
}
