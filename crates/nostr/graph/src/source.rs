//! Source node parameters and filter derivation.
//!
//! A source's query is its static parameters merged with whatever values
//! currently sit on its input sockets. Connected-but-empty `authors` or
//! `ids` inputs mean the source is waiting on upstream data and queries
//! nothing.

use crate::error::{GraphError, Result};
use nostr::{Filter, decode_event_id, decode_pubkey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How long a source's subscription stays open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Keep streaming new events after stored events are delivered
    #[default]
    Forward,
    /// One-shot historical query ending at EOSE or the deadline
    Backward,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Forward => "forward",
            Strategy::Backward => "backward",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "forward" => Some(Strategy::Forward),
            "backward" => Some(Strategy::Backward),
            _ => None,
        }
    }
}

/// Editable parameters of a source node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceParams {
    pub kinds: Vec<u16>,
    /// Event ids, hex or bech32
    pub ids: Vec<String>,
    /// Author pubkeys, hex or bech32
    pub authors: Vec<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    /// Tag letter to accepted values
    pub tags: BTreeMap<String, Vec<String>>,
    /// Relays to query; the graph's defaults when empty
    pub relays: Vec<String>,
    pub strategy: Strategy,
}

impl SourceParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn tag(
        mut self,
        letter: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.tags
            .insert(letter.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn relays(mut self, relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn backward(mut self) -> Self {
        self.strategy = Strategy::Backward;
        self
    }

    /// Validate the parameters and rewrite identifiers to lowercase hex.
    pub fn normalized(&self) -> Result<Self> {
        let authors = self
            .authors
            .iter()
            .map(|author| {
                decode_pubkey(author)
                    .ok_or_else(|| GraphError::param("authors", format!("not a pubkey: {author}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let ids = self
            .ids
            .iter()
            .map(|id| {
                decode_event_id(id)
                    .ok_or_else(|| GraphError::param("ids", format!("not an event id: {id}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let relays = self
            .relays
            .iter()
            .map(|relay| normalize_relay(relay))
            .collect::<Result<Vec<_>>>()?;

        let normalized = Self {
            authors: dedup(authors),
            ids: dedup(ids),
            relays: dedup(relays),
            tags: self
                .tags
                .iter()
                .map(|(letter, values)| {
                    (letter.trim_start_matches('#').to_string(), values.clone())
                })
                .collect(),
            ..self.clone()
        };
        normalized.base_filter().validate()?;
        Ok(normalized)
    }

    fn base_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        for (letter, values) in &self.tags {
            filter = filter.tag(letter, values.iter().cloned());
        }
        filter.since = self.since;
        filter.until = self.until;
        filter.limit = self.limit;
        filter
    }
}

/// Values currently present on a source's input sockets.
///
/// `None` means the socket is not connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicInputs {
    pub authors: Option<Vec<String>>,
    pub ids: Option<Vec<String>>,
    pub relays: Vec<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
}

/// Build the filters for `params` merged with `inputs`.
///
/// Returns no filters when there is nothing sensible to query: an
/// unconstrained filter, a connected id/author input with no values yet, or
/// an empty time range.
pub fn derive_filters(params: &SourceParams, inputs: &DynamicInputs) -> Vec<Filter> {
    let mut filter = params.base_filter();

    let Some(authors) = merge(&params.authors, inputs.authors.as_deref()) else {
        return Vec::new();
    };
    if !authors.is_empty() {
        filter = filter.authors(authors);
    }
    let Some(ids) = merge(&params.ids, inputs.ids.as_deref()) else {
        return Vec::new();
    };
    if !ids.is_empty() {
        filter = filter.ids(ids);
    }

    filter.since = inputs.since.or(params.since);
    filter.until = inputs.until.or(params.until);
    filter.limit = inputs.limit.or(params.limit);

    if filter.is_empty() || filter.validate().is_err() {
        return Vec::new();
    }
    vec![filter]
}

/// Relays a source queries: its own plus dynamic ones, or `defaults`.
pub fn derive_relays(params: &SourceParams, inputs: &DynamicInputs, defaults: &[String]) -> Vec<String> {
    let relays = dedup(params.relays.iter().chain(&inputs.relays).cloned());
    if relays.is_empty() {
        defaults.to_vec()
    } else {
        relays
    }
}

/// Union static and dynamic values. `None` when a connected input is empty
/// and there are no static values to fall back on.
fn merge(fixed: &[String], dynamic: Option<&[String]>) -> Option<Vec<String>> {
    match dynamic {
        Some([]) if fixed.is_empty() => None,
        Some(values) => Some(dedup(fixed.iter().chain(values).cloned())),
        None => Some(fixed.to_vec()),
    }
}

fn dedup(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

pub(crate) fn normalize_relay(relay: &str) -> Result<String> {
    let relay = relay.trim();
    let valid = ["ws://", "wss://"]
        .iter()
        .any(|scheme| relay.len() > scheme.len() && relay.starts_with(scheme));
    if valid {
        Ok(relay.trim_end_matches('/').to_string())
    } else {
        Err(GraphError::param("relays", format!("not a websocket url: {relay}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(n: u8) -> String {
        format!("{n:064x}")
    }

    #[test]
    fn test_static_params_only() {
        let params = SourceParams::new().kinds([1]).authors([key(1)]).limit(20);
        assert_eq!(
            derive_filters(&params, &DynamicInputs::default()),
            vec![Filter::new().kinds([1]).authors([key(1)]).limit(20)]
        );
    }

    #[test]
    fn test_dynamic_values_union_with_static() {
        let params = SourceParams::new().kinds([1]).authors([key(1)]);
        let inputs = DynamicInputs {
            authors: Some(vec![key(2), key(1)]),
            since: Some(100),
            ..Default::default()
        };
        assert_eq!(
            derive_filters(&params, &inputs),
            vec![Filter::new().kinds([1]).authors([key(1), key(2)]).since(100)]
        );
    }

    #[test]
    fn test_connected_empty_input_waits() {
        let params = SourceParams::new().kinds([1]);
        let inputs = DynamicInputs {
            authors: Some(vec![]),
            ..Default::default()
        };
        assert!(derive_filters(&params, &inputs).is_empty());
        assert!(derive_filters(&SourceParams::new(), &DynamicInputs::default()).is_empty());
    }

    #[test]
    fn test_dynamic_range_inverted_queries_nothing() {
        let params = SourceParams::new().kinds([1]).until(50);
        let inputs = DynamicInputs {
            since: Some(100),
            ..Default::default()
        };
        assert!(derive_filters(&params, &inputs).is_empty());
    }

    #[test]
    fn test_tags_are_keyed_for_the_wire() {
        let params = SourceParams::new().tag("#t", ["nostr"]).normalized().unwrap();
        assert_eq!(
            derive_filters(&params, &DynamicInputs::default()),
            vec![Filter::new().tag("t", ["nostr"])]
        );
    }

    #[test]
    fn test_relays_fall_back_to_defaults() {
        let defaults = vec!["wss://default.example".to_string()];
        let params = SourceParams::new();
        assert_eq!(derive_relays(&params, &DynamicInputs::default(), &defaults), defaults);

        let inputs = DynamicInputs {
            relays: vec!["wss://dynamic.example".into()],
            ..Default::default()
        };
        let params = params.relays(["wss://fixed.example"]);
        assert_eq!(
            derive_relays(&params, &inputs, &defaults),
            vec!["wss://fixed.example".to_string(), "wss://dynamic.example".to_string()]
        );
    }

    #[test]
    fn test_normalized_decodes_bech32_and_rejects_garbage() {
        let npub = nostr::encode_npub(&key(7)).unwrap();
        let params = SourceParams::new()
            .authors([npub.clone(), key(7)])
            .relays(["wss://relay.example/"])
            .normalized()
            .unwrap();
        assert_eq!(params.authors, vec![key(7)]);
        assert_eq!(params.relays, vec!["wss://relay.example".to_string()]);

        assert!(matches!(
            SourceParams::new().authors(["bob"]).normalized(),
            Err(GraphError::InvalidParam { .. })
        ));
        assert!(matches!(
            SourceParams::new().relays(["https://relay.example"]).normalized(),
            Err(GraphError::InvalidParam { .. })
        ));
        assert!(matches!(
            SourceParams::new().since(10).until(5).normalized(),
            Err(GraphError::Filter(_))
        ));
    }
}
