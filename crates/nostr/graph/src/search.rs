//! Content search over an event stream.

use crate::error::{GraphError, Result};
use nostr::Event;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How the pattern is matched against event content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SearchMode {
    Substring {
        #[serde(default)]
        case_sensitive: bool,
    },
    Regex,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Substring {
            case_sensitive: false,
        }
    }
}

/// Parameters of a search node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchParams {
    pub pattern: String,
    pub mode: SearchMode,
    /// Pass events that do *not* match
    pub exclude: bool,
}

impl SearchParams {
    pub fn substring(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            mode: SearchMode::Regex,
            exclude: false,
        }
    }

    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }
}

/// A compiled search.
#[derive(Debug, Clone)]
pub struct Matcher {
    kind: MatcherKind,
    exclude: bool,
}

#[derive(Debug, Clone)]
enum MatcherKind {
    /// Empty pattern: everything matches
    All,
    Substring { needle: String, case_sensitive: bool },
    Regex(Regex),
}

impl Matcher {
    /// Compile `params`. An invalid regular expression is rejected here so
    /// the error reaches the editor rather than the event stream.
    pub fn compile(params: &SearchParams) -> Result<Self> {
        let kind = if params.pattern.is_empty() {
            MatcherKind::All
        } else {
            match params.mode {
                SearchMode::Substring { case_sensitive } => MatcherKind::Substring {
                    needle: if case_sensitive {
                        params.pattern.clone()
                    } else {
                        params.pattern.to_lowercase()
                    },
                    case_sensitive,
                },
                SearchMode::Regex => MatcherKind::Regex(
                    Regex::new(&params.pattern)
                        .map_err(|e| GraphError::InvalidPattern(e.to_string()))?,
                ),
            }
        };
        Ok(Self {
            kind,
            exclude: params.exclude,
        })
    }

    /// Whether `event` passes the search.
    pub fn accepts(&self, event: &Event) -> bool {
        let found = match &self.kind {
            MatcherKind::All => true,
            MatcherKind::Substring {
                needle,
                case_sensitive: true,
            } => event.content.contains(needle.as_str()),
            MatcherKind::Substring { needle, .. } => {
                event.content.to_lowercase().contains(needle.as_str())
            }
            MatcherKind::Regex(regex) => regex.is_match(&event.content),
        };
        found != self.exclude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(content: &str) -> Event {
        Event {
            id: "1".repeat(64),
            pubkey: "2".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: content.to_string(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_substring_case_handling() {
        let insensitive = Matcher::compile(&SearchParams::substring("Bitcoin")).unwrap();
        assert!(insensitive.accepts(&note("i like bitcoin")));

        let sensitive = Matcher::compile(&SearchParams {
            pattern: "Bitcoin".into(),
            mode: SearchMode::Substring {
                case_sensitive: true,
            },
            exclude: false,
        })
        .unwrap();
        assert!(!sensitive.accepts(&note("i like bitcoin")));
        assert!(sensitive.accepts(&note("i like Bitcoin")));
    }

    #[test]
    fn test_regex_and_exclude() {
        let matcher = Matcher::compile(&SearchParams::regex(r"^gm\b")).unwrap();
        assert!(matcher.accepts(&note("gm nostr")));
        assert!(!matcher.accepts(&note("gmail")));

        let excluding = Matcher::compile(&SearchParams::regex(r"^gm\b").excluding()).unwrap();
        assert!(!excluding.accepts(&note("gm nostr")));
        assert!(excluding.accepts(&note("gmail")));
    }

    #[test]
    fn test_empty_pattern_passes_everything() {
        let matcher = Matcher::compile(&SearchParams::default()).unwrap();
        assert!(matcher.accepts(&note("")));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = Matcher::compile(&SearchParams::regex("(unclosed")).unwrap_err();
        assert!(matches!(err, GraphError::InvalidPattern(_)));
    }
}
