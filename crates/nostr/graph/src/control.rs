//! Editor controls bound to node parameters.
//!
//! Each parameter is exposed as one [`Control`]; the editor reads
//! [`Control::current_value`] and writes back through
//! [`NodeGraph::set_control`](crate::NodeGraph::set_control).

use crate::error::{GraphError, Result};
use crate::node::NodeKind;
use crate::operator::OperatorKind;
use crate::search::{SearchMode, SearchParams};
use crate::source::{SourceParams, Strategy};
use nostr::Filter;
use serde::{Deserialize, Serialize};

/// Value read from or written to a control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ControlValue {
    Text(String),
    Bool(bool),
    Filter(Filter),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextControl {
    pub label: String,
    pub value: String,
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectControl {
    pub label: String,
    pub options: Vec<SelectOption>,
    pub selected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxControl {
    pub label: String,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterControl {
    pub label: String,
    pub filter: Filter,
}

/// A parameter editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Control {
    Text(TextControl),
    MultilineText(TextControl),
    Select(SelectControl),
    Checkbox(CheckboxControl),
    Filter(FilterControl),
}

impl Control {
    pub fn label(&self) -> &str {
        match self {
            Control::Text(c) | Control::MultilineText(c) => &c.label,
            Control::Select(c) => &c.label,
            Control::Checkbox(c) => &c.label,
            Control::Filter(c) => &c.label,
        }
    }

    pub fn current_value(&self) -> ControlValue {
        match self {
            Control::Text(c) | Control::MultilineText(c) => ControlValue::Text(c.value.clone()),
            Control::Select(c) => ControlValue::Text(c.selected.clone()),
            Control::Checkbox(c) => ControlValue::Bool(c.checked),
            Control::Filter(c) => ControlValue::Filter(c.filter.clone()),
        }
    }

    /// Store `value` if it has the right shape for this control.
    pub fn on_change(&mut self, value: ControlValue) -> Result<()> {
        match (self, value) {
            (Control::Text(c) | Control::MultilineText(c), ControlValue::Text(text)) => {
                c.value = text;
            }
            (Control::Select(c), ControlValue::Text(choice)) => {
                if !c.options.iter().any(|option| option.value == choice) {
                    return Err(GraphError::InvalidControlValue(c.label.clone()));
                }
                c.selected = choice;
            }
            (Control::Checkbox(c), ControlValue::Bool(checked)) => c.checked = checked,
            (Control::Filter(c), ControlValue::Filter(filter)) => {
                filter.validate()?;
                c.filter = filter;
            }
            (control, _) => return Err(GraphError::InvalidControlValue(control.label().to_string())),
        }
        Ok(())
    }
}

fn text(label: &str, value: String, placeholder: &str) -> Control {
    Control::Text(TextControl {
        label: label.to_string(),
        value,
        placeholder: Some(placeholder.to_string()),
    })
}

fn multiline(label: &str, lines: &[String], placeholder: &str) -> Control {
    Control::MultilineText(TextControl {
        label: label.to_string(),
        value: lines.join("\n"),
        placeholder: Some(placeholder.to_string()),
    })
}

fn select<'a>(label: &str, options: impl IntoIterator<Item = (&'a str, &'a str)>, selected: &str) -> Control {
    Control::Select(SelectControl {
        label: label.to_string(),
        options: options
            .into_iter()
            .map(|(value, label)| SelectOption {
                value: value.to_string(),
                label: label.to_string(),
            })
            .collect(),
        selected: selected.to_string(),
    })
}

fn checkbox(label: &str, checked: bool) -> Control {
    Control::Checkbox(CheckboxControl {
        label: label.to_string(),
        checked,
    })
}

/// Controls for a node's parameters, keyed by parameter name.
pub fn node_controls(kind: &NodeKind) -> Vec<(&'static str, Control)> {
    match kind {
        NodeKind::Source(params) => source_controls(params),
        NodeKind::Search(params) => search_controls(params),
        NodeKind::Operator(op) => vec![(
            "operation",
            select(
                "Operation",
                OperatorKind::ALL.map(|kind| (kind.as_str(), kind.label())),
                op.as_str(),
            ),
        )],
        NodeKind::Display => Vec::new(),
    }
}

fn source_controls(params: &SourceParams) -> Vec<(&'static str, Control)> {
    let kinds = params
        .kinds
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let mut advanced = Filter::new();
    if !params.ids.is_empty() {
        advanced = advanced.ids(params.ids.iter().cloned());
    }
    for (letter, values) in &params.tags {
        advanced = advanced.tag(letter, values.iter().cloned());
    }
    advanced.since = params.since;
    advanced.until = params.until;
    advanced.limit = params.limit;

    vec![
        ("kinds", text("Kinds", kinds, "1, 6, 7")),
        ("authors", multiline("Authors", &params.authors, "npub or hex, one per line")),
        ("relays", multiline("Relays", &params.relays, "wss://...")),
        (
            "strategy",
            select(
                "Strategy",
                [("forward", "Live"), ("backward", "History")],
                params.strategy.as_str(),
            ),
        ),
        (
            "filter",
            Control::Filter(FilterControl {
                label: "Advanced".to_string(),
                filter: advanced,
            }),
        ),
    ]
}

fn search_controls(params: &SearchParams) -> Vec<(&'static str, Control)> {
    let (mode, case_sensitive) = match params.mode {
        SearchMode::Substring { case_sensitive } => ("substring", case_sensitive),
        SearchMode::Regex => ("regex", false),
    };
    vec![
        ("pattern", text("Pattern", params.pattern.clone(), "search text")),
        (
            "mode",
            select("Mode", [("substring", "Contains"), ("regex", "Regex")], mode),
        ),
        ("caseSensitive", checkbox("Case sensitive", case_sensitive)),
        ("exclude", checkbox("Exclude matches", params.exclude)),
    ]
}

/// Apply a control edit to a copy of `kind`.
pub(crate) fn apply_control(kind: &NodeKind, key: &str, value: ControlValue) -> Result<NodeKind> {
    let mut control = node_controls(kind)
        .into_iter()
        .find_map(|(name, control)| (name == key).then_some(control))
        .ok_or_else(|| GraphError::InvalidControlValue(key.to_string()))?;
    control.on_change(value)?;
    let value = control.current_value();

    let mut kind = kind.clone();
    match (&mut kind, key, value) {
        (NodeKind::Source(params), "kinds", ControlValue::Text(text)) => {
            params.kinds = text
                .split([',', ' '])
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse::<u16>()
                        .map_err(|_| GraphError::param("kinds", format!("not a kind: {part}")))
                })
                .collect::<Result<_>>()?;
        }
        (NodeKind::Source(params), "authors", ControlValue::Text(text)) => {
            params.authors = lines(&text);
        }
        (NodeKind::Source(params), "relays", ControlValue::Text(text)) => {
            params.relays = lines(&text);
        }
        (NodeKind::Source(params), "strategy", ControlValue::Text(choice)) => {
            params.strategy = Strategy::parse(&choice).unwrap_or_default();
        }
        (NodeKind::Source(params), "filter", ControlValue::Filter(filter)) => {
            params.ids = filter.ids.unwrap_or_default();
            params.since = filter.since;
            params.until = filter.until;
            params.limit = filter.limit;
            params.tags = filter
                .tags
                .into_iter()
                .map(|(key, values)| (key.trim_start_matches('#').to_string(), values))
                .collect();
        }
        (NodeKind::Search(params), "pattern", ControlValue::Text(pattern)) => {
            params.pattern = pattern;
        }
        (NodeKind::Search(params), "mode", ControlValue::Text(mode)) => {
            params.mode = match mode.as_str() {
                "regex" => SearchMode::Regex,
                _ => SearchMode::Substring {
                    case_sensitive: false,
                },
            };
        }
        (NodeKind::Search(params), "caseSensitive", ControlValue::Bool(checked)) => {
            if let SearchMode::Substring { case_sensitive } = &mut params.mode {
                *case_sensitive = checked;
            }
        }
        (NodeKind::Search(params), "exclude", ControlValue::Bool(checked)) => {
            params.exclude = checked;
        }
        (NodeKind::Operator(op), "operation", ControlValue::Text(choice)) => {
            *op = OperatorKind::parse(&choice).unwrap_or_default();
        }
        _ => return Err(GraphError::InvalidControlValue(key.to_string())),
    }
    Ok(kind)
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_on_change_checks_shape() {
        let mut control = checkbox("Exclude", false);
        assert!(control.on_change(ControlValue::Text("yes".into())).is_err());
        control.on_change(ControlValue::Bool(true)).unwrap();
        assert_eq!(control.current_value(), ControlValue::Bool(true));
    }

    #[test]
    fn test_select_rejects_unknown_option() {
        let mut control = select("Mode", [("a", "A"), ("b", "B")], "a");
        assert_eq!(
            control.on_change(ControlValue::Text("c".into())),
            Err(GraphError::InvalidControlValue("Mode".into()))
        );
        control.on_change(ControlValue::Text("b".into())).unwrap();
        assert_eq!(control.current_value(), ControlValue::Text("b".into()));
    }

    #[test]
    fn test_filter_control_validates() {
        let mut control = Control::Filter(FilterControl {
            label: "Advanced".into(),
            filter: Filter::new(),
        });
        let inverted = Filter::new().since(10).until(1);
        assert!(matches!(
            control.on_change(ControlValue::Filter(inverted)),
            Err(GraphError::Filter(_))
        ));
    }

    #[test]
    fn test_source_controls_write_back() {
        let kind = NodeKind::Source(SourceParams::new().kinds([1]));
        let kind = apply_control(&kind, "kinds", ControlValue::Text("1, 6,7".into())).unwrap();
        let kind = apply_control(&kind, "strategy", ControlValue::Text("backward".into())).unwrap();
        let kind = apply_control(
            &kind,
            "relays",
            ControlValue::Text("wss://a.example\n\n  wss://b.example ".into()),
        )
        .unwrap();
        let kind = apply_control(
            &kind,
            "filter",
            ControlValue::Filter(Filter::new().tag("t", ["nostr"]).limit(5)),
        )
        .unwrap();

        let NodeKind::Source(params) = kind else {
            panic!("source kind changed");
        };
        assert_eq!(params.kinds, vec![1, 6, 7]);
        assert_eq!(params.strategy, Strategy::Backward);
        assert_eq!(params.relays, vec!["wss://a.example", "wss://b.example"]);
        assert_eq!(params.limit, Some(5));
        assert_eq!(params.tags.get("t"), Some(&vec!["nostr".to_string()]));
    }

    #[test]
    fn test_bad_kind_text_is_a_param_error() {
        let kind = NodeKind::Source(SourceParams::new());
        assert!(matches!(
            apply_control(&kind, "kinds", ControlValue::Text("1, note".into())),
            Err(GraphError::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_operator_and_search_controls() {
        let op = apply_control(
            &NodeKind::Operator(OperatorKind::And),
            "operation",
            ControlValue::Text("difference".into()),
        )
        .unwrap();
        assert_eq!(op, NodeKind::Operator(OperatorKind::Difference));

        let search = NodeKind::Search(SearchParams::substring("gm"));
        let search = apply_control(&search, "caseSensitive", ControlValue::Bool(true)).unwrap();
        assert_eq!(
            search,
            NodeKind::Search(SearchParams {
                pattern: "gm".into(),
                mode: SearchMode::Substring {
                    case_sensitive: true
                },
                exclude: false,
            })
        );
        assert!(node_controls(&NodeKind::Display).is_empty());
    }
}
