//! Boolean set operators over two event streams.
//!
//! Membership is tracked per event id on each side; the output set is
//! re-derived for an id whenever either side changes, so an id can move in
//! and out of the output any number of times.

use crate::value::{Signal, Value};
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Set operation applied by an operator node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperatorKind {
    /// Present in both inputs
    #[default]
    And,
    /// Present in either input
    Or,
    /// Present in `a` but not in `b`
    Difference,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 3] = [OperatorKind::And, OperatorKind::Or, OperatorKind::Difference];

    pub fn includes(self, in_a: bool, in_b: bool) -> bool {
        match self {
            OperatorKind::And => in_a && in_b,
            OperatorKind::Or => in_a || in_b,
            OperatorKind::Difference => in_a && !in_b,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::And => "and",
            OperatorKind::Or => "or",
            OperatorKind::Difference => "difference",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OperatorKind::And => "A AND B",
            OperatorKind::Or => "A OR B",
            OperatorKind::Difference => "A - B",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

/// Which operator input a signal arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn from_socket(name: &str) -> Option<Self> {
        match name {
            "a" => Some(Side::A),
            "b" => Some(Side::B),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct OperatorState {
    a: BTreeMap<String, Event>,
    b: BTreeMap<String, Event>,
    output: BTreeSet<String>,
}

impl OperatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an input signal and return the output change it causes, if any.
    pub fn apply(&mut self, kind: OperatorKind, side: Side, signal: &Signal) -> Option<Signal> {
        let event = signal.value.as_event()?;
        let set = match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        };
        if signal.is_add() {
            set.insert(event.id.clone(), event.clone());
        } else {
            set.remove(&event.id);
        }
        self.settle(kind, &event.id, event)
    }

    /// Re-derive every id after the operation changed.
    pub fn reevaluate(&mut self, kind: OperatorKind) -> Vec<Signal> {
        let mut events: BTreeMap<String, Event> = self.b.clone();
        events.extend(self.a.iter().map(|(id, event)| (id.clone(), event.clone())));
        events
            .iter()
            .filter_map(|(id, event)| self.settle(kind, id, event))
            .collect()
    }

    /// Ids currently emitted.
    pub fn output(&self) -> impl Iterator<Item = &str> {
        self.output.iter().map(String::as_str)
    }

    fn settle(&mut self, kind: OperatorKind, id: &str, event: &Event) -> Option<Signal> {
        let wanted = kind.includes(self.a.contains_key(id), self.b.contains_key(id));
        let emitted = self.output.contains(id);
        match (wanted, emitted) {
            (true, false) => {
                self.output.insert(id.to_string());
                Some(Signal::add(Value::Event(event.clone())))
            }
            (false, true) => {
                self.output.remove(id);
                Some(Signal::remove(Value::Event(event.clone())))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Polarity;
    use pretty_assertions::assert_eq;

    fn event(n: u8) -> Event {
        Event {
            id: format!("{n:064x}"),
            pubkey: "0".repeat(64),
            created_at: n as u64,
            kind: 1,
            tags: vec![],
            content: format!("e{n}"),
            sig: String::new(),
        }
    }

    fn feed(kind: OperatorKind) -> (OperatorState, Vec<(Polarity, String)>) {
        let mut state = OperatorState::new();
        let mut emitted = Vec::new();
        for (side, n) in [(Side::A, 1), (Side::A, 2), (Side::B, 2), (Side::B, 3)] {
            if let Some(signal) = state.apply(kind, side, &Signal::add(Value::Event(event(n)))) {
                emitted.push((signal.polarity, signal.value.key()));
            }
        }
        (state, emitted)
    }

    fn ids(state: &OperatorState) -> Vec<String> {
        state.output().map(str::to_string).collect()
    }

    #[test]
    fn test_and() {
        let (state, _) = feed(OperatorKind::And);
        assert_eq!(ids(&state), vec![event(2).id]);
    }

    #[test]
    fn test_or_signals_each_id_once() {
        let (state, emitted) = feed(OperatorKind::Or);
        assert_eq!(ids(&state), vec![event(1).id, event(2).id, event(3).id]);
        assert_eq!(
            emitted,
            vec![
                (Polarity::Add, event(1).id),
                (Polarity::Add, event(2).id),
                (Polarity::Add, event(3).id),
            ]
        );
    }

    #[test]
    fn test_or_removes_only_when_absent_everywhere() {
        let (mut state, _) = feed(OperatorKind::Or);
        let retract = Signal::remove(Value::Event(event(2)));
        assert_eq!(state.apply(OperatorKind::Or, Side::A, &retract), None);
        let removed = state.apply(OperatorKind::Or, Side::B, &retract).unwrap();
        assert_eq!(removed.polarity, Polarity::Remove);
    }

    #[test]
    fn test_difference_readds_when_b_retracts() {
        let (mut state, emitted) = feed(OperatorKind::Difference);
        assert_eq!(ids(&state), vec![event(1).id]);
        // e2 was briefly emitted, then retracted when it showed up in B.
        assert_eq!(
            emitted,
            vec![
                (Polarity::Add, event(1).id),
                (Polarity::Add, event(2).id),
                (Polarity::Remove, event(2).id),
            ]
        );

        let signal = state
            .apply(OperatorKind::Difference, Side::B, &Signal::remove(Value::Event(event(2))))
            .unwrap();
        assert_eq!(signal, Signal::add(Value::Event(event(2))));
        assert_eq!(ids(&state), vec![event(1).id, event(2).id]);
    }

    #[test]
    fn test_reevaluate_after_kind_change() {
        let (mut state, _) = feed(OperatorKind::And);
        let changes = state.reevaluate(OperatorKind::Difference);
        assert_eq!(
            changes,
            vec![
                Signal::add(Value::Event(event(1))),
                Signal::remove(Value::Event(event(2))),
            ]
        );
        assert_eq!(ids(&state), vec![event(1).id]);
    }

    #[test]
    fn test_parse_roundtrip() {
        for kind in OperatorKind::ALL {
            assert_eq!(OperatorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OperatorKind::parse("xor"), None);
    }
}
