//! Display sink state and completion tracking.

use crate::channel::SignalChannel;
use nostr_client::Profile;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Loading state of a display, derived from the sources feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Completion {
    /// Nothing upstream is querying
    Idle,
    /// Still loading, or fed by at least one streaming source
    Live,
    /// Every upstream source was one-shot and has finished
    Complete,
}

/// Progress of one source branch feeding a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Branch {
    pub forward: bool,
    /// Subscribed now, or finished a one-shot query
    pub engaged: bool,
    pub done: bool,
}

pub(crate) fn completion(branches: &[Branch]) -> Completion {
    if branches.iter().all(|branch| !branch.engaged) {
        Completion::Idle
    } else if branches.iter().all(|branch| !branch.forward && branch.done) {
        Completion::Complete
    } else {
        Completion::Live
    }
}

#[derive(Debug, Default)]
pub(crate) struct DisplayState {
    /// Mirrors the display's accumulated event set
    pub channel: SignalChannel,
    /// Authors whose profile was already requested
    pub requested: HashSet<String>,
    pub profiles: HashMap<String, Profile>,
}
