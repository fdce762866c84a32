//! Per-thred scratch space.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Participants and named locals of one thred.
///
/// Owned exclusively by its [`Thred`](crate::Thred); only mutated while the
/// thred's lock is held.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThredContext {
    pub thred_id: String,
    #[serde(default)]
    participants: BTreeSet<String>,
    #[serde(default)]
    locals: BTreeMap<String, Value>,
}

impl ThredContext {
    pub fn new(thred_id: impl Into<String>) -> Self {
        Self {
            thred_id: thred_id.into(),
            ..Self::default()
        }
    }

    /// Returns true if the participant was not already a member.
    pub fn add_participant(&mut self, participant_id: impl Into<String>) -> bool {
        self.participants.insert(participant_id.into())
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> bool {
        self.participants.remove(participant_id)
    }

    pub fn is_participant(&self, participant_id: &str) -> bool {
        self.participants.contains(participant_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub fn locals(&self) -> &BTreeMap<String, Value> {
        &self.locals
    }
}
