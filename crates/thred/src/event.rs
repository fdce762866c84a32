//! Inbound and outbound events.
//!
//! Events are facts: immutable once built, read-only to the engine. Only
//! `id`, `type` and `source` are required; everything else is optional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type of a participant broadcast to every member of a thred.
pub const BROADCAST_EVENT_TYPE: &str = "org.thred.broadcast";

/// Event type stamped on messages published by reactions.
pub const REACTION_EVENT_TYPE: &str = "org.thred.reaction";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

impl EventSource {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            uri: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFault {
    pub code: String,
    pub message: String,
}

/// Free-form payload carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventFault>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thred_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
}

impl Event {
    /// New event with a fresh id and the current time.
    pub fn new(event_type: impl Into<String>, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source,
            thred_id: None,
            re: None,
            time: Some(Utc::now()),
            data: None,
        }
    }

    pub fn with_thred(mut self, thred_id: impl Into<String>) -> Self {
        self.thred_id = Some(thred_id.into());
        self
    }

    pub fn with_re(mut self, re: impl Into<String>) -> Self {
        self.re = Some(re.into());
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_values(mut self, values: Value) -> Self {
        self.content_mut().values = Some(values);
        self
    }

    pub fn with_fault(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.content_mut().error = Some(EventFault {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    fn content_mut(&mut self) -> &mut Content {
        self.data
            .get_or_insert_with(EventData::default)
            .content
            .get_or_insert_with(Content::default)
    }

    pub fn content(&self) -> Option<&Content> {
        self.data.as_ref().and_then(|d| d.content.as_ref())
    }

    pub fn values(&self) -> Option<&Value> {
        self.content().and_then(|c| c.values.as_ref())
    }

    /// A single named entry of `data.content.values`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values().and_then(|v| v.get(name))
    }

    pub fn is_bound(&self) -> bool {
        self.thred_id.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.content().is_some_and(|c| c.error.is_some())
    }

    pub fn is_broadcast(&self) -> bool {
        self.event_type == BROADCAST_EVENT_TYPE
    }
}
