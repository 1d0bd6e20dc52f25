//! Core data model.
//!
//! An event is one observed state transition of a watched cluster object, as
//! reported by the control plane. Notifications wrap events with what the
//! change feed saw happen to the event record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Newtype for event record UIDs. Dedup and document identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The object an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// Severity tag carried by every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
    /// Anything the control plane reports that we do not model.
    #[serde(untagged)]
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
            EventType::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster event as delivered by the change feed.
///
/// Events are immutable once received. Field names follow the control
/// plane's camelCase wire naming so serialized documents look like the
/// source records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identity of the event record.
    pub uid: Uid,

    /// Namespace of the event record itself.
    #[serde(default)]
    pub namespace: String,

    /// Name of the event record itself.
    #[serde(default)]
    pub name: String,

    /// The object this event describes.
    #[serde(default)]
    pub involved_object: ObjectReference,

    /// Short machine-readable reason, e.g. "BackOff".
    #[serde(default)]
    pub reason: String,

    /// Human-readable description.
    #[serde(default)]
    pub message: String,

    #[serde(rename = "type", default)]
    pub event_type: EventType,

    /// How many times the underlying condition has occurred.
    #[serde(default)]
    pub count: u32,

    /// Component that reported the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_component: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,

    /// When the underlying condition last occurred. Drives staleness.
    pub last_timestamp: DateTime<Utc>,

    /// When the feed last observed this notification.
    pub observed_at: DateTime<Utc>,
}

impl Event {
    /// Build an event about `namespace/name` with both timestamps set to now.
    pub fn new(
        uid: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let namespace = namespace.into();
        let name = name.into();
        Self {
            uid: Uid(uid.into()),
            namespace: namespace.clone(),
            name: name.clone(),
            involved_object: ObjectReference {
                kind: String::new(),
                namespace,
                name,
            },
            reason: reason.into(),
            message: String::new(),
            event_type: EventType::Normal,
            count: 1,
            source_component: None,
            first_timestamp: Some(now),
            last_timestamp: now,
            observed_at: now,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.involved_object.kind = kind.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn source_component(mut self, component: impl Into<String>) -> Self {
        self.source_component = Some(component.into());
        self
    }

    pub fn last_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.last_timestamp = at;
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// `namespace/name` of the involved object, for logs.
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}",
            self.involved_object.namespace, self.involved_object.name
        )
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Identity left behind by a deleted event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub uid: Uid,
}

/// What the change feed saw happen to an event record.
///
/// Uses the control plane's watch envelope on the wire:
/// `{"type": "ADDED", "object": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum Notification {
    #[serde(rename = "ADDED")]
    Added(Event),
    #[serde(rename = "MODIFIED", alias = "UPDATED")]
    Updated(Event),
    #[serde(rename = "DELETED")]
    Deleted(Tombstone),
}

impl Notification {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Added(_) => "add",
            Notification::Updated(_) => "update",
            Notification::Deleted(_) => "delete",
        }
    }

    pub fn uid(&self) -> &Uid {
        match self {
            Notification::Added(e) | Notification::Updated(e) => &e.uid,
            Notification::Deleted(t) => &t.uid,
        }
    }
}
