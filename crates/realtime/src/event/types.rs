//! Typed change events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::tables::ChannelKind;

/// Row-level operation reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Parse a wire operation name, case-insensitively
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Kind of change, by scope and operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    DocumentCreated,
    DocumentUpdated,
    DocumentDeleted,
}

impl EventType {
    /// Combine a channel kind and an operation
    pub fn from_parts(kind: ChannelKind, operation: Operation) -> Self {
        match (kind, operation) {
            (ChannelKind::Entity, Operation::Insert) => Self::EntityCreated,
            (ChannelKind::Entity, Operation::Update) => Self::EntityUpdated,
            (ChannelKind::Entity, Operation::Delete) => Self::EntityDeleted,
            (ChannelKind::Document, Operation::Insert) => Self::DocumentCreated,
            (ChannelKind::Document, Operation::Update) => Self::DocumentUpdated,
            (ChannelKind::Document, Operation::Delete) => Self::DocumentDeleted,
        }
    }

    /// Channel kind this event type belongs to
    pub fn channel_kind(&self) -> ChannelKind {
        match self {
            Self::EntityCreated | Self::EntityUpdated | Self::EntityDeleted => ChannelKind::Entity,
            Self::DocumentCreated | Self::DocumentUpdated | Self::DocumentDeleted => {
                ChannelKind::Document
            }
        }
    }

    /// Entity-scoped events must carry an entity id
    pub fn is_entity_scoped(&self) -> bool {
        self.channel_kind() == ChannelKind::Entity
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EntityCreated => "entity_created",
            Self::EntityUpdated => "entity_updated",
            Self::EntityDeleted => "entity_deleted",
            Self::DocumentCreated => "document_created",
            Self::DocumentUpdated => "document_updated",
            Self::DocumentDeleted => "document_deleted",
        };
        f.write_str(name)
    }
}

/// Raw before/after row snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Row after the change (empty for deletes)
    #[serde(default)]
    pub new: Map<String, Value>,

    /// Row before the change (often empty unless replica identity is full)
    #[serde(default)]
    pub old: Map<String, Value>,
}

impl EventPayload {
    /// Create a payload from both snapshots
    pub fn new(new: Map<String, Value>, old: Map<String, Value>) -> Self {
        Self { new, old }
    }
}

/// A validated unit of work for one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub owner_id: String,
    pub stream_key: String,

    /// Section id; only present for entity-scoped events
    pub entity_id: Option<String>,

    pub payload: EventPayload,

    /// Ordering key: the row's own `updated_at`, else time of receipt
    pub timestamp: DateTime<Utc>,

    /// Deduplication key, see [`Event::derive_id`]
    pub event_id: String,

    pub source_table: String,
    pub operation: Operation,

    /// Applies already attempted for this event
    #[serde(default)]
    pub attempt: u32,

    /// Earliest moment a redelivery may run
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

impl Event {
    /// Create an event, deriving its id from the provenance fields
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: EventType,
        owner_id: impl Into<String>,
        stream_key: impl Into<String>,
        entity_id: Option<String>,
        payload: EventPayload,
        timestamp: DateTime<Utc>,
        source_table: impl Into<String>,
        operation: Operation,
    ) -> Self {
        let stream_key = stream_key.into();
        let source_table = source_table.into();
        let event_id = Self::derive_id(&source_table, &stream_key, entity_id.as_deref(), timestamp);

        Self {
            event_type,
            owner_id: owner_id.into(),
            stream_key,
            entity_id,
            payload,
            timestamp,
            event_id,
            source_table,
            operation,
            attempt: 0,
            not_before: None,
        }
    }

    /// `<table>:<stream>:<entity|none>:<timestamp>`
    ///
    /// Two distinct changes to the same row with an identical timestamp
    /// collapse to one id.
    pub fn derive_id(
        source_table: &str,
        stream_key: &str,
        entity_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            source_table,
            stream_key,
            entity_id.unwrap_or("none"),
            timestamp.to_rfc3339()
        )
    }

    /// Whether a delayed redelivery may run at `now`
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("insert"), Some(Operation::Insert));
        assert_eq!(Operation::parse(" UPDATE "), Some(Operation::Update));
        assert_eq!(Operation::parse("Delete"), Some(Operation::Delete));
        assert_eq!(Operation::parse("postgres_changes"), None);
    }

    #[test]
    fn test_event_type_from_parts() {
        assert_eq!(
            EventType::from_parts(ChannelKind::Entity, Operation::Update),
            EventType::EntityUpdated
        );
        assert_eq!(
            EventType::from_parts(ChannelKind::Document, Operation::Delete),
            EventType::DocumentDeleted
        );
        assert!(EventType::EntityCreated.is_entity_scoped());
        assert!(!EventType::DocumentUpdated.is_entity_scoped());
    }

    #[test]
    fn test_event_id_derivation() {
        let event = Event::new(
            EventType::EntityUpdated,
            "7",
            "thread-1",
            Some("pain".to_string()),
            EventPayload::default(),
            ts(),
            "section_states",
            Operation::Update,
        );
        assert_eq!(
            event.event_id,
            "section_states:thread-1:pain:2025-03-01T12:00:00+00:00"
        );

        let doc = Event::new(
            EventType::DocumentUpdated,
            "7",
            "thread-1",
            None,
            EventPayload::default(),
            ts(),
            "business_plans",
            Operation::Update,
        );
        assert_eq!(
            doc.event_id,
            "business_plans:thread-1:none:2025-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn test_event_type_serde_names() {
        let json = serde_json::to_string(&EventType::DocumentCreated).unwrap();
        assert_eq!(json, "\"document_created\"");
        assert_eq!(EventType::EntityDeleted.to_string(), "entity_deleted");
    }
}
