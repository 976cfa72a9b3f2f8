//! Event parsing, validation, deduplication and per-thread ordering

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::aliases;
use super::dedup::{DedupCache, DedupConfig};
use super::types::{Event, EventPayload, EventType, Operation};
use crate::tables::TableConfig;

/// Why a raw payload could not become an [`Event`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Payload is not a JSON object
    #[error("payload is not an object")]
    NotAnObject,

    /// Table is missing or not one of the watched tables
    #[error("unknown table: {0:?}")]
    UnknownTable(String),

    /// Operation is missing or not INSERT/UPDATE/DELETE
    #[error("unknown operation: {0:?}")]
    UnknownOperation(String),

    /// A required identifier is absent from both row snapshots
    #[error("missing {0} in payload")]
    MissingIdentifier(&'static str),
}

type StreamQueue = VecDeque<Event>;

/// Turns raw change payloads into ordered, deduplicated per-thread queues
///
/// Each thread has its own queue behind its own async mutex, so different
/// threads can be fed concurrently. Queues are kept sorted by timestamp on
/// insert.
pub struct EventProcessor {
    tables: TableConfig,
    dedup: DedupCache,
    queues: DashMap<String, Arc<Mutex<StreamQueue>>>,
}

impl EventProcessor {
    /// Create a processor for the given table layout
    pub fn new(tables: TableConfig, dedup: DedupConfig) -> Self {
        Self {
            tables,
            dedup: DedupCache::new(dedup),
            queues: DashMap::new(),
        }
    }

    /// Table layout this processor routes on
    pub fn tables(&self) -> &TableConfig {
        &self.tables
    }

    /// Parse a raw payload received now
    pub fn parse_payload(&self, raw: &Value) -> Option<Event> {
        self.parse_payload_at(raw, Utc::now())
    }

    /// Parse a raw payload, using `received_at` when the row has no timestamp
    ///
    /// Unroutable or malformed payloads yield `None`; they are logged and
    /// never reported as errors.
    pub fn parse_payload_at(&self, raw: &Value, received_at: DateTime<Utc>) -> Option<Event> {
        match self.try_parse(raw, received_at) {
            Ok(event) => {
                debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    stream_key = %event.stream_key,
                    "Parsed change event"
                );
                Some(event)
            }
            Err(e) => {
                debug!(error = %e, "Dropping unparseable payload");
                None
            }
        }
    }

    fn try_parse(&self, raw: &Value, received_at: DateTime<Utc>) -> Result<Event, ParseError> {
        let object = raw.as_object().ok_or(ParseError::NotAnObject)?;

        let event_type_str = aliases::first_str(object, aliases::EVENT_TYPE).unwrap_or_default();
        let table = aliases::first_str(object, aliases::TABLE).unwrap_or_default();
        let operation_str =
            aliases::first_str(object, aliases::OPERATION).unwrap_or(event_type_str);

        let new = record(object, aliases::NEW_RECORD);
        let old = record(object, aliases::OLD_RECORD);

        let kind = self
            .tables
            .kind_of(table)
            .ok_or_else(|| ParseError::UnknownTable(table.to_string()))?;
        let operation = Operation::parse(operation_str)
            .ok_or_else(|| ParseError::UnknownOperation(operation_str.to_string()))?;
        let event_type = EventType::from_parts(kind, operation);

        let owner_id = aliases::row_id(&new, &old, aliases::OWNER_ID)
            .ok_or(ParseError::MissingIdentifier("owner id"))?;
        let stream_key = aliases::row_id(&new, &old, aliases::STREAM_KEY)
            .ok_or(ParseError::MissingIdentifier("stream key"))?;
        let entity_id = if event_type.is_entity_scoped() {
            aliases::row_id(&new, &old, aliases::ENTITY_ID)
        } else {
            None
        };

        let timestamp = aliases::first_str(&new, aliases::UPDATED_AT)
            .or_else(|| aliases::first_str(&old, aliases::UPDATED_AT))
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(Event::new(
            event_type,
            owner_id,
            stream_key,
            entity_id,
            EventPayload::new(new, old),
            timestamp,
            table,
            operation,
        ))
    }

    /// Check required identifiers
    pub fn validate(&self, event: &Event) -> bool {
        if event.owner_id.trim().is_empty() || event.stream_key.trim().is_empty() {
            warn!(event_id = %event.event_id, "Event missing owner id or stream key");
            return false;
        }

        if event.event_type.is_entity_scoped()
            && event.entity_id.as_deref().map_or(true, |id| id.trim().is_empty())
        {
            warn!(event_id = %event.event_id, "Entity event missing entity id");
            return false;
        }

        true
    }

    /// Check-and-record the event id; `true` if it was seen before
    pub fn is_duplicate(&self, event: &Event) -> bool {
        let seen = self.dedup.check_and_insert(&event.event_id);
        if seen {
            debug!(event_id = %event.event_id, "Duplicate event");
        }
        seen
    }

    /// Validate, deduplicate and enqueue an event
    ///
    /// Returns `false` when the event was rejected.
    #[instrument(skip(self, event), fields(event_id = %event.event_id, stream_key = %event.stream_key))]
    pub async fn add_event(&self, event: Event) -> bool {
        if !self.validate(&event) {
            return false;
        }
        if self.is_duplicate(&event) {
            return false;
        }

        let queue = self.queue_for(&event.stream_key);
        let mut queue = queue.lock().await;
        let position = queue.partition_point(|queued| queued.timestamp <= event.timestamp);
        info!(
            event_type = %event.event_type,
            position,
            pending = queue.len() + 1,
            "Queued event"
        );
        queue.insert(position, event);
        true
    }

    /// Put a failed event back for redelivery
    ///
    /// Skips validation and deduplication. The event goes ahead of queued
    /// events with the same timestamp since it was dequeued before them.
    pub async fn requeue(&self, event: Event) {
        let queue = self.queue_for(&event.stream_key);
        let mut queue = queue.lock().await;
        let position = queue.partition_point(|queued| queued.timestamp < event.timestamp);
        debug!(
            event_id = %event.event_id,
            attempt = event.attempt,
            "Requeued event for redelivery"
        );
        queue.insert(position, event);
    }

    /// Pop the earliest pending event for a thread
    ///
    /// Returns `None` when the queue is empty or its head is a redelivery
    /// that is not due yet; later events wait behind it.
    pub async fn get_next_event(&self, stream_key: &str) -> Option<Event> {
        let queue = self.existing_queue(stream_key)?;
        let mut queue = queue.lock().await;

        if queue.front()?.is_ready(Instant::now()) {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Drop every pending event for a thread
    pub async fn clear_queue(&self, stream_key: &str) {
        if let Some((_, queue)) = self.queues.remove(stream_key) {
            let mut queue = queue.lock().await;
            if !queue.is_empty() {
                debug!(stream_key, dropped = queue.len(), "Cleared pending events");
            }
            queue.clear();
        }
    }

    /// Number of pending events for a thread
    pub async fn pending_len(&self, stream_key: &str) -> usize {
        let Some(queue) = self.existing_queue(stream_key) else {
            return 0;
        };
        let len = queue.lock().await.len();
        len
    }

    /// Snapshot of a thread's pending events, in delivery order
    pub async fn pending_events(&self, stream_key: &str) -> Vec<Event> {
        let Some(queue) = self.existing_queue(stream_key) else {
            return Vec::new();
        };
        let events = queue.lock().await.iter().cloned().collect();
        events
    }

    /// Number of remembered event ids
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    fn existing_queue(&self, stream_key: &str) -> Option<Arc<Mutex<StreamQueue>>> {
        self.queues
            .get(stream_key)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn queue_for(&self, stream_key: &str) -> Arc<Mutex<StreamQueue>> {
        Arc::clone(self.queues.entry(stream_key.to_string()).or_default().value())
    }
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new(TableConfig::default(), DedupConfig::default())
    }
}

fn record(object: &Map<String, Value>, candidates: &[&str]) -> Map<String, Value> {
    aliases::first_present(object, candidates)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}
