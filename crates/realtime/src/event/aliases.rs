//! Wire field aliases
//!
//! Client-library versions have used different key names for the same
//! logical field. Each list below is tried in order and the first present,
//! non-empty value wins. Wire-format changes belong here and nowhere else.

use serde_json::{Map, Value};

/// Event kind as reported by the feed
pub const EVENT_TYPE: &[&str] = &["eventType", "event_type", "event"];

/// Source table
pub const TABLE: &[&str] = &["table", "table_name"];

/// Row operation (`INSERT` / `UPDATE` / `DELETE`)
pub const OPERATION: &[&str] = &["type", "eventType"];

/// Row after the change
pub const NEW_RECORD: &[&str] = &["new", "new_record", "record"];

/// Row before the change
pub const OLD_RECORD: &[&str] = &["old", "old_record"];

/// Owner of the thread
pub const OWNER_ID: &[&str] = &["owner_id", "user_id"];

/// Thread the row belongs to
pub const STREAM_KEY: &[&str] = &["stream_key", "thread_id"];

/// Section within the thread
pub const ENTITY_ID: &[&str] = &["entity_id", "section_id"];

/// Row modification time
pub const UPDATED_AT: &[&str] = &["updated_at"];

/// Section body
pub const ENTITY_CONTENT: &[&str] = &["content"];

/// Business plan body, rich or markdown
pub const DOCUMENT_CONTENT: &[&str] = &["content", "markdown_content"];

/// Explicit section status
pub const STATUS: &[&str] = &["status"];

/// Conversation routing decision recorded with the row
pub const DIRECTIVE: &[&str] = &["router_directive", "directive"];

/// Whether the user accepted the section
pub const SATISFIED: &[&str] = &["is_satisfied"];

pub const SATISFACTION_STATUS: &[&str] = &["satisfaction_status"];

/// Envelope keys the actual change may be nested under
pub const ENVELOPE: &[&str] = &["payload", "data"];

/// First candidate key holding a present value
pub fn first_present<'a>(object: &'a Map<String, Value>, candidates: &[&str]) -> Option<&'a Value> {
    candidates
        .iter()
        .filter_map(|key| object.get(*key))
        .find(|value| is_present(value))
}

/// First candidate holding a string (trimmed, non-empty)
pub fn first_str<'a>(object: &'a Map<String, Value>, candidates: &[&str]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|key| object.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// First candidate holding an identifier, rendered as a string
///
/// Numeric ids (`user_id` is an integer column) are accepted.
pub fn first_id(object: &Map<String, Value>, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(scalar_to_string)
}

/// First candidate holding a boolean
///
/// `"true"` / `"false"` strings are accepted as well.
pub fn first_bool(object: &Map<String, Value>, candidates: &[&str]) -> Option<bool> {
    candidates
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
}

/// Look a field up in the new row first, then the old row
pub fn row_id(
    new: &Map<String, Value>,
    old: &Map<String, Value>,
    candidates: &[&str],
) -> Option<String> {
    first_id(new, candidates).or_else(|| first_id(old, candidates))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
