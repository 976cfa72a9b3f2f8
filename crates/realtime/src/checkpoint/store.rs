//! CheckpointStore trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Conditional write lost a race (optimistic locking failed)
    #[error("concurrency conflict: expected revision {expected:?}, got {actual:?}")]
    ConcurrencyConflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Backend unreachable or failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this is a lost conditional write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Persisted state of one conversation
///
/// Every channel written by a sync carries a version that grows by exactly
/// one per write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub channel_values: BTreeMap<String, Value>,

    #[serde(default)]
    pub channel_versions: BTreeMap<String, u64>,
}

impl Checkpoint {
    /// Create an empty checkpoint
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a channel
    pub fn value(&self, channel: &str) -> Option<&Value> {
        self.channel_values.get(channel)
    }

    /// Current version of a channel, 0 if never written
    pub fn version(&self, channel: &str) -> u64 {
        self.channel_versions.get(channel).copied().unwrap_or(0)
    }

    /// Increment the version of each touched channel by one
    pub fn bump_versions<S: AsRef<str>>(&mut self, touched: &[S]) {
        for channel in touched {
            *self
                .channel_versions
                .entry(channel.as_ref().to_string())
                .or_insert(0) += 1;
        }
    }
}

/// Address of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub owner_id: String,
    pub stream_key: String,
}

impl CheckpointKey {
    pub fn new(owner_id: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            stream_key: stream_key.into(),
        }
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.stream_key)
    }
}

/// A checkpoint together with its store revision
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedCheckpoint {
    pub checkpoint: Checkpoint,

    /// Store-assigned revision, grows on every write
    pub revision: u64,
}

/// Storage for checkpoints, owned by the engine that runs the conversations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch the checkpoint for `key`, if one exists
    async fn get(&self, key: &CheckpointKey) -> Result<Option<VersionedCheckpoint>, StoreError>;

    /// Unconditionally write a checkpoint, returning the new revision
    async fn put(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> Result<u64, StoreError>;

    /// Write only if the stored revision still equals `expected`
    ///
    /// `None` means the key must not exist yet. A mismatch returns
    /// [`StoreError::ConcurrencyConflict`] and leaves the store untouched.
    async fn put_if_revision(
        &self,
        key: &CheckpointKey,
        checkpoint: Checkpoint,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bump_versions_touches_only_listed_channels() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.channel_versions.insert("messages".into(), 7);

        checkpoint.bump_versions(&["section_states"]);
        checkpoint.bump_versions(&["section_states".to_string()]);

        assert_eq!(checkpoint.version("section_states"), 2);
        assert_eq!(checkpoint.version("messages"), 7);
        assert_eq!(checkpoint.version("business_plan"), 0);
    }

    #[test]
    fn test_checkpoint_deserializes_with_missing_maps() {
        let checkpoint: Checkpoint =
            serde_json::from_value(json!({"channel_values": {"a": 1}})).unwrap();
        assert_eq!(checkpoint.value("a"), Some(&json!(1)));
        assert!(checkpoint.channel_versions.is_empty());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CheckpointKey::new("42", "thread-1").to_string(), "42/thread-1");
    }

    #[test]
    fn test_conflict_classification() {
        let conflict = StoreError::ConcurrencyConflict {
            expected: Some(1),
            actual: Some(2),
        };
        assert!(conflict.is_conflict());
        assert!(!StoreError::Backend("down".into()).is_conflict());
    }
}
