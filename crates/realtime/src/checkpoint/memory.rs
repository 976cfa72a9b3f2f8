//! In-memory implementation of CheckpointStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::*;

/// In-memory implementation of CheckpointStore
///
/// Primarily for tests. Revisions start at 1 and grow by one per write.
///
/// # Example
///
/// ```
/// use everruns_realtime::InMemoryCheckpointStore;
///
/// let store = InMemoryCheckpointStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<CheckpointKey, VersionedCheckpoint>>,
    writes: AtomicUsize,
    conflicts: AtomicUsize,
}

impl InMemoryCheckpointStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    /// Store a checkpoint as the owning engine would, returning its revision
    pub fn seed(&self, key: CheckpointKey, checkpoint: Checkpoint) -> u64 {
        let mut checkpoints = self.checkpoints.write();
        let revision = checkpoints.get(&key).map_or(0, |c| c.revision) + 1;
        checkpoints.insert(
            key,
            VersionedCheckpoint {
                checkpoint,
                revision,
            },
        );
        revision
    }

    /// Current checkpoint for `key`
    pub fn snapshot(&self, key: &CheckpointKey) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .get(key)
            .map(|c| c.checkpoint.clone())
    }

    /// Current revision for `key`
    pub fn revision(&self, key: &CheckpointKey) -> Option<u64> {
        self.checkpoints.read().get(key).map(|c| c.revision)
    }

    /// Get the number of stored checkpoints
    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    /// Whether no checkpoint is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of successful writes through the trait
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Get the number of rejected conditional writes
    pub fn conflict_count(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.checkpoints.write().clear();
        self.writes.store(0, Ordering::SeqCst);
        self.conflicts.store(0, Ordering::SeqCst);
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &CheckpointKey) -> Result<Option<VersionedCheckpoint>, StoreError> {
        Ok(self.checkpoints.read().get(key).cloned())
    }

    async fn put(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> Result<u64, StoreError> {
        let revision = self.seed(key.clone(), checkpoint);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }

    async fn put_if_revision(
        &self,
        key: &CheckpointKey,
        checkpoint: Checkpoint,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut checkpoints = self.checkpoints.write();
        let actual = checkpoints.get(key).map(|c| c.revision);

        if actual != expected {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::ConcurrencyConflict { expected, actual });
        }

        let revision = actual.unwrap_or(0) + 1;
        checkpoints.insert(
            key.clone(),
            VersionedCheckpoint {
                checkpoint,
                revision,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }
}
