//! Checkpoint storage
//!
//! The conversation engine owns its checkpoints; this module only defines
//! the interface the sync needs from it plus an in-memory store for tests.

mod memory;
mod store;

pub use memory::InMemoryCheckpointStore;
pub use store::{Checkpoint, CheckpointKey, CheckpointStore, StoreError, VersionedCheckpoint};
