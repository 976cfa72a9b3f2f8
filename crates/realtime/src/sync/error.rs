//! Sync error types

use super::content::ContentError;
use crate::checkpoint::StoreError;

/// Error applying an event to a checkpoint
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Checkpoint store failed
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    /// Every conditional write lost to a concurrent writer
    #[error("gave up after {attempts} conflicting checkpoint writes")]
    ConflictRetriesExhausted { attempts: u32 },

    /// Row carried no content to sync
    #[error("event {event_id} has no content")]
    MissingContent { event_id: String },

    /// Entity event without an entity id
    #[error("event {event_id} has no entity id")]
    MissingEntity { event_id: String },

    /// Entity id outside the known catalog
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Content could not be converted
    #[error(transparent)]
    Content(#[from] ContentError),

    /// Checkpoint channel holds something other than what the handler owns
    #[error("channel {channel} has unexpected shape: {reason}")]
    UnexpectedShape { channel: String, reason: String },
}

impl SyncError {
    /// Whether a later attempt could succeed
    ///
    /// Store outages and lost races are transient; content problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(StoreError::Serialization(_)) => false,
            Self::Store(_) | Self::ConflictRetriesExhausted { .. } => true,
            Self::MissingContent { .. }
            | Self::MissingEntity { .. }
            | Self::UnknownEntity(_)
            | Self::Content(_)
            | Self::UnexpectedShape { .. } => false,
        }
    }
}
