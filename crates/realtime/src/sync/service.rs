// State Sync Service
//
// Applies one validated event to the checkpoint store. Each apply is a
// fetch, mutate, conditional-write cycle; a lost race refetches and runs
// the handler again on the fresh checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::error::SyncError;
use super::handlers::{BusinessPlanHandler, SectionStateHandler, SyncHandler};
use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::event::{Event, EventType};

/// State sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSyncConfig {
    /// Refetch-and-retry rounds after a conflicting write
    pub max_conflict_retries: u32,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
        }
    }
}

impl StateSyncConfig {
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}

/// Result of a successful apply
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Checkpoint written
    Applied {
        /// Channels whose version was bumped
        channels: Vec<String>,

        /// Store revision after the write
        revision: u64,
    },

    /// No handler for this event type; nothing written
    Ignored,
}

/// Applies events to checkpoints through per-type handlers
///
/// Section inserts and updates go to [`SectionStateHandler`], business plan
/// inserts and updates to [`BusinessPlanHandler`]. Deletes have no handler
/// by default and are ignored.
pub struct StateSyncService {
    store: Arc<dyn CheckpointStore>,
    handlers: RwLock<HashMap<EventType, Arc<dyn SyncHandler>>>,
    config: StateSyncConfig,
}

impl StateSyncService {
    /// Create a service with the default handlers
    pub fn new(store: Arc<dyn CheckpointStore>, config: StateSyncConfig) -> Self {
        let section: Arc<dyn SyncHandler> = Arc::new(SectionStateHandler::new());
        let plan: Arc<dyn SyncHandler> = Arc::new(BusinessPlanHandler::new());

        let mut handlers = HashMap::new();
        handlers.insert(EventType::EntityCreated, Arc::clone(&section));
        handlers.insert(EventType::EntityUpdated, section);
        handlers.insert(EventType::DocumentCreated, Arc::clone(&plan));
        handlers.insert(EventType::DocumentUpdated, plan);

        Self {
            store,
            handlers: RwLock::new(handlers),
            config,
        }
    }

    /// Configuration
    pub fn config(&self) -> &StateSyncConfig {
        &self.config
    }

    /// Install a handler, returning the one it replaces
    pub fn register_handler(
        &self,
        event_type: EventType,
        handler: Arc<dyn SyncHandler>,
    ) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.write().insert(event_type, handler)
    }

    /// Remove the handler for an event type so its events are ignored
    pub fn remove_handler(&self, event_type: EventType) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.write().remove(&event_type)
    }

    /// Whether events of this type are applied
    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.read().contains_key(&event_type)
    }

    /// Apply one event to its checkpoint
    ///
    /// A missing checkpoint is synthesized. Only the channels the handler
    /// touched get their version bumped, by exactly one.
    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.event_id,
            event_type = %event.event_type,
            stream_key = %event.stream_key,
        )
    )]
    pub async fn apply(&self, event: &Event) -> Result<ApplyOutcome, SyncError> {
        let Some(handler) = self.handler_for(event.event_type) else {
            debug!("No handler for event type, ignoring");
            return Ok(ApplyOutcome::Ignored);
        };

        let key = CheckpointKey::new(event.owner_id.clone(), event.stream_key.clone());
        let mut conflicts = 0u32;

        loop {
            let (mut checkpoint, expected) = match self.store.get(&key).await? {
                Some(current) => (current.checkpoint, Some(current.revision)),
                None => {
                    debug!(key = %key, "No checkpoint yet, starting a fresh one");
                    (Checkpoint::new(), None)
                }
            };

            let touched = handler.apply(event, &mut checkpoint.channel_values)?;
            if touched.is_empty() {
                return Ok(ApplyOutcome::Ignored);
            }
            checkpoint.bump_versions(&touched);

            match self.store.put_if_revision(&key, checkpoint, expected).await {
                Ok(revision) => {
                    info!(
                        key = %key,
                        channels = ?touched,
                        revision,
                        "Synced event into checkpoint"
                    );
                    return Ok(ApplyOutcome::Applied {
                        channels: touched,
                        revision,
                    });
                }
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.config.max_conflict_retries {
                        warn!(key = %key, conflicts, "Checkpoint kept changing, giving up");
                        return Err(SyncError::ConflictRetriesExhausted {
                            attempts: conflicts,
                        });
                    }
                    debug!(key = %key, conflicts, "Checkpoint changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handler_for(&self, event_type: EventType) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.read().get(&event_type).cloned()
    }
}
