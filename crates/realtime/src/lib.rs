//! # Realtime State Sync
//!
//! Change-data-capture consumer that keeps a conversation engine's
//! checkpoints consistent with edits made directly against its backing
//! tables by another actor.
//!
//! ## Features
//!
//! - **Filtered subscriptions**: one entity and one document channel per thread
//! - **Bounded reconnect**: exponential backoff from 1s to 60s over 10 attempts
//! - **Idempotent intake**: replayed changes are dropped by a time-bucketed dedup cache
//! - **Per-thread ordering**: events reach the checkpoint in timestamp order
//! - **Conditional writes**: checkpoint updates retry on concurrent modification
//! - **Redelivery**: transient apply failures are retried, then dead-lettered
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                         │
//! │  (websocket transport, filtered channels, backoff reconnect) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  bounded mpsc
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     EventProcessor                           │
//! │  (parse, validate, dedup, per-thread timestamp queues)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  SyncWorker poll loop
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StateSyncService                          │
//! │  (handlers mutate channels, compare-and-swap checkpoint)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use everruns_realtime::prelude::*;
//!
//! let transport = Arc::new(MyWebsocketTransport::new());
//! let store: Arc<dyn CheckpointStore> = engine.checkpoint_store();
//!
//! let worker = SyncWorker::new(SyncWorkerConfig::from_env(), transport, store);
//! worker.start().await?;
//! worker.subscribe_to_stream("42", "thread-1", None).await?;
//! ```

pub mod checkpoint;
pub mod connection;
pub mod event;
pub mod reliability;
pub mod sync;
pub mod tables;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::checkpoint::{
        Checkpoint, CheckpointKey, CheckpointStore, InMemoryCheckpointStore, StoreError,
    };
    pub use crate::connection::{
        ConnectionConfig, ConnectionManager, InMemoryTransport, InboundSink, RealtimeTransport,
        TransportError,
    };
    pub use crate::event::{Event, EventProcessor, EventType};
    pub use crate::reliability::RetryPolicy;
    pub use crate::sync::{ApplyOutcome, StateSyncService, SyncError, SyncHandler};
    pub use crate::tables::{ChannelKind, TableConfig};
    pub use crate::worker::{SyncWorker, SyncWorkerConfig, SyncWorkerError};
}

// Re-export key types at crate root
pub use checkpoint::{
    Checkpoint, CheckpointKey, CheckpointStore, InMemoryCheckpointStore, StoreError,
    VersionedCheckpoint,
};
pub use connection::{
    ConnectParams, ConnectionConfig, ConnectionManager, InMemoryTransport, InboundMessage,
    InboundSink, RealtimeTransport, SubscriptionHandle, SubscriptionRequest, TransportError,
};
pub use event::{DedupCache, DedupConfig, Event, EventPayload, EventProcessor, EventType, Operation};
pub use reliability::RetryPolicy;
pub use sync::{
    ApplyOutcome, BusinessPlanHandler, RichDocument, SectionStateHandler, SectionStatus,
    StateSyncConfig, StateSyncService, SyncError, SyncHandler,
};
pub use tables::{ChannelKind, TableConfig};
pub use worker::{
    DeadLetter, DeadLetterQueue, StreamSubscription, SyncWorker, SyncWorkerConfig,
    SyncWorkerError, TickReport, WorkerStats, WorkerStatus,
};
