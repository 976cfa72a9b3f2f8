//! Sync worker
//!
//! This module provides:
//! - [`SyncWorker`] - subscription lifecycle, intake, polling and connection supervision
//! - [`SyncWorkerConfig`] - worker settings, loadable from the environment
//! - [`DeadLetterQueue`] - events whose deliveries ran out
//! - [`WorkerStats`] / [`TickReport`] - counters

mod config;
mod dead_letter;
mod stats;
mod sync_worker;

pub use config::{SyncWorkerConfig, DEFAULT_AGENT_KIND};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use stats::{TickReport, WorkerStats};
pub use sync_worker::{StreamSubscription, SyncWorker, SyncWorkerError, WorkerStatus};
