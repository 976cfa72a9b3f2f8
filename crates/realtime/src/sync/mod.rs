//! Applying events to checkpoints
//!
//! This module provides:
//! - [`StateSyncService`] - fetch, mutate and conditionally write one checkpoint per event
//! - [`SyncHandler`] - pluggable per-event-type mutation
//! - [`SectionStateHandler`] / [`BusinessPlanHandler`] - the built-in handlers
//! - [`RichDocument`] - editor node-tree content

mod content;
mod error;
mod handlers;
mod service;

pub use content::{to_rich_document, ContentError, RichDocument, RichNode};
pub use error::SyncError;
pub use handlers::{
    BusinessPlanHandler, SectionContent, SectionState, SectionStateHandler, SectionStatus,
    SyncHandler, BUSINESS_PLAN_CHANNEL, SECTION_STATES_CHANNEL,
};
pub use service::{ApplyOutcome, StateSyncConfig, StateSyncService};
