//! Change events and their processing
//!
//! This module provides:
//! - [`Event`] / [`EventType`] - typed row changes for one thread
//! - [`aliases`] - the ordered key candidates tried when reading wire payloads
//! - [`DedupCache`] - bounded, time-bucketed memory of seen event ids
//! - [`EventProcessor`] - parse, validate, deduplicate and order events per thread

pub mod aliases;
mod dedup;
mod processor;
mod types;

pub use dedup::{DedupCache, DedupConfig};
pub use processor::{EventProcessor, ParseError};
pub use types::{Event, EventPayload, EventType, Operation};
