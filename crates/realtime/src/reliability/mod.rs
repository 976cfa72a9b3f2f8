//! Reliability patterns for the realtime sync
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff for reconnects and redelivery

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::RetryPolicy;
