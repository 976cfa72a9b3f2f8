//! Realtime connection layer
//!
//! This module provides:
//! - [`RealtimeTransport`] - the seam to a websocket change feed
//! - [`ConnectionManager`] - connect, filtered subscriptions and backoff reconnect
//! - [`InMemoryTransport`] - scriptable transport for tests

mod manager;
mod memory;
mod transport;

pub use manager::{ConnectionConfig, ConnectionManager, SubscriptionHandle};
pub use memory::InMemoryTransport;
pub use transport::{
    unwrap_envelope, ConnectParams, InboundMessage, InboundSink, RealtimeTransport,
    SubscriptionRequest, TransportError,
};
