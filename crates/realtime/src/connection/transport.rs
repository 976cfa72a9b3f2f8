//! Transport abstraction for the realtime change feed

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::aliases;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// Operation requires an open connection
    #[error("not connected")]
    NotConnected,

    /// Server rejected or failed the subscription
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// Channel could not be left cleanly
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
}

/// Resolved endpoint and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Websocket endpoint, e.g. `wss://<project>/realtime/v1`
    pub url: String,

    /// API key sent as the access token
    pub token: String,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A filtered row-change subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Unique channel name, `<table>:<stream_key>`
    pub channel_name: String,

    pub schema: String,
    pub table: String,

    /// Row events to receive (`*` for all)
    pub event: String,

    /// Server-side filter, `<column>=eq.<stream_key>`
    pub filter: String,
}

/// One raw change as received from the transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Channel the change arrived on
    pub channel_name: String,

    /// The change itself, with any client envelope removed
    pub payload: Value,

    pub received_at: DateTime<Utc>,
}

/// Where a transport pushes changes for one subscription
///
/// Backed by a bounded channel: when the consumer falls behind, `deliver`
/// waits, pushing backpressure onto the connection.
#[derive(Debug, Clone)]
pub struct InboundSink {
    channel_name: String,
    tx: mpsc::Sender<InboundMessage>,
}

impl InboundSink {
    /// Create a sink for one channel
    pub fn new(channel_name: impl Into<String>, tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            channel_name: channel_name.into(),
            tx,
        }
    }

    /// Channel this sink belongs to
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Unwrap and forward a raw message
    ///
    /// Returns `false` once the consumer is gone.
    pub async fn deliver(&self, raw: Value) -> bool {
        let message = InboundMessage {
            channel_name: self.channel_name.clone(),
            payload: unwrap_envelope(raw),
            received_at: Utc::now(),
        };

        if self.tx.send(message).await.is_err() {
            debug!(channel = %self.channel_name, "Intake closed, dropping message");
            return false;
        }
        true
    }
}

/// Strip the client-library envelope from a raw message
///
/// Depending on the client version the change sits under `payload` or
/// `data`; anything else is taken as the change itself.
pub fn unwrap_envelope(raw: Value) -> Value {
    let Value::Object(mut map) = raw else {
        return raw;
    };

    let nested = aliases::ENVELOPE
        .iter()
        .find(|key| map.get(**key).is_some_and(Value::is_object))
        .and_then(|key| map.remove(*key));

    nested.unwrap_or(Value::Object(map))
}

/// Persistent connection to the change feed
///
/// Implementations own the socket and its event loop and push every
/// received change into the [`InboundSink`] handed over at subscribe time.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open the connection
    async fn connect(&self, params: &ConnectParams) -> Result<(), TransportError>;

    /// Join a channel and start delivering its changes to `sink`
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
        sink: InboundSink,
    ) -> Result<(), TransportError>;

    /// Leave a channel
    async fn unsubscribe(&self, channel_name: &str) -> Result<(), TransportError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Whether the underlying connection is still up
    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_payload_envelope() {
        let raw = json!({"payload": {"table": "t"}, "ids": [1]});
        assert_eq!(unwrap_envelope(raw), json!({"table": "t"}));
    }

    #[test]
    fn test_unwrap_data_envelope() {
        let raw = json!({"data": {"table": "t"}});
        assert_eq!(unwrap_envelope(raw), json!({"table": "t"}));
    }

    #[test]
    fn test_payload_wins_over_data() {
        let raw = json!({"data": {"table": "b"}, "payload": {"table": "a"}});
        assert_eq!(unwrap_envelope(raw), json!({"table": "a"}));
    }

    #[test]
    fn test_unwrapped_message_passes_through() {
        let raw = json!({"table": "t", "type": "UPDATE"});
        assert_eq!(unwrap_envelope(raw.clone()), raw);

        let scalar_data = json!({"table": "t", "data": "not a change"});
        assert_eq!(unwrap_envelope(scalar_data.clone()), scalar_data);
    }

    #[tokio::test]
    async fn test_sink_delivers_until_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = InboundSink::new("section_states:t", tx);

        assert!(sink.deliver(json!({"data": {"table": "x"}})).await);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel_name, "section_states:t");
        assert_eq!(message.payload, json!({"table": "x"}));

        drop(rx);
        assert!(!sink.deliver(json!({})).await);
    }

    #[test]
    fn test_params_debug_redacts_token() {
        let params = ConnectParams {
            url: "wss://x/realtime/v1".into(),
            token: "secret".into(),
        };
        assert!(!format!("{params:?}").contains("secret"));
    }
}
