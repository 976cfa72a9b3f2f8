//! In-memory transport for tests and local runs

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::Instant;

use super::transport::{
    ConnectParams, InboundSink, RealtimeTransport, SubscriptionRequest, TransportError,
};

/// In-memory implementation of [`RealtimeTransport`]
///
/// Scriptable: connects can be made to fail, tables can refuse
/// subscriptions, and the connection can be dropped from under the client.
/// Changes are injected with [`InMemoryTransport::emit`].
///
/// # Example
///
/// ```
/// use everruns_realtime::InMemoryTransport;
///
/// let transport = InMemoryTransport::new();
/// transport.fail_next_connects(2);
/// ```
#[derive(Default)]
pub struct InMemoryTransport {
    alive: AtomicBool,
    failing_connects: AtomicU32,
    refused_tables: RwLock<HashSet<String>>,
    channels: RwLock<HashMap<String, (SubscriptionRequest, InboundSink)>>,
    connect_log: Mutex<Vec<Instant>>,
    last_params: Mutex<Option<ConnectParams>>,
}

impl InMemoryTransport {
    /// Create a disconnected transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connects fail
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Refuse subscriptions to `table`
    pub fn refuse_subscriptions_to(&self, table: impl Into<String>) {
        self.refused_tables.write().insert(table.into());
    }

    /// Accept subscriptions to `table` again
    pub fn accept_subscriptions_to(&self, table: &str) {
        self.refused_tables.write().remove(table);
    }

    /// Simulate the server dropping the connection
    pub fn drop_connection(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.channels.write().clear();
    }

    /// Instants at which connects were attempted, failed ones included
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.connect_log.lock().clone()
    }

    /// Parameters of the last connect attempt
    pub fn last_params(&self) -> Option<ConnectParams> {
        self.last_params.lock().clone()
    }

    /// Names of the joined channels, sorted
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The request a channel was joined with
    pub fn subscription(&self, channel_name: &str) -> Option<SubscriptionRequest> {
        self.channels
            .read()
            .get(channel_name)
            .map(|(request, _)| request.clone())
    }

    /// Push a raw message into a joined channel
    ///
    /// Returns `false` if the channel is not joined or its consumer is gone.
    pub async fn emit(&self, channel_name: &str, raw: Value) -> bool {
        let sink = self
            .channels
            .read()
            .get(channel_name)
            .map(|(_, sink)| sink.clone());

        match sink {
            Some(sink) => sink.deliver(raw).await,
            None => false,
        }
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryTransport {
    async fn connect(&self, params: &ConnectParams) -> Result<(), TransportError> {
        self.connect_log.lock().push(Instant::now());
        *self.last_params.lock() = Some(params.clone());

        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("scripted failure".to_string()));
        }

        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
        sink: InboundSink,
    ) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected);
        }
        if self.refused_tables.read().contains(&request.table) {
            return Err(TransportError::Subscribe(format!(
                "table {} refused",
                request.table
            )));
        }

        self.channels
            .write()
            .insert(request.channel_name.clone(), (request.clone(), sink));
        Ok(())
    }

    async fn unsubscribe(&self, channel_name: &str) -> Result<(), TransportError> {
        match self.channels.write().remove(channel_name) {
            Some(_) => Ok(()),
            None => Err(TransportError::Unsubscribe(format!(
                "channel {channel_name} not joined"
            ))),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.alive.store(false, Ordering::SeqCst);
        self.channels.write().clear();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
