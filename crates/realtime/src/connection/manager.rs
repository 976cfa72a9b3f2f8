// Connection Manager
//
// Owns the realtime connection, the registry of joined channels and the
// reconnect schedule. Reconnecting never restores subscriptions; callers
// that track streams re-subscribe after a successful reconnect.

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::transport::{
    ConnectParams, InboundMessage, InboundSink, RealtimeTransport, SubscriptionRequest,
};
use crate::reliability::RetryPolicy;
use crate::tables::{ChannelKind, TableConfig};

/// Connection configuration
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub project_url: String,

    /// Anonymous API key
    pub api_key: String,

    /// Watched tables
    pub tables: TableConfig,

    /// Reconnect schedule
    pub reconnect: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            project_url: String::new(),
            api_key: String::new(),
            tables: TableConfig::default(),
            reconnect: RetryPolicy::reconnect(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("project_url", &self.project_url)
            .field("api_key", &"<redacted>")
            .field("tables", &self.tables)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create a configuration for a project
    pub fn new(project_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            project_url: project_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SUPABASE_URL`: Project URL
    /// - `SUPABASE_ANON_KEY`: Anonymous API key
    ///
    /// Missing variables leave the field empty; [`ConnectionManager::connect`]
    /// then refuses to connect.
    pub fn from_env() -> Self {
        Self::new(
            env::var("SUPABASE_URL").unwrap_or_default(),
            env::var("SUPABASE_ANON_KEY").unwrap_or_default(),
        )
    }

    /// Set the watched tables
    pub fn with_tables(mut self, tables: TableConfig) -> Self {
        self.tables = tables;
        self
    }

    /// Set the reconnect schedule
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Whether both URL and key are set
    pub fn has_credentials(&self) -> bool {
        !self.project_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    /// Websocket endpoint derived from the project URL
    pub fn realtime_url(&self) -> String {
        let host = self
            .project_url
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("wss://{host}/realtime/v1")
    }
}

/// A joined channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Channel name, `<table>:<stream_key>`
    pub channel_name: String,
    pub stream_key: String,
    pub kind: ChannelKind,

    /// Distinguishes this join from earlier joins of the same channel
    pub id: Uuid,
}

/// Manages the realtime connection and its channels
pub struct ConnectionManager {
    transport: Arc<dyn RealtimeTransport>,
    config: ConnectionConfig,
    connected: AtomicBool,
    channels: RwLock<HashMap<String, SubscriptionHandle>>,
    reconnect_attempts: AtomicU32,
    exhausted: AtomicBool,
    reconnect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Create a disconnected manager
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            connected: AtomicBool::new(false),
            channels: RwLock::new(HashMap::new()),
            reconnect_attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            reconnect_lock: Mutex::new(()),
        }
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Watched tables
    pub fn tables(&self) -> &TableConfig {
        &self.config.tables
    }

    /// Open the connection
    ///
    /// A successful connect resets the reconnect schedule.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> bool {
        if !self.config.has_credentials() {
            error!("Realtime credentials not configured, cannot connect");
            return false;
        }

        let params = ConnectParams {
            url: self.config.realtime_url(),
            token: self.config.api_key.clone(),
        };

        match self.transport.connect(&params).await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.exhausted.store(false, Ordering::SeqCst);
                info!(url = %params.url, "Connected to realtime");
                true
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                error!(error = %e, "Failed to connect to realtime");
                false
            }
        }
    }

    /// Whether the connection is up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.transport.is_alive()
    }

    /// Whether every reconnect attempt has been used up
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Reconnect attempts made since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of joined channels
    pub fn subscription_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Names of joined channels, sorted
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Join the channel for one stream and table kind
    ///
    /// Changes are delivered into `tx`. An existing join of the same
    /// channel is replaced. Returns `None` when not connected or when the
    /// transport rejects the join.
    #[instrument(skip_all, fields(stream_key = %stream_key, kind = %kind))]
    pub async fn subscribe(
        &self,
        stream_key: &str,
        kind: ChannelKind,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Option<SubscriptionHandle> {
        if !self.is_connected() {
            warn!("Not connected, cannot subscribe");
            return None;
        }

        let tables = &self.config.tables;
        let channel_name = tables.channel_name(kind, stream_key);

        if self.channels.read().contains_key(&channel_name) {
            debug!(channel = %channel_name, "Replacing existing subscription");
            self.unsubscribe_channel(&channel_name).await;
        }

        let request = SubscriptionRequest {
            channel_name: channel_name.clone(),
            schema: tables.schema.clone(),
            table: tables.table_for(kind).to_string(),
            event: "*".to_string(),
            filter: tables.stream_filter(stream_key),
        };
        let sink = InboundSink::new(channel_name.clone(), tx);

        if let Err(e) = self.transport.subscribe(&request, sink).await {
            error!(channel = %channel_name, error = %e, "Failed to subscribe");
            return None;
        }

        let handle = SubscriptionHandle {
            channel_name: channel_name.clone(),
            stream_key: stream_key.to_string(),
            kind,
            id: Uuid::now_v7(),
        };
        self.channels.write().insert(channel_name, handle.clone());

        info!(channel = %handle.channel_name, filter = %request.filter, "Subscribed");
        Some(handle)
    }

    /// Leave a channel
    ///
    /// A handle from an earlier join that has since been replaced is
    /// rejected so it cannot tear down the newer subscription.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let current = self
            .channels
            .read()
            .get(&handle.channel_name)
            .map(|registered| registered.id);

        match current {
            Some(id) if id == handle.id => self.unsubscribe_channel(&handle.channel_name).await,
            Some(_) => {
                warn!(channel = %handle.channel_name, "Stale subscription handle");
                false
            }
            None => false,
        }
    }

    /// Leave a channel by name
    pub async fn unsubscribe_channel(&self, channel_name: &str) -> bool {
        match self.transport.unsubscribe(channel_name).await {
            Ok(()) => {
                self.channels.write().remove(channel_name);
                info!(channel = %channel_name, "Unsubscribed");
                true
            }
            Err(e) => {
                error!(channel = %channel_name, error = %e, "Failed to unsubscribe");
                false
            }
        }
    }

    /// Leave every channel and close the connection
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let names: Vec<String> = self.channels.read().keys().cloned().collect();
        join_all(names.iter().map(|name| self.unsubscribe_channel(name))).await;
        // A dead connection can fail the unsubscribes; the channels are gone either way
        self.channels.write().clear();

        if let Err(e) = self.transport.disconnect().await {
            error!(error = %e, "Error while disconnecting");
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from realtime");
    }

    /// Reconnect following the backoff schedule
    ///
    /// Each attempt waits for its delay, tears the connection down and
    /// connects again. Once `max_attempts` attempts have failed the manager
    /// is exhausted and this returns `false` until a successful
    /// [`connect`](Self::connect). Concurrent callers are serialized.
    pub async fn reconnect(&self) -> bool {
        let _guard = self.reconnect_lock.lock().await;
        let policy = &self.config.reconnect;

        loop {
            if self.is_exhausted() {
                error!("Reconnect attempts exhausted");
                return false;
            }

            let attempt = self.reconnect_attempts.load(Ordering::SeqCst) + 1;
            if attempt > policy.max_attempts {
                self.exhausted.store(true, Ordering::SeqCst);
                error!(
                    max_attempts = policy.max_attempts,
                    "Max reconnection attempts reached, giving up"
                );
                return false;
            }
            self.reconnect_attempts.store(attempt, Ordering::SeqCst);

            let delay = policy.delay_for_retry(attempt);
            info!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to realtime"
            );
            tokio::time::sleep(delay).await;

            self.disconnect().await;
            if self.connect().await {
                info!(attempt, "Reconnected, subscriptions must be re-established");
                return true;
            }
            warn!(attempt, "Reconnect attempt failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InMemoryTransport;
    use std::time::Duration;

    fn manager(transport: Arc<InMemoryTransport>) -> ConnectionManager {
        ConnectionManager::new(
            transport,
            ConnectionConfig::new("https://abc.supabase.co", "anon-key"),
        )
    }

    #[test]
    fn test_realtime_url() {
        let config = ConnectionConfig::new("https://abc.supabase.co/", "k");
        assert_eq!(config.realtime_url(), "wss://abc.supabase.co/realtime/v1");

        let bare = ConnectionConfig::new("abc.supabase.co", "k");
        assert_eq!(bare.realtime_url(), "wss://abc.supabase.co/realtime/v1");
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = ConnectionConfig::new("https://abc.supabase.co", "anon-key");
        assert!(!format!("{config:?}").contains("anon-key"));
    }

    #[tokio::test]
    async fn test_connect_requires_credentials() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default());

        assert!(!manager.connect().await);
        assert!(!manager.is_connected());
        assert!(transport.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_connect_passes_endpoint_and_token() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport.clone());

        assert!(manager.connect().await);
        assert!(manager.is_connected());

        let params = transport.last_params().unwrap();
        assert_eq!(params.url, "wss://abc.supabase.co/realtime/v1");
        assert_eq!(params.token, "anon-key");
    }

    #[tokio::test]
    async fn test_subscribe_builds_filtered_request() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect().await;

        let (tx, _rx) = mpsc::channel(8);
        let handle = manager
            .subscribe("thread-1", ChannelKind::Entity, tx)
            .await
            .unwrap();

        assert_eq!(handle.channel_name, "section_states:thread-1");
        let request = transport.subscription("section_states:thread-1").unwrap();
        assert_eq!(request.schema, "public");
        assert_eq!(request.table, "section_states");
        assert_eq!(request.event, "*");
        assert_eq!(request.filter, "thread_id=eq.thread-1");
        assert_eq!(manager.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport);

        let (tx, _rx) = mpsc::channel(8);
        assert!(manager
            .subscribe("thread-1", ChannelKind::Entity, tx)
            .await
            .is_none());
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_channel() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect().await;

        let (tx, _rx) = mpsc::channel(8);
        let first = manager
            .subscribe("thread-1", ChannelKind::Document, tx.clone())
            .await
            .unwrap();
        let second = manager
            .subscribe("thread-1", ChannelKind::Document, tx)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(transport.channel_names(), vec!["business_plans:thread-1"]);

        // The replaced handle cannot remove the live join
        assert!(!manager.unsubscribe(&first).await);
        assert!(manager.unsubscribe(&second).await);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_clears_channels() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect().await;

        let (tx, _rx) = mpsc::channel(8);
        for kind in ChannelKind::ALL {
            manager.subscribe("thread-1", kind, tx.clone()).await.unwrap();
        }
        assert_eq!(manager.subscription_count(), 2);

        manager.disconnect().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.subscription_count(), 0);
        assert!(transport.channel_names().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_disconnected() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect().await;

        transport.drop_connection();
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhausts_then_connect_resets() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = ConnectionManager::new(
            transport.clone(),
            ConnectionConfig::new("https://abc.supabase.co", "anon-key")
                .with_reconnect_policy(RetryPolicy::reconnect().with_max_attempts(3)),
        );

        transport.fail_next_connects(10);
        assert!(!manager.reconnect().await);
        assert!(manager.is_exhausted());
        assert_eq!(transport.connect_attempts().len(), 3);

        // Exhausted: no further attempts are made
        assert!(!manager.reconnect().await);
        assert_eq!(transport.connect_attempts().len(), 3);

        transport.fail_next_connects(0);
        assert!(manager.connect().await);
        assert!(!manager.is_exhausted());
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_follows_backoff() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(transport.clone());

        transport.fail_next_connects(2);
        let started = tokio::time::Instant::now();
        assert!(manager.reconnect().await);

        let offsets: Vec<Duration> = transport
            .connect_attempts()
            .iter()
            .map(|at| *at - started)
            .collect();
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(7)
            ]
        );
        assert_eq!(manager.reconnect_attempts(), 0);
    }
}
