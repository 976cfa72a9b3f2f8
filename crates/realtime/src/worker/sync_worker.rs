// Sync Worker
//
// Wires the connection, the event processor and the state sync together.
// Three background loops run while the worker is up:
// - intake: drains the bounded channel fed by the transport into the processor
// - poll: every poll interval, applies at most one event per tracked stream
// - supervisor: reconnects a lost connection and re-opens tracked streams

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::config::SyncWorkerConfig;
use super::dead_letter::{DeadLetter, DeadLetterQueue};
use super::stats::{StatsCounters, TickReport, WorkerStats};
use crate::checkpoint::CheckpointStore;
use crate::connection::{ConnectionManager, InboundMessage, RealtimeTransport, SubscriptionHandle};
use crate::event::{Event, EventProcessor};
use crate::sync::{ApplyOutcome, StateSyncService, SyncError};
use crate::tables::ChannelKind;

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Not running
    Stopped,
    /// Connecting
    Starting,
    /// Connected and processing
    Running,
    /// Shutting down loops and subscriptions
    Stopping,
}

/// Sync worker errors
#[derive(Debug, thiserror::Error)]
pub enum SyncWorkerError {
    /// Feature toggle is off
    #[error("realtime sync is disabled")]
    Disabled,

    /// Initial connect failed
    #[error("failed to connect to realtime")]
    ConnectionFailed,

    /// Operation needs a running worker
    #[error("sync worker is not running")]
    NotRunning,

    /// One of the stream's channels could not be opened
    #[error("failed to subscribe to stream {0}")]
    SubscriptionFailed(String),
}

/// A tracked stream and its two channels
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub owner_id: String,
    pub stream_key: String,
    pub agent_kind: String,
    pub entity: SubscriptionHandle,
    pub document: SubscriptionHandle,
    pub subscribed_at: DateTime<Utc>,
}

struct Shared {
    config: SyncWorkerConfig,
    connection: ConnectionManager,
    processor: EventProcessor,
    sync: StateSyncService,
    dead_letters: DeadLetterQueue,
    stats: StatsCounters,
    streams: RwLock<BTreeMap<String, StreamSubscription>>,
    subscribe_lock: Mutex<()>,
    /// Held shared while an event is routed to a queue, exclusive while a
    /// stream is untracked and its queue cleared
    routing: tokio::sync::RwLock<()>,
    intake_tx: mpsc::Sender<InboundMessage>,
}

/// Keeps checkpoints in sync with edits made to the watched tables
///
/// # Example
///
/// ```ignore
/// use everruns_realtime::{SyncWorker, SyncWorkerConfig};
///
/// let worker = SyncWorker::new(SyncWorkerConfig::from_env(), transport, store);
/// worker.start().await?;
/// worker.subscribe_to_stream("42", "thread-1", None).await?;
///
/// // ... later
/// worker.stop().await;
/// ```
pub struct SyncWorker {
    shared: Arc<Shared>,
    status: RwLock<WorkerStatus>,
    lifecycle: Mutex<()>,
    intake_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Create a stopped worker
    pub fn new(
        config: SyncWorkerConfig,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Shared {
            connection: ConnectionManager::new(transport, config.connection.clone()),
            processor: EventProcessor::new(config.connection.tables.clone(), config.dedup.clone()),
            sync: StateSyncService::new(store, config.sync.clone()),
            dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
            stats: StatsCounters::default(),
            streams: RwLock::new(BTreeMap::new()),
            subscribe_lock: Mutex::new(()),
            routing: tokio::sync::RwLock::new(()),
            intake_tx,
            config,
        };

        Self {
            shared: Arc::new(shared),
            status: RwLock::new(WorkerStatus::Stopped),
            lifecycle: Mutex::new(()),
            intake_rx: Arc::new(Mutex::new(intake_rx)),
            shutdown_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Connect and launch the background loops
    ///
    /// Already running is not an error. A worker whose reconnect attempts
    /// ran out is restarted: its loops are replaced, the connection is
    /// opened again and every tracked stream is re-subscribed.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SyncWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;

        let restarting = match self.status() {
            WorkerStatus::Running if !self.shared.connection.is_exhausted() => {
                debug!("Sync worker already running");
                return Ok(());
            }
            WorkerStatus::Running => true,
            _ => false,
        };

        if !self.shared.config.enabled {
            warn!("Realtime sync is disabled, worker will not start");
            return Err(SyncWorkerError::Disabled);
        }

        if restarting {
            warn!("Restarting sync worker after exhausted reconnects");
            self.join_loops().await;
            self.shared.connection.disconnect().await;
        }

        *self.status.write() = WorkerStatus::Starting;
        if !self.shared.connection.connect().await {
            *self.status.write() = WorkerStatus::Stopped;
            error!("Failed to connect, sync worker not started");
            return Err(SyncWorkerError::ConnectionFailed);
        }
        // Streams survive a failed restart, so any start may find some
        if self.subscription_count() > 0 {
            self.shared.resubscribe_all().await;
        }

        self.shutdown_tx.send_replace(false);
        let handles = vec![
            self.spawn_intake_loop(),
            self.spawn_poll_loop(),
            self.spawn_supervisor_loop(),
        ];
        *self.handles.lock() = handles;

        *self.status.write() = WorkerStatus::Running;
        info!(
            poll_interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            "Sync worker started"
        );
        Ok(())
    }

    /// Stop the loops, drop every stream and disconnect
    ///
    /// An apply already in flight is allowed to finish until the shutdown
    /// timeout, after which the loops are aborted.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() == WorkerStatus::Stopped {
            return;
        }

        *self.status.write() = WorkerStatus::Stopping;
        self.join_loops().await;

        let streams: Vec<String> = self.shared.streams.read().keys().cloned().collect();
        for stream_key in streams {
            self.shared.unsubscribe_stream(&stream_key).await;
        }
        self.shared.connection.disconnect().await;

        *self.status.write() = WorkerStatus::Stopped;
        info!("Sync worker stopped");
    }

    /// Start receiving changes for a stream
    ///
    /// Opens both the entity and the document channel. If either fails the
    /// other is closed again and the stream is not tracked. Subscribing a
    /// tracked stream is a no-op.
    #[instrument(skip_all, fields(owner_id = %owner_id, stream_key = %stream_key))]
    pub async fn subscribe_to_stream(
        &self,
        owner_id: &str,
        stream_key: &str,
        agent_kind: Option<&str>,
    ) -> Result<(), SyncWorkerError> {
        if self.status() != WorkerStatus::Running {
            error!("Sync worker not running, cannot subscribe");
            return Err(SyncWorkerError::NotRunning);
        }

        let agent_kind = agent_kind.unwrap_or(&self.shared.config.default_agent);
        self.shared
            .subscribe_stream(owner_id, stream_key, agent_kind)
            .await
    }

    /// Stop receiving changes for a stream and drop its pending events
    ///
    /// Returns `false` if the stream was not tracked.
    pub async fn unsubscribe_from_stream(&self, stream_key: &str) -> bool {
        self.shared.unsubscribe_stream(stream_key).await
    }

    /// Route one raw change as if it arrived from the connection
    ///
    /// Returns `true` if the change was queued.
    pub async fn ingest(&self, payload: Value) -> bool {
        self.shared
            .ingest(InboundMessage {
                channel_name: String::new(),
                payload,
                received_at: Utc::now(),
            })
            .await
    }

    /// Run one polling pass
    pub async fn tick(&self) -> TickReport {
        self.shared.tick().await
    }

    /// Put every dead letter back on its stream's queue
    ///
    /// Letters for streams that are no longer tracked are dropped. Returns
    /// how many were requeued.
    pub async fn redrive_dead_letters(&self) -> usize {
        let mut requeued = 0;
        for letter in self.shared.dead_letters.drain() {
            let mut event = letter.event;
            let _routing = self.shared.routing.read().await;
            if !self.shared.is_tracked(&event.stream_key) {
                debug!(event_id = %event.event_id, "Stream no longer tracked, dropping dead letter");
                continue;
            }
            event.attempt = 0;
            event.not_before = None;
            self.shared.processor.requeue(event).await;
            requeued += 1;
        }
        info!(requeued, "Redrove dead letters");
        requeued
    }

    /// Running with a live connection
    pub fn health_check(&self) -> bool {
        self.status() == WorkerStatus::Running && self.shared.connection.is_connected()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.snapshot()
    }

    /// Number of tracked streams
    pub fn subscription_count(&self) -> usize {
        self.shared.streams.read().len()
    }

    /// Tracked streams, ordered by stream key
    pub fn subscriptions(&self) -> Vec<StreamSubscription> {
        self.shared.streams.read().values().cloned().collect()
    }

    pub fn config(&self) -> &SyncWorkerConfig {
        &self.shared.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.connection
    }

    pub fn processor(&self) -> &EventProcessor {
        &self.shared.processor
    }

    pub fn sync_service(&self) -> &StateSyncService {
        &self.shared.sync
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.shared.dead_letters
    }

    /// Signal shutdown and wait for the background loops
    async fn join_loops(&self) {
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for mut handle in handles {
            let finished =
                tokio::time::timeout(self.shared.config.shutdown_timeout, &mut handle).await;
            if finished.is_err() {
                warn!("Background loop did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn spawn_intake_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let intake_rx = Arc::clone(&self.intake_rx);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut intake_rx = intake_rx.lock().await;
            loop {
                tokio::select! {
                    message = intake_rx.recv() => match message {
                        Some(message) => {
                            shared.ingest(message).await;
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        debug!("Intake loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("Intake loop exited");
        })
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("Poll loop: shutdown requested");
                        break;
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                shared.tick().await;
            }
            debug!("Poll loop exited");
        })
    }

    fn spawn_supervisor_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.supervise_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        debug!("Supervisor loop: shutdown requested");
                        break;
                    }
                }
                if shared.connection.is_connected() {
                    continue;
                }

                warn!("Realtime connection lost, reconnecting");
                let reconnected = tokio::select! {
                    ok = shared.connection.reconnect() => ok,
                    _ = shutdown_rx.changed() => break,
                };

                if reconnected {
                    shared.resubscribe_all().await;
                } else {
                    error!("Reconnect attempts exhausted, realtime sync halted until start() is called");
                    break;
                }
            }
            debug!("Supervisor loop exited");
        })
    }
}

impl Shared {
    fn is_tracked(&self, stream_key: &str) -> bool {
        self.streams.read().contains_key(stream_key)
    }

    async fn subscribe_stream(
        &self,
        owner_id: &str,
        stream_key: &str,
        agent_kind: &str,
    ) -> Result<(), SyncWorkerError> {
        let _guard = self.subscribe_lock.lock().await;
        if self.is_tracked(stream_key) {
            debug!(stream_key, "Already subscribed to stream");
            return Ok(());
        }

        let (entity, document) = self.open_channels(stream_key).await?;
        let subscription = StreamSubscription {
            owner_id: owner_id.to_string(),
            stream_key: stream_key.to_string(),
            agent_kind: agent_kind.to_string(),
            entity,
            document,
            subscribed_at: Utc::now(),
        };
        info!(
            stream_key,
            owner_id,
            agent_kind,
            entity_channel = %subscription.entity.channel_name,
            document_channel = %subscription.document.channel_name,
            "Subscribed to stream"
        );
        self.streams
            .write()
            .insert(stream_key.to_string(), subscription);
        Ok(())
    }

    /// Open both channels for a stream, or neither
    async fn open_channels(
        &self,
        stream_key: &str,
    ) -> Result<(SubscriptionHandle, SubscriptionHandle), SyncWorkerError> {
        let entity = self
            .connection
            .subscribe(stream_key, ChannelKind::Entity, self.intake_tx.clone())
            .await;
        let document = self
            .connection
            .subscribe(stream_key, ChannelKind::Document, self.intake_tx.clone())
            .await;

        match (entity, document) {
            (Some(entity), Some(document)) => Ok((entity, document)),
            (entity, document) => {
                for handle in entity.iter().chain(document.iter()) {
                    self.connection.unsubscribe(handle).await;
                }
                error!(stream_key, "Failed to open both channels for stream");
                Err(SyncWorkerError::SubscriptionFailed(stream_key.to_string()))
            }
        }
    }

    async fn unsubscribe_stream(&self, stream_key: &str) -> bool {
        let _guard = self.subscribe_lock.lock().await;
        let Some(subscription) = self.forget_stream(stream_key).await else {
            debug!(stream_key, "Not subscribed to stream");
            return false;
        };

        self.connection.unsubscribe(&subscription.entity).await;
        self.connection.unsubscribe(&subscription.document).await;

        info!(stream_key, "Unsubscribed from stream");
        true
    }

    /// Untrack a stream and drop whatever is queued for it
    ///
    /// No event can be routed to the stream between the two steps.
    async fn forget_stream(&self, stream_key: &str) -> Option<StreamSubscription> {
        let _routing = self.routing.write().await;
        let subscription = self.streams.write().remove(stream_key)?;
        self.processor.clear_queue(stream_key).await;
        Some(subscription)
    }

    /// Re-open channels for every tracked stream after a reconnect
    async fn resubscribe_all(&self) {
        let _guard = self.subscribe_lock.lock().await;
        let streams: Vec<String> = self.streams.read().keys().cloned().collect();
        let mut restored = 0usize;

        for stream_key in streams {
            match self.open_channels(&stream_key).await {
                Ok((entity, document)) => {
                    if let Some(subscription) = self.streams.write().get_mut(&stream_key) {
                        subscription.entity = entity;
                        subscription.document = document;
                    }
                    restored += 1;
                }
                Err(e) => {
                    error!(stream_key = %stream_key, error = %e, "Dropping stream after reconnect");
                    self.forget_stream(&stream_key).await;
                }
            }
        }
        info!(restored, "Re-established stream subscriptions");
    }

    async fn ingest(&self, message: InboundMessage) -> bool {
        StatsCounters::incr(&self.stats.received);

        let Some(event) = self
            .processor
            .parse_payload_at(&message.payload, message.received_at)
        else {
            StatsCounters::incr(&self.stats.unparsed);
            return false;
        };

        let _routing = self.routing.read().await;
        if !self.is_tracked(&event.stream_key) {
            debug!(
                stream_key = %event.stream_key,
                event_id = %event.event_id,
                "No subscription for stream, dropping event"
            );
            StatsCounters::incr(&self.stats.unrouted);
            return false;
        }

        if self.processor.add_event(event).await {
            StatsCounters::incr(&self.stats.queued);
            true
        } else {
            StatsCounters::incr(&self.stats.rejected);
            false
        }
    }

    async fn tick(&self) -> TickReport {
        let streams: Vec<String> = self.streams.read().keys().cloned().collect();
        let mut report = TickReport {
            streams: streams.len(),
            ..Default::default()
        };

        for stream_key in streams {
            let Some(event) = self.processor.get_next_event(&stream_key).await else {
                continue;
            };
            report.dispatched += 1;

            match self.sync.apply(&event).await {
                Ok(ApplyOutcome::Applied { .. }) => {
                    StatsCounters::incr(&self.stats.applied);
                    report.applied += 1;
                }
                Ok(ApplyOutcome::Ignored) => {
                    StatsCounters::incr(&self.stats.ignored);
                    report.ignored += 1;
                }
                Err(e) => {
                    if self.redeliver_or_bury(event, e).await {
                        report.retried += 1;
                    } else {
                        report.dead_lettered += 1;
                    }
                }
            }
        }

        report
    }

    /// Schedule a redelivery, or move the event to the dead letter queue
    ///
    /// Returns `true` if the event was requeued.
    async fn redeliver_or_bury(&self, mut event: Event, error: SyncError) -> bool {
        StatsCounters::incr(&self.stats.failed);

        let policy = &self.config.redelivery;
        let deliveries = event.attempt + 1;
        let retryable = error.is_retryable();

        let _routing = self.routing.read().await;
        if retryable && policy.has_attempts_remaining(deliveries) && self.is_tracked(&event.stream_key) {
            let delay = policy.delay_for_retry(deliveries);
            warn!(
                event_id = %event.event_id,
                stream_key = %event.stream_key,
                attempt = deliveries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Apply failed, scheduling redelivery"
            );
            event.attempt = deliveries;
            event.not_before = Some(tokio::time::Instant::now() + delay);
            self.processor.requeue(event).await;
            StatsCounters::incr(&self.stats.retried);
            return true;
        }

        error!(
            event_id = %event.event_id,
            stream_key = %event.stream_key,
            attempts = deliveries,
            retryable,
            error = %error,
            "Apply failed, moving event to dead letter queue"
        );
        self.dead_letters
            .push(DeadLetter::new(event, error.to_string(), retryable));
        StatsCounters::incr(&self.stats.dead_lettered);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::connection::{ConnectionConfig, InMemoryTransport};
    use serde_json::json;

    fn config() -> SyncWorkerConfig {
        SyncWorkerConfig::new(ConnectionConfig::new("https://abc.supabase.co", "anon-key"))
            .with_poll_interval(std::time::Duration::from_secs(3600))
    }

    fn worker(transport: Arc<InMemoryTransport>) -> SyncWorker {
        SyncWorker::new(config(), transport, Arc::new(InMemoryCheckpointStore::new()))
    }

    #[tokio::test]
    async fn test_disabled_worker_stays_stopped() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = SyncWorker::new(
            config().with_enabled(false),
            transport.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
        );

        assert!(matches!(worker.start().await, Err(SyncWorkerError::Disabled)));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert!(transport.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_stays_stopped() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.fail_next_connects(1);
        let worker = worker(transport);

        assert!(matches!(
            worker.start().await,
            Err(SyncWorkerError::ConnectionFailed)
        ));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert!(!worker.health_check());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = worker(transport.clone());

        worker.start().await.unwrap();
        worker.start().await.unwrap();

        assert_eq!(transport.connect_attempts().len(), 1);
        assert!(worker.health_check());
        worker.stop().await;
        assert!(!worker.health_check());
    }

    #[tokio::test]
    async fn test_start_on_running_worker_ignores_enabled_toggle() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = SyncWorker::new(
            config().with_enabled(false),
            transport.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
        );
        *worker.status.write() = WorkerStatus::Running;

        assert!(worker.start().await.is_ok());
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(transport.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_requires_running() {
        let worker = worker(Arc::new(InMemoryTransport::new()));
        assert!(matches!(
            worker.subscribe_to_stream("42", "thread-1", None).await,
            Err(SyncWorkerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_opens_both_channels_once() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = worker(transport.clone());
        worker.start().await.unwrap();

        worker.subscribe_to_stream("42", "thread-1", None).await.unwrap();
        worker
            .subscribe_to_stream("42", "thread-1", Some("other-agent"))
            .await
            .unwrap();

        assert_eq!(worker.subscription_count(), 1);
        assert_eq!(
            transport.channel_names(),
            vec!["business_plans:thread-1", "section_states:thread-1"]
        );
        assert_eq!(worker.subscriptions()[0].agent_kind, "founder-buddy");
    }

    #[tokio::test]
    async fn test_subscribe_is_both_or_neither() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.refuse_subscriptions_to("business_plans");
        let worker = worker(transport.clone());
        worker.start().await.unwrap();

        let result = worker.subscribe_to_stream("42", "thread-1", None).await;

        assert!(matches!(result, Err(SyncWorkerError::SubscriptionFailed(_))));
        assert_eq!(worker.subscription_count(), 0);
        assert!(transport.channel_names().is_empty());
        assert_eq!(worker.connection().subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_queue() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = worker(transport.clone());
        worker.start().await.unwrap();
        worker.subscribe_to_stream("42", "thread-1", None).await.unwrap();

        assert!(
            worker
                .ingest(json!({
                    "table": "business_plans",
                    "type": "UPDATE",
                    "record": {"user_id": 42, "thread_id": "thread-1", "content": "plan"}
                }))
                .await
        );
        assert_eq!(worker.processor().pending_len("thread-1").await, 1);

        assert!(worker.unsubscribe_from_stream("thread-1").await);
        assert!(!worker.unsubscribe_from_stream("thread-1").await);
        assert_eq!(worker.processor().pending_len("thread-1").await, 0);
        assert!(transport.channel_names().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_waits_for_event_being_routed() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = Arc::new(worker(transport));
        worker.start().await.unwrap();
        worker.subscribe_to_stream("42", "thread-1", None).await.unwrap();

        let event = worker
            .processor()
            .parse_payload(&json!({
                "table": "business_plans",
                "type": "UPDATE",
                "record": {"user_id": 42, "thread_id": "thread-1", "content": "plan"}
            }))
            .unwrap();

        // Intake has found the stream tracked and is about to enqueue
        let routing = worker.shared.routing.read().await;
        assert!(worker.shared.is_tracked("thread-1"));

        let unsubscribe = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.unsubscribe_from_stream("thread-1").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!unsubscribe.is_finished());

        assert!(worker.processor().add_event(event).await);
        drop(routing);

        assert!(unsubscribe.await.unwrap());
        assert_eq!(worker.processor().pending_len("thread-1").await, 0);

        // A later subscription starts from an empty queue
        worker.subscribe_to_stream("42", "thread-1", None).await.unwrap();
        assert_eq!(worker.tick().await.applied, 0);
        assert_eq!(worker.stats().applied, 0);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_untracked_stream_is_unrouted() {
        let worker = worker(Arc::new(InMemoryTransport::new()));

        assert!(
            !worker
                .ingest(json!({
                    "table": "business_plans",
                    "type": "UPDATE",
                    "record": {"user_id": 42, "thread_id": "elsewhere", "content": "plan"}
                }))
                .await
        );
        assert!(!worker.ingest(json!({"table": "users"})).await);

        let stats = worker.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.unparsed, 1);
    }

    #[tokio::test]
    async fn test_stop_drops_streams_and_disconnects() {
        let transport = Arc::new(InMemoryTransport::new());
        let worker = worker(transport.clone());
        worker.start().await.unwrap();
        worker.subscribe_to_stream("42", "thread-1", None).await.unwrap();

        worker.stop().await;

        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(worker.subscription_count(), 0);
        assert!(!transport.is_alive());

        // Restart works with a fresh connection
        worker.start().await.unwrap();
        assert!(worker.health_check());
        worker.stop().await;
    }
}
