//! End-to-end sync scenarios
//!
//! Run with: cargo test -p everruns-realtime --test scenarios_test

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use everruns_realtime::checkpoint::{Checkpoint, CheckpointKey, InMemoryCheckpointStore};
use everruns_realtime::connection::{ConnectionConfig, ConnectionManager, InMemoryTransport};
use everruns_realtime::event::{Event, EventType};
use everruns_realtime::sync::{SyncError, SyncHandler, SECTION_STATES_CHANNEL};
use everruns_realtime::tables::ChannelKind;
use everruns_realtime::worker::{SyncWorker, SyncWorkerConfig};

fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new("https://abc.supabase.co", "anon-key")
}

/// Worker whose poll loop never fires on its own; tests drive it with `tick`
fn manual_worker(
    transport: Arc<InMemoryTransport>,
    store: Arc<InMemoryCheckpointStore>,
) -> SyncWorker {
    SyncWorker::new(
        SyncWorkerConfig::new(connection_config()).with_poll_interval(Duration::from_secs(3600)),
        transport,
        store,
    )
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn section_change(stream: &str, section: &str, at: DateTime<Utc>, new: Value) -> Value {
    let mut row = json!({
        "user_id": 42,
        "thread_id": stream,
        "section_id": section,
        "updated_at": at.to_rfc3339(),
    });
    if let (Value::Object(row), Value::Object(extra)) = (&mut row, new) {
        row.extend(extra);
    }
    json!({
        "table": "section_states",
        "type": "UPDATE",
        "new": row,
        "old": {},
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Records every event it is asked to apply
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl SyncHandler for RecordingHandler {
    fn apply(
        &self,
        event: &Event,
        values: &mut BTreeMap<String, Value>,
    ) -> Result<Vec<String>, SyncError> {
        self.seen
            .lock()
            .push((event.stream_key.clone(), event.timestamp));
        values.insert(
            SECTION_STATES_CHANNEL.to_string(),
            json!({ "last": event.event_id }),
        );
        Ok(vec![SECTION_STATES_CHANNEL.to_string()])
    }
}

// ============================================
// Scenario 1: entity update with an advance signal
// ============================================

#[test_log::test(tokio::test)]
async fn test_entity_update_marks_section_done() {
    let transport = Arc::new(InMemoryTransport::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let key = CheckpointKey::new("42", "X");

    let mut existing = Checkpoint::new();
    existing.channel_values.insert("messages".into(), json!(["hello"]));
    existing.channel_versions.insert("messages".into(), 3);
    existing.channel_versions.insert(SECTION_STATES_CHANNEL.into(), 5);
    store.seed(key.clone(), existing);

    let worker = manual_worker(transport.clone(), store.clone());
    worker.start().await.unwrap();
    worker.subscribe_to_stream("42", "X", None).await.unwrap();

    // Delivered the way the client library wraps it
    let change = section_change(
        "X",
        "pain",
        base_time(),
        json!({"content": "draft text", "router_directive": "next"}),
    );
    assert!(
        transport
            .emit("section_states:X", json!({ "data": change }))
            .await
    );
    wait_until(|| worker.stats().queued == 1).await;

    let report = worker.tick().await;
    assert_eq!(report.applied, 1);

    let checkpoint = store.snapshot(&key).unwrap();
    let entry = &checkpoint.channel_values[SECTION_STATES_CHANNEL]["pain"];
    assert_eq!(entry["status"], "done");
    assert_eq!(entry["content"]["plain_text"], "draft text");
    assert_eq!(checkpoint.version(SECTION_STATES_CHANNEL), 6);
    assert_eq!(checkpoint.version("messages"), 3);
    assert_eq!(checkpoint.version("business_plan"), 0);

    worker.stop().await;
}

// ============================================
// Scenario 2: replayed change reaches apply once
// ============================================

#[tokio::test]
async fn test_replayed_change_applies_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let worker = manual_worker(transport.clone(), store.clone());
    let recorder = Arc::new(RecordingHandler::default());
    worker
        .sync_service()
        .register_handler(EventType::EntityUpdated, recorder.clone());

    worker.start().await.unwrap();
    worker.subscribe_to_stream("42", "X", None).await.unwrap();

    let change = section_change("X", "pain", base_time(), json!({"content": "v1"}));
    transport.emit("section_states:X", change.clone()).await;
    transport.emit("section_states:X", change).await;
    wait_until(|| {
        let stats = worker.stats();
        stats.queued + stats.rejected == 2
    })
    .await;

    assert_eq!(worker.processor().pending_len("X").await, 1);
    worker.tick().await;
    worker.tick().await;

    assert_eq!(recorder.seen.lock().len(), 1);
    let stats = worker.stats();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.applied, 1);

    worker.stop().await;
}

// ============================================
// Scenario 3: reconnect backoff, subscriptions not restored
// ============================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_does_not_restore_subscriptions() {
    let transport = Arc::new(InMemoryTransport::new());
    let manager = ConnectionManager::new(transport.clone(), connection_config());
    let (tx, _rx) = mpsc::channel(16);

    assert!(manager.connect().await);
    for kind in ChannelKind::ALL {
        manager.subscribe("X", kind, tx.clone()).await.unwrap();
    }
    assert_eq!(manager.subscription_count(), 2);

    transport.drop_connection();
    transport.fail_next_connects(3);
    let connects_before = transport.connect_attempts().len();

    // First failure is a direct connect, the next two are reconnect attempts
    assert!(!manager.connect().await);
    assert!(manager.reconnect().await);

    let attempts = transport.connect_attempts()[connects_before..].to_vec();
    assert_eq!(attempts.len(), 4);
    let delays: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    assert!(manager.is_connected());
    assert_eq!(manager.subscription_count(), 0);
    assert!(transport.channel_names().is_empty());

    // Callers restore them explicitly
    manager
        .subscribe("X", ChannelKind::Entity, tx.clone())
        .await
        .unwrap();
    assert_eq!(transport.channel_names(), vec!["section_states:X"]);
}

// ============================================
// Scenario 4: fan-out across many streams
// ============================================

#[tokio::test]
async fn test_five_hundred_streams_ten_ticks() {
    const STREAMS: usize = 500;
    const TICKS: usize = 10;

    let transport = Arc::new(InMemoryTransport::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let worker = manual_worker(transport, store.clone());
    let recorder = Arc::new(RecordingHandler::default());
    worker
        .sync_service()
        .register_handler(EventType::EntityUpdated, recorder.clone());

    worker.start().await.unwrap();
    for n in 0..STREAMS {
        worker
            .subscribe_to_stream("42", &format!("thread-{n}"), None)
            .await
            .unwrap();
    }

    for tick in 0..TICKS {
        for n in 0..STREAMS {
            // Later ticks carry later edits; streams are offset so ids never collide
            let at = base_time()
                + chrono::Duration::seconds(tick as i64 * 60)
                + chrono::Duration::milliseconds(n as i64);
            let change = section_change(&format!("thread-{n}"), "pain", at, json!({"content": "x"}));
            assert!(worker.ingest(change).await);
        }

        let report = worker.tick().await;
        assert_eq!(report.streams, STREAMS);
        assert_eq!(report.applied, STREAMS);
    }

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len(), STREAMS * TICKS);
    assert_eq!(worker.stats().applied, (STREAMS * TICKS) as u64);

    let mut per_stream: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
    for (stream, at) in seen {
        per_stream.entry(stream).or_default().push(at);
    }
    assert_eq!(per_stream.len(), STREAMS);
    for (stream, timestamps) in per_stream {
        assert_eq!(timestamps.len(), TICKS, "stream {stream}");
        assert!(
            timestamps.windows(2).all(|w| w[0] <= w[1]),
            "stream {stream} applied out of order"
        );
    }

    assert_eq!(store.len(), STREAMS);
    worker.stop().await;
}
