//! Ingest-to-store pipeline tests: dense sequencing, redelivery, poison
//! handling, and the dead-letter path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use turnbus_core::event::{types, Event, Level};
use turnbus_core::streamlog::{Fields, StreamId, StreamLog, DEFAULT_DLQ_STREAM, GLOBAL_STREAM};

use turnbus_daemon::gateway::{GatewayConfig, IngestGateway};
use turnbus_daemon::persister::{Persister, PersisterConfig};
use turnbus_daemon::store::{migrations, DurableStore, EventSink, StoreError};

fn fresh_store() -> DurableStore {
    let store = DurableStore::open_in_memory().unwrap();
    migrations::apply_embedded(&store).unwrap();
    store
}

fn test_persister_config() -> PersisterConfig {
    PersisterConfig {
        consumer: "test-consumer".to_string(),
        min_idle: Duration::ZERO,
        read_block: Duration::from_millis(10),
        tenant_id: "tenant".to_string(),
        ..PersisterConfig::default()
    }
}

fn producer_event(thread_id: &str, kind: &str) -> Event {
    Event {
        spec_version: String::new(),
        event_id: String::new(),
        thread_id: thread_id.to_string(),
        turn_id: "u1".to_string(),
        seq: 0,
        ts: chrono::TimeZone::timestamp_opt(&chrono::Utc, 0, 0).unwrap(),
        kind: kind.to_string(),
        level: Level::Info,
        payload: Some(serde_json::value::RawValue::from_string("{}".to_string()).unwrap()),
        source: None,
        trace: None,
        tags: None,
    }
}

/// Sink that fails its first `failures` persist calls, then delegates.
struct FlakySink {
    inner: DurableStore,
    failures: AtomicU64,
    attempts: AtomicU64,
}

impl EventSink for FlakySink {
    fn persist_event(
        &self,
        tenant_id: &str,
        idle_timeout_seconds: i64,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::LockPoisoned);
        }
        self.inner
            .persist_event(tenant_id, idle_timeout_seconds, event)
    }
}

#[tokio::test]
async fn ten_auto_allocated_events_persist_densely() {
    let log = Arc::new(StreamLog::new());
    let store = fresh_store();
    log.ensure_group(GLOBAL_STREAM, "persist").unwrap();

    let gateway = IngestGateway::new(Arc::clone(&log), GatewayConfig::default());
    for _ in 0..10 {
        gateway
            .append(producer_event("t1", types::THREAD_HEARTBEAT))
            .await
            .unwrap();
    }

    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::new(store.clone()),
        test_persister_config(),
    );
    persister.run_pass().await.unwrap();

    let events = store.list_events("t1", 0, 100).unwrap();
    assert_eq!(events.len(), 10);
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    assert_eq!(store.get_thread("t1").unwrap().unwrap().last_seq, 10);
}

#[tokio::test]
async fn duplicate_appends_persist_exactly_once() {
    let log = Arc::new(StreamLog::new());
    let store = fresh_store();
    log.ensure_group(GLOBAL_STREAM, "persist").unwrap();

    let gateway = IngestGateway::new(Arc::clone(&log), GatewayConfig::default());
    let mut event = producer_event("t1", types::TURN_STARTED);
    event.event_id = "dup-1".to_string();
    let first = gateway.append(event.clone()).await.unwrap();
    assert_eq!(first.seq, 1);
    let second = gateway.append(event).await.unwrap();
    assert!(second.duplicated);
    assert_eq!(second.seq, 1);

    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::new(store.clone()),
        test_persister_config(),
    );
    persister.run_pass().await.unwrap();

    let events = store.list_events("t1", 0, 100).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, "dup-1");
}

#[tokio::test]
async fn malformed_envelope_is_acked_and_dropped() {
    let log = Arc::new(StreamLog::new());
    let store = fresh_store();
    log.ensure_group(GLOBAL_STREAM, "persist").unwrap();

    // An entry with no event field at all.
    let mut fields = Fields::new();
    fields.insert("thread_id".to_string(), "t1".to_string());
    log.add(GLOBAL_STREAM, fields).unwrap();

    // And one whose event field does not decode.
    let mut fields = Fields::new();
    fields.insert("event".to_string(), "{not json".to_string());
    log.add(GLOBAL_STREAM, fields).unwrap();

    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::new(store.clone()),
        test_persister_config(),
    );
    persister.run_pass().await.unwrap();

    // Both acked: nothing pending, nothing persisted, nothing dead-lettered.
    let pending = log
        .pending_ext(GLOBAL_STREAM, "persist", StreamId::ZERO, StreamId::MAX, 10)
        .unwrap();
    assert!(pending.is_empty());
    assert!(store.list_events("t1", 0, 100).unwrap().is_empty());
    assert_eq!(log.len(DEFAULT_DLQ_STREAM).unwrap(), 0);
}

#[tokio::test]
async fn persist_retry_succeeds_on_third_attempt() {
    let log = Arc::new(StreamLog::new());
    let store = fresh_store();
    log.ensure_group(GLOBAL_STREAM, "persist").unwrap();

    let gateway = IngestGateway::new(Arc::clone(&log), GatewayConfig::default());
    gateway
        .append(producer_event("t1", types::TURN_STARTED))
        .await
        .unwrap();

    let sink = Arc::new(FlakySink {
        inner: store.clone(),
        failures: AtomicU64::new(2),
        attempts: AtomicU64::new(0),
    });
    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::clone(&sink) as Arc<dyn EventSink>,
        test_persister_config(),
    );

    // First pass: fresh delivery fails, entry stays pending.
    persister.run_pass().await.unwrap();
    assert!(store.list_events("t1", 0, 100).unwrap().is_empty());
    let pending = log
        .pending_ext(GLOBAL_STREAM, "persist", StreamId::ZERO, StreamId::MAX, 10)
        .unwrap();
    assert_eq!(pending.len(), 1);

    // Second pass: reclaim fails again.
    persister.run_pass().await.unwrap();
    assert!(store.list_events("t1", 0, 100).unwrap().is_empty());

    // Third pass: reclaim succeeds; the row appears exactly once.
    persister.run_pass().await.unwrap();
    assert_eq!(store.list_events("t1", 0, 100).unwrap().len(), 1);
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    let pending = log
        .pending_ext(GLOBAL_STREAM, "persist", StreamId::ZERO, StreamId::MAX, 10)
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn poison_entry_lands_in_the_dead_letter_stream() {
    let log = Arc::new(StreamLog::new());
    let store = fresh_store();
    log.ensure_group(GLOBAL_STREAM, "persist").unwrap();

    let gateway = IngestGateway::new(Arc::clone(&log), GatewayConfig::default());
    let mut event = producer_event("t1", types::TURN_STARTED);
    event.event_id = "poison-1".to_string();
    gateway.append(event).await.unwrap();

    let sink = Arc::new(FlakySink {
        inner: store.clone(),
        failures: AtomicU64::new(u64::MAX),
        attempts: AtomicU64::new(0),
    });
    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::clone(&sink) as Arc<dyn EventSink>,
        test_persister_config(),
    );

    // Five failed attempts: one fresh delivery plus four reclaims.
    for _ in 0..5 {
        persister.run_pass().await.unwrap();
    }
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 5);
    assert_eq!(log.len(DEFAULT_DLQ_STREAM).unwrap(), 0);

    // The sixth pass sweeps the entry into the dead-letter stream.
    persister.run_pass().await.unwrap();
    let dlq = log
        .range(DEFAULT_DLQ_STREAM, StreamId::ZERO, StreamId::MAX, 10)
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].fields["dlq_from_stream"], GLOBAL_STREAM);
    assert_eq!(dlq[0].fields["event_id"], "poison-1");
    assert!(dlq[0].fields.contains_key("dlq_from_id"));
    assert!(dlq[0].fields.contains_key("dlq_ts"));

    // The original entry is gone: no row, nothing pending, source deleted.
    assert!(store.list_events("t1", 0, 100).unwrap().is_empty());
    let pending = log
        .pending_ext(GLOBAL_STREAM, "persist", StreamId::ZERO, StreamId::MAX, 10)
        .unwrap();
    assert!(pending.is_empty());
    assert_eq!(log.len(GLOBAL_STREAM).unwrap(), 0);
}

#[tokio::test]
async fn persister_loop_drains_and_stops_on_shutdown() {
    let log = Arc::new(StreamLog::new());
    let store = fresh_store();
    log.ensure_group(GLOBAL_STREAM, "persist").unwrap();

    let gateway = IngestGateway::new(Arc::clone(&log), GatewayConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::new(store.clone()),
        test_persister_config(),
    );
    let task = tokio::spawn(async move { persister.run(shutdown_rx).await });

    for _ in 0..5 {
        gateway
            .append(producer_event("t1", types::THREAD_HEARTBEAT))
            .await
            .unwrap();
    }

    // Wait for the background loop to drain everything.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.list_events("t1", 0, 100).unwrap().len() == 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "persister did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("persister must stop after shutdown")
        .unwrap();
}
