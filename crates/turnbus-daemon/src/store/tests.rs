use chrono::{TimeZone, Utc};
use serde_json::value::RawValue;

use turnbus_core::event::{types, Event, Level};
use turnbus_core::SPEC_VERSION;

use super::migrations::apply_embedded;
use super::{DurableStore, StoreError};

fn store() -> DurableStore {
    let store = DurableStore::open_in_memory().unwrap();
    apply_embedded(&store).unwrap();
    store
}

fn event(thread_id: &str, turn_id: &str, seq: i64, kind: &str) -> Event {
    Event {
        spec_version: SPEC_VERSION.to_string(),
        event_id: turnbus_core::id::new_id(),
        thread_id: thread_id.to_string(),
        turn_id: turn_id.to_string(),
        seq,
        ts: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
        kind: kind.to_string(),
        level: Level::Info,
        payload: Some(RawValue::from_string("{}".to_string()).unwrap()),
        source: None,
        trace: None,
        tags: None,
    }
}

#[test]
fn migrations_apply_once() {
    let store = DurableStore::open_in_memory().unwrap();
    let first = apply_embedded(&store).unwrap();
    assert_eq!(first, vec!["0001_init".to_string()]);
    let second = apply_embedded(&store).unwrap();
    assert!(second.is_empty());
    assert!(store.is_migration_applied("0001_init").unwrap());
    assert!(!store.is_migration_applied("9999_future").unwrap());
}

#[test]
fn persist_is_idempotent_per_event_id() {
    let store = store();
    let e = event("t1", "u1", 1, types::TURN_STARTED);
    store.persist_event_tx("tenant", 900, &e).unwrap();
    store.persist_event_tx("tenant", 900, &e).unwrap();

    let events = store.list_events("t1", 0, 100).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, e.event_id);
    assert_eq!(events[0].seq, 1);
}

#[test]
fn duplicate_thread_seq_from_different_event_is_rejected() {
    let store = store();
    store
        .persist_event_tx("tenant", 900, &event("t1", "u1", 1, types::TURN_STARTED))
        .unwrap();
    let clash = event("t1", "u1", 1, types::TURN_COMPLETED);
    let err = store.persist_event_tx("tenant", 900, &clash).unwrap_err();
    assert!(matches!(err, StoreError::Sqlite(_)));
    // The failed call must leave no partial aggregate behind.
    let thread = store.get_thread("t1").unwrap().unwrap();
    assert_eq!(thread.status, "active");
}

#[test]
fn thread_aggregate_tracks_last_seq_monotonically() {
    let store = store();
    store
        .persist_event_tx("tenant", 900, &event("t1", "u1", 5, types::TURN_STARTED))
        .unwrap();
    let thread = store.get_thread("t1").unwrap().unwrap();
    assert_eq!(thread.last_seq, 5);
    assert_eq!(thread.status, "active");
    assert_eq!(thread.tenant_id, "tenant");

    // An out-of-order persist must not move last_seq backwards.
    store
        .persist_event_tx("tenant", 900, &event("t1", "u1", 3, types::THREAD_HEARTBEAT))
        .unwrap();
    let thread = store.get_thread("t1").unwrap().unwrap();
    assert_eq!(thread.last_seq, 5);

    store
        .persist_event_tx("tenant", 900, &event("t1", "u1", 6, types::TURN_COMPLETED))
        .unwrap();
    let thread = store.get_thread("t1").unwrap().unwrap();
    assert_eq!(thread.last_seq, 6);
    assert_eq!(thread.status, "idle");
}

#[test]
fn non_positive_idle_timeout_falls_back() {
    let store = store();
    store
        .persist_event_tx("tenant", 0, &event("t1", "u1", 1, types::TURN_STARTED))
        .unwrap();
    let thread = store.get_thread("t1").unwrap().unwrap();
    assert_eq!(thread.idle_timeout_seconds, 900);
}

#[test]
fn turn_lifecycle_captures_input_and_pins_completion() {
    let store = store();
    store
        .persist_event_tx("tenant", 900, &event("t1", "u1", 1, types::TURN_STARTED))
        .unwrap();
    let turn = store.get_turn("t1", "u1").unwrap().unwrap();
    assert_eq!(turn.status, "started");
    assert_eq!(turn.input, "{}");
    assert!(turn.completed_at.is_none());

    let mut input = event("t1", "u1", 2, types::TURN_INPUT);
    input.payload = Some(RawValue::from_string(r#"{"prompt":"hi"}"#.to_string()).unwrap());
    store.persist_event_tx("tenant", 900, &input).unwrap();
    let turn = store.get_turn("t1", "u1").unwrap().unwrap();
    assert_eq!(turn.status, "running");
    assert_eq!(turn.input, r#"{"prompt":"hi"}"#);

    // A second turn.input does not overwrite the captured input.
    let mut late = event("t1", "u1", 3, types::TURN_INPUT);
    late.payload = Some(RawValue::from_string(r#"{"prompt":"again"}"#.to_string()).unwrap());
    store.persist_event_tx("tenant", 900, &late).unwrap();
    let turn = store.get_turn("t1", "u1").unwrap().unwrap();
    assert_eq!(turn.input, r#"{"prompt":"hi"}"#);

    let mut done = event("t1", "u1", 4, types::TURN_COMPLETED);
    done.ts = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
    store.persist_event_tx("tenant", 900, &done).unwrap();
    let turn = store.get_turn("t1", "u1").unwrap().unwrap();
    assert_eq!(turn.status, "completed");
    let completed_at = turn.completed_at.unwrap();

    // Terminal time is stable: a straggler terminal event cannot move it.
    let mut straggler = event("t1", "u1", 5, types::TURN_FAILED);
    straggler.ts = Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap();
    store.persist_event_tx("tenant", 900, &straggler).unwrap();
    let turn = store.get_turn("t1", "u1").unwrap().unwrap();
    assert_eq!(turn.completed_at.unwrap(), completed_at);
    assert_eq!(turn.status, "failed");
}

#[test]
fn list_events_paginates_by_seq() {
    let store = store();
    for seq in 1..=10 {
        store
            .persist_event_tx("tenant", 900, &event("t1", "u1", seq, types::THREAD_HEARTBEAT))
            .unwrap();
    }
    let all = store.list_events("t1", 0, 100).unwrap();
    assert_eq!(all.len(), 10);
    assert_eq!(
        all.iter().map(|e| e.seq).collect::<Vec<_>>(),
        (1..=10).collect::<Vec<_>>()
    );

    let tail = store.list_events("t1", 7, 100).unwrap();
    assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![8, 9, 10]);

    let page = store.list_events("t1", 0, 4).unwrap();
    assert_eq!(page.len(), 4);

    // Defaults kick in for non-positive limits.
    let defaulted = store.list_events("t1", 0, 0).unwrap();
    assert_eq!(defaulted.len(), 10);
}

#[test]
fn listed_events_round_trip_their_payload_bytes() {
    let store = store();
    let mut e = event("t1", "u1", 1, types::ASSISTANT_MESSAGE_DELTA);
    let raw = r#"{"delta":"he","idx":0}"#;
    e.payload = Some(RawValue::from_string(raw.to_string()).unwrap());
    e.tags = Some([("a".to_string(), "b".to_string())].into_iter().collect());
    store.persist_event_tx("tenant", 900, &e).unwrap();

    let events = store.list_events("t1", 0, 10).unwrap();
    assert_eq!(events[0].payload_str(), raw);
    assert_eq!(events[0].tags.as_ref().unwrap()["a"], "b");
    assert_eq!(events[0].ts, e.ts);
    events[0].validate().unwrap();
}

#[test]
fn archive_query_reports_actual_extremes() {
    let store = store();
    for seq in [3, 4, 7] {
        store
            .persist_event_tx("tenant", 900, &event("t1", "u1", seq, types::THREAD_HEARTBEAT))
            .unwrap();
    }
    let q = store.list_events_for_archive("t1", 1, 10, 100).unwrap();
    assert_eq!(q.events.len(), 3);
    assert_eq!(q.min_seq, 3);
    assert_eq!(q.max_seq, 7);

    let empty = store.list_events_for_archive("t1", 8, 10, 100).unwrap();
    assert!(empty.events.is_empty());

    assert!(matches!(
        store.list_events_for_archive("t1", 10, 5, 100),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn archive_catalog_round_trips() {
    let store = store();
    let archive = super::EventArchive {
        archive_id: turnbus_core::id::new_id(),
        thread_id: "t1".to_string(),
        from_seq: 1,
        to_seq: 10,
        object_key: "turnbus/threads/t1/archives/a.jsonl.gz".to_string(),
        content_encoding: "gzip".to_string(),
        content_type: "application/x-ndjson".to_string(),
        event_count: 10,
        created_at: Utc::now(),
    };
    store.insert_archive(&archive).unwrap();
    // Idempotent on archive_id.
    store.insert_archive(&archive).unwrap();

    let listed = store.list_archives("t1", 0).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].from_seq, 1);
    assert_eq!(listed[0].to_seq, 10);
    assert_eq!(listed[0].event_count, 10);

    let fetched = store.get_archive(&archive.archive_id).unwrap().unwrap();
    assert_eq!(fetched.object_key, archive.object_key);
    assert!(store.get_archive("missing").unwrap().is_none());
}

#[test]
fn archives_list_in_from_seq_order() {
    let store = store();
    for (from, to) in [(11, 20), (1, 10), (21, 25)] {
        store
            .insert_archive(&super::EventArchive {
                archive_id: turnbus_core::id::new_id(),
                thread_id: "t1".to_string(),
                from_seq: from,
                to_seq: to,
                object_key: format!("k/{from}"),
                content_encoding: "gzip".to_string(),
                content_type: "application/x-ndjson".to_string(),
                event_count: to - from + 1,
                created_at: Utc::now(),
            })
            .unwrap();
    }
    let listed = store.list_archives("t1", 0).unwrap();
    let ranges: Vec<(i64, i64)> = listed.iter().map(|a| (a.from_seq, a.to_seq)).collect();
    assert_eq!(ranges, vec![(1, 10), (11, 20), (21, 25)]);
}

#[test]
fn invalid_inputs_are_rejected() {
    let store = store();
    assert!(matches!(
        store.persist_event_tx(" ", 900, &event("t1", "u1", 1, types::TURN_STARTED)),
        Err(StoreError::InvalidArgument(_))
    ));
    let mut bad = event("t1", "u1", 1, types::TURN_STARTED);
    bad.payload = None;
    assert!(matches!(
        store.persist_event_tx("tenant", 900, &bad),
        Err(StoreError::InvalidEvent(_))
    ));
    assert!(matches!(
        store.get_thread(""),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.is_migration_applied("  "),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.apply_migration("0002_x", "   "),
        Err(StoreError::InvalidArgument(_))
    ));
}
