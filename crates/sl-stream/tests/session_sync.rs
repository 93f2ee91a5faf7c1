//! Session tests against a mock transport
//!
//! Covers event application through the supervisor's dispatch loop, the ack
//! handling of `start()`, and session teardown.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sl_stream::testing::{numbered_records, SimulatedTable};
use sl_stream::{
    ChangeKind, ClientConfig, ConnectionSupervisor, EvictionPolicy, MockTransport, RecordKey,
    SessionStatus, StreamError, StreamQuery, StreamUpdate, WindowBounds,
};
use tokio::sync::mpsc;

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sl_stream=debug")
        .with_test_writer()
        .try_init();
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<StreamUpdate>) -> StreamUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("update in time")
        .expect("listener alive")
}

fn ids(records: &[sl_stream::Record]) -> Vec<i64> {
    records.iter().filter_map(|r| r["id"].as_i64()).collect()
}

fn setup(config: ClientConfig) -> (Arc<MockTransport>, Arc<ConnectionSupervisor>) {
    init_tracing();
    let transport = Arc::new(MockTransport::default());
    let supervisor = ConnectionSupervisor::new(transport.clone(), config);
    (transport, supervisor)
}

// =============================================================================
// Event application
// =============================================================================

#[tokio::test]
async fn test_reference_scenario_through_dispatch() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let _dispatch = supervisor.spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_stream_tag("nodes"), tx)
        .unwrap();

    transport.inject("nodes", json!({"id": 5, "v": "a"}));
    let update = recv(&mut rx).await;
    assert_eq!(update.change.kind, ChangeKind::Inserted);
    assert_eq!(update.payload, json!({"id": 5, "v": "a"}));
    assert_eq!(session.query().window.end_key, Some(RecordKey::Int(5)));

    transport.inject("nodes", json!({"id": 2, "v": "b"}));
    recv(&mut rx).await;
    assert_eq!(ids(&session.snapshot()), vec![2, 5]);
    assert_eq!(session.query().window.start_key, Some(RecordKey::Int(2)));

    transport.inject("nodes", json!({"id": 5, "v": "c"}));
    let update = recv(&mut rx).await;
    assert_eq!(update.change.kind, ChangeKind::Updated);
    assert_eq!(
        Value::Array(session.snapshot().into_iter().map(Value::Object).collect()),
        json!([{"id": 2, "v": "b"}, {"id": 5, "v": "c"}])
    );

    transport.inject("nodes", json!({"_del_key": 2}));
    let update = recv(&mut rx).await;
    assert_eq!(update.change.kind, ChangeKind::Removed);
    assert_eq!(ids(&session.snapshot()), vec![5]);

    // second delete is silent; the marker after it proves it was processed
    transport.inject("nodes", json!({"_del_key": 2}));
    transport.inject("nodes", json!({"id": 9}));
    let update = recv(&mut rx).await;
    assert_eq!(update.change.key, RecordKey::Int(9));
    assert_eq!(ids(&session.snapshot()), vec![5, 9]);
}

#[tokio::test]
async fn test_malformed_event_dropped_without_notification() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let _dispatch = supervisor.spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_stream_tag("nodes"), tx)
        .unwrap();

    transport.inject("nodes", json!({"name": "no key"}));
    transport.inject("nodes", json!({"id": null}));
    transport.inject("nodes", json!("not an object"));
    transport.inject("nodes", json!({"id": 1}));

    let update = recv(&mut rx).await;
    assert_eq!(update.change.key, RecordKey::Int(1));
    assert_eq!(session.len(), 1);
}

#[tokio::test]
async fn test_events_for_unknown_tag_ignored() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let _dispatch = supervisor.spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_stream_tag("a"), tx)
        .unwrap();

    transport.inject("b", json!({"id": 1}));
    transport.inject("a", json!({"id": 2}));

    assert_eq!(recv(&mut rx).await.change.key, RecordKey::Int(2));
    assert_eq!(ids(&session.snapshot()), vec![2]);
}

#[tokio::test]
async fn test_closure_listener() {
    let (_transport, supervisor) = setup(ClientConfig::default());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let session = supervisor
        .register(
            StreamQuery::table("nodes", "id"),
            move |update: &StreamUpdate| sink.lock().push(update.change.key.clone()),
        )
        .unwrap();

    // generated tag
    assert!(session.stream_tag().starts_with("nodes-"));

    session.apply_event(json!({"id": 3}));
    session.apply_event(json!({"_del_key": 7}));
    session.apply_event(json!({"id": 1}));
    assert_eq!(*seen.lock(), vec![RecordKey::Int(3), RecordKey::Int(1)]);
}

// =============================================================================
// start() and acknowledgements
// =============================================================================

#[tokio::test]
async fn test_start_sends_full_query() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.echo_acks();
    let query = StreamQuery::table("pkts", "ts")
        .with_start_key(100_i64)
        .with_count(25)
        .with_force(true)
        .with_stream_tag("pkts");
    let session = supervisor.register(query, |_: &StreamUpdate| {}).unwrap();

    tokio_test::assert_ok!(session.start().await);

    assert_eq!(
        transport.sent_payloads("startstream"),
        vec![json!({
            "table_name": "pkts",
            "key_field": "ts",
            "start_key": 100,
            "count": 25,
            "force": true,
            "stream_tag": "pkts"
        })]
    );
}

#[tokio::test]
async fn test_ack_overwrites_window_and_pagination() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.set_responder(|_, _| {
        Some(json!({
            "start_key": 10, "end_key": 50, "count": 41,
            "start_item_number": 9, "total_item_count": 500,
            "at_start": false, "at_end": false
        }))
    });
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_count(20), |_: &StreamUpdate| {})
        .unwrap();

    let ack = session.start().await.unwrap();
    assert_eq!(ack.total_item_count, 500);

    let query = session.query();
    assert_eq!(query.window, WindowBounds::new(10_i64, 50_i64));
    assert_eq!(query.count, Some(41));
    assert_eq!(query.start_item_number, Some(9));
    assert_eq!(query.total_item_count, Some(500));
    assert_eq!(session.status(), SessionStatus::Active);
}

#[tokio::test]
async fn test_subscription_error_leaves_state_untouched() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.set_responder(|_, _| Some(json!({"error": "'count' field missing in request"})));
    let session = supervisor
        .register(
            StreamQuery::table("nodes", "id").with_start_key(3_i64).with_stream_tag("nodes"),
            |_: &StreamUpdate| {},
        )
        .unwrap();
    session.apply_event(json!({"id": 4}));
    let before = session.query();

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, StreamError::Subscription(_)));
    assert!(err.is_retryable());
    assert_eq!(session.query(), before);
    assert_eq!(ids(&session.snapshot()), vec![4]);
    assert!(matches!(session.status(), SessionStatus::Failed(_)));
}

#[tokio::test]
async fn test_malformed_ack_is_protocol_error() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.set_responder(|_, _| Some(json!({"start_key": 1, "count": 3})));
    let session = supervisor
        .register(StreamQuery::table("nodes", "id"), |_: &StreamUpdate| {})
        .unwrap();
    let before = session.query();

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, StreamError::Protocol(_)));
    assert_eq!(session.query(), before);
}

#[tokio::test]
async fn test_missing_ack_times_out() {
    let config = ClientConfig {
        ack_timeout_ms: 30,
        ..Default::default()
    };
    let (transport, supervisor) = setup(config);
    transport.set_responder(|_, _| None);
    let session = supervisor
        .register(StreamQuery::table("nodes", "id"), |_: &StreamUpdate| {})
        .unwrap();

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, StreamError::AckTimeout(d) if d == Duration::from_millis(30)));
}

#[tokio::test]
async fn test_start_while_disconnected_fails_cleanly() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.echo_acks();
    transport.set_connected(false);
    let session = supervisor
        .open_session(StreamQuery::table("nodes", "id"), |_: &StreamUpdate| {})
        .await
        .unwrap();

    assert!(matches!(session.status(), SessionStatus::Failed(_)));
    assert_eq!(supervisor.session_count(), 1);
}

#[tokio::test]
async fn test_events_before_ack_stay_inside_window() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let table = SimulatedTable::attach("nodes", "id", transport.clone());
    table.seed(numbered_records("id", 1..=100));
    let _dispatch = supervisor.spawn();

    let session = supervisor
        .open_session(
            StreamQuery::table("nodes", "id")
                .with_start_item_number(20)
                .with_count(10)
                .with_stream_tag("page3"),
            |_: &StreamUpdate| {},
        )
        .await
        .unwrap();

    eventually("window to fill", || session.len() == 10).await;
    assert_eq!(ids(&session.snapshot()), (21..=30).collect::<Vec<_>>());
    let query = session.query();
    assert_eq!(query.window, WindowBounds::new(21_i64, 30_i64));
    assert_eq!(query.total_item_count, Some(100));
    assert_eq!(query.at_start, Some(false));
}

#[tokio::test]
async fn test_record_type_ack_rekeys_cache() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let table = SimulatedTable::attach("node", "name", transport.clone());
    table.seed(vec![
        json!({"id": 3, "name": "alpha"}),
        json!({"id": 1, "name": "bravo"}),
    ]);
    let session = supervisor
        .register(
            StreamQuery::record_type("node", "id").with_stream_tag("nodes"),
            |_: &StreamUpdate| {},
        )
        .unwrap();
    session.apply_event(json!({"id": 3, "name": "alpha"}));
    session.apply_event(json!({"id": 1, "name": "bravo"}));

    session.start().await.unwrap();

    let query = session.query();
    assert_eq!(query.key_field, "name");
    assert_eq!(query.window, WindowBounds::new("alpha", "bravo"));
    let names: Vec<Value> = session.snapshot().iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("alpha"), json!("bravo")]);
}

#[tokio::test]
async fn test_ack_with_smaller_count_trims_cache() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.set_responder(|_, _| {
        Some(json!({
            "start_key": 1, "end_key": 10, "count": 2,
            "start_item_number": 0, "total_item_count": 10
        }))
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_stream_tag("t"), tx)
        .unwrap();
    for id in 1..=10 {
        session.apply_event(json!({ "id": id }));
    }
    for _ in 0..10 {
        recv(&mut rx).await;
    }

    session.start().await.unwrap();

    assert_eq!(ids(&session.snapshot()), vec![1, 2, 3, 4]);
    assert_eq!(session.query().window, WindowBounds::new(1_i64, 4_i64));
    for key in 5..=10 {
        let update = recv(&mut rx).await;
        assert_eq!(update.change.kind, ChangeKind::Removed);
        assert_eq!(update.change.key, RecordKey::Int(key));
        assert_eq!(update.change.index, 4);
        assert_eq!(update.payload, json!({ "_del_key": key }));
    }
}

#[tokio::test]
async fn test_resync_drops_records_not_resent() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.set_responder(|_, _| {
        Some(json!({
            "start_key": 1, "end_key": 3, "count": 3,
            "start_item_number": 0, "total_item_count": 3
        }))
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_stream_tag("t"), tx)
        .unwrap();
    for id in 1..=3 {
        session.apply_event(json!({ "id": id }));
        recv(&mut rx).await;
    }

    // a plain start keeps what is cached
    session.start().await.unwrap();
    assert_eq!(ids(&session.snapshot()), vec![1, 2, 3]);

    // on resync only records seen again survive
    tokio_test::assert_ok!(session.resync().await);
    assert!(session.is_empty());
    let removed: Vec<RecordKey> = vec![
        recv(&mut rx).await.change.key,
        recv(&mut rx).await.change.key,
        recv(&mut rx).await.change.key,
    ];
    assert_eq!(removed, vec![RecordKey::Int(1), RecordKey::Int(2), RecordKey::Int(3)]);
}

#[tokio::test]
async fn test_resync_keeps_records_resent_before_ack() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let session = supervisor
        .register(StreamQuery::table("nodes", "id").with_stream_tag("t"), |_: &StreamUpdate| {})
        .unwrap();
    for id in [1, 2, 3, 4] {
        session.apply_event(json!({ "id": id }));
    }

    // replay the re-stream ahead of the ack, as the dispatch loop would
    let replay = session.clone();
    transport.set_responder(move |_, _| {
        for record in numbered_records("id", 1..=3) {
            replay.apply_event(record);
        }
        Some(json!({
            "start_key": 1, "end_key": 3, "count": 3,
            "start_item_number": 0, "total_item_count": 3
        }))
    });

    session.resync().await.unwrap();

    assert_eq!(ids(&session.snapshot()), vec![1, 2, 3]);
    assert_eq!(session.query().window, WindowBounds::new(1_i64, 3_i64));
}

// =============================================================================
// Registration and teardown
// =============================================================================

#[tokio::test]
async fn test_duplicate_stream_tag_rejected() {
    let (_transport, supervisor) = setup(ClientConfig::default());
    let query = StreamQuery::table("nodes", "id").with_stream_tag("dup");
    supervisor.register(query.clone(), |_: &StreamUpdate| {}).unwrap();

    let err = supervisor.register(query, |_: &StreamUpdate| {}).unwrap_err();
    assert!(matches!(err, StreamError::DuplicateStreamTag(tag) if tag == "dup"));
}

#[tokio::test]
async fn test_invalid_query_rejected() {
    let (_transport, supervisor) = setup(ClientConfig::default());
    let err = supervisor
        .register(StreamQuery::table("nodes", ""), |_: &StreamUpdate| {})
        .unwrap_err();
    assert!(matches!(err, StreamError::Config(_)));
}

#[tokio::test]
async fn test_close_deregisters_and_leaves() {
    let (transport, supervisor) = setup(ClientConfig::default());
    let table = SimulatedTable::attach("nodes", "id", transport.clone());
    table.seed(numbered_records("id", 1..=5));
    let _dispatch = supervisor.spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let session = supervisor
        .open_session(StreamQuery::table("nodes", "id").with_stream_tag("v"), tx)
        .await
        .unwrap();
    for _ in 0..5 {
        recv(&mut rx).await;
    }
    assert_eq!(table.subscribers(), vec!["v".to_string()]);

    tokio_test::assert_ok!(session.close().await);
    tokio_test::assert_ok!(session.close().await);

    assert!(session.is_closed());
    assert!(session.is_empty());
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(supervisor.session_count(), 0);
    assert_eq!(transport.sent_payloads("leave"), vec![json!({"stream_tag": "v"})]);
    assert!(table.subscribers().is_empty());

    // late events for the tag go nowhere
    transport.inject("v", json!({"id": 99}));
    assert!(session.apply_event(json!({"id": 100})).is_none());
    assert!(matches!(session.start().await, Err(StreamError::Closed(_))));
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let (transport, supervisor) = setup(ClientConfig::default());
    transport.echo_acks();
    for tag in ["a", "b", "c"] {
        supervisor
            .open_session(StreamQuery::table("nodes", "id").with_stream_tag(tag), |_: &StreamUpdate| {})
            .await
            .unwrap();
    }
    assert_eq!(supervisor.session_count(), 3);

    supervisor.shutdown().await;

    assert_eq!(supervisor.session_count(), 0);
    let mut left: Vec<Value> = transport.sent_payloads("leave");
    left.sort_by_key(|v| v["stream_tag"].as_str().unwrap_or_default().to_string());
    assert_eq!(
        left,
        vec![
            json!({"stream_tag": "a"}),
            json!({"stream_tag": "b"}),
            json!({"stream_tag": "c"})
        ]
    );
}

#[tokio::test]
async fn test_bounded_window_growth_from_live_inserts() {
    let config = ClientConfig {
        eviction: EvictionPolicy::Bounded { factor: 2 },
        ..Default::default()
    };
    let (transport, supervisor) = setup(config);
    let table = SimulatedTable::attach("nodes", "id", transport.clone());
    table.seed(numbered_records("id", 1..=3));
    let _dispatch = supervisor.spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let session = supervisor
        .open_session(
            StreamQuery::table("nodes", "id").with_count(3).with_stream_tag("tail"),
            tx,
        )
        .await
        .unwrap();
    for _ in 0..3 {
        recv(&mut rx).await;
    }

    // window sits at the end of the table, so new keys extend it
    for id in 4..=10 {
        table.upsert(json!({ "id": id })).unwrap();
        recv(&mut rx).await;
    }

    assert_eq!(ids(&session.snapshot()), (5..=10).collect::<Vec<_>>());
    assert_eq!(session.query().window, WindowBounds::new(5_i64, 10_i64));
}
