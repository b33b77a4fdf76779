//! Delivery integration tests
//!
//! End-to-end message flow over the in-memory store: ordering, the write
//! fast path, leases and redelivery, acks, epoch expiry and purging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use tablet_messager::config::MessagerConfig;
use tablet_messager::messager::{now_nanos, ChannelReceiver, Engine, MessageRow, Subscription};
use tablet_messager::schema::{
    message_columns, MessageSettings, SchemaChange, SchemaEngine, TableDescriptor,
};
use tablet_messager::storage::{MemoryMessageStore, StoredMessage};
use tablet_messager::types::{QueryResult, Value};

const WAIT: Duration = Duration::from_secs(5);

struct TestEnvironment {
    store: Arc<MemoryMessageStore>,
    engine: Arc<Engine>,
}

async fn create_test_environment(config: MessagerConfig) -> TestEnvironment {
    open_with_store(Arc::new(MemoryMessageStore::new()), config).await
}

/// Open an engine over `store`; the first poll sees whatever it already holds.
async fn open_with_store(store: Arc<MemoryMessageStore>, config: MessagerConfig) -> TestEnvironment {
    let schema = Arc::new(SchemaEngine::new(true));
    schema
        .apply(SchemaChange::created(
            vec![Arc::new(TableDescriptor::message(
                "t1",
                message_columns(&["message"]),
                MessageSettings::default(),
            ))],
            true,
        ))
        .await;

    let engine = Engine::new(schema, store.clone(), config);
    engine.open().await;
    TestEnvironment { store, engine }
}

fn fast_config() -> MessagerConfig {
    MessagerConfig {
        poller_interval_ms: 20,
        ack_wait_ms: 100,
        ..Default::default()
    }
}

fn message(id: &str) -> StoredMessage {
    StoredMessage::new(id, vec![Value::text(format!("payload {}", id))])
}

async fn recv(rx: &mut mpsc::Receiver<QueryResult>) -> QueryResult {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("receiver closed")
}

async fn recv_id(rx: &mut mpsc::Receiver<QueryResult>) -> String {
    let result = recv(rx).await;
    assert_eq!(result.rows.len(), 1);
    result.rows[0][0].to_key()
}

async fn subscribe(env: &TestEnvironment) -> (Subscription, mpsc::Receiver<QueryResult>) {
    let (receiver, mut rx) = ChannelReceiver::new(64);
    let subscription = env.engine.subscribe("t1", receiver).await.unwrap();
    let fields = recv(&mut rx).await;
    assert!(!fields.fields.is_empty());
    (subscription, rx)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_delivery_follows_priority_then_time() {
    let store = Arc::new(MemoryMessageStore::new());
    let base = now_nanos() - 1_000_000;
    store.insert("t1", message("c").with_priority(1).with_time_next(base));
    store.insert("t1", message("b").with_time_next(base));
    store.insert("t1", message("a").with_time_next(base - 10));

    let env = open_with_store(
        store,
        MessagerConfig {
            ack_wait_ms: 60_000,
            ..Default::default()
        },
    )
    .await;

    // the first poll runs immediately on open
    wait_until(|| env.engine.manager("t1").unwrap().stats().cached == 3).await;

    let (_subscription, mut rx) = subscribe(&env).await;
    assert_eq!(recv_id(&mut rx).await, "a");
    assert_eq!(recv_id(&mut rx).await, "b");
    assert_eq!(recv_id(&mut rx).await, "c");

    env.engine.close().await;
}

#[tokio::test]
async fn test_added_row_is_delivered() {
    let env = create_test_environment(MessagerConfig::default()).await;
    let (_subscription, mut rx) = subscribe(&env).await;

    env.store.insert("t1", message("1"));
    assert!(env.engine.add(
        "t1",
        MessageRow::new(vec![Value::text("1"), Value::text("payload 1")])
    ));

    let batch = recv(&mut rx).await;
    assert_eq!(
        batch.rows,
        vec![vec![Value::text("1"), Value::text("payload 1")]]
    );
    assert!(batch.fields.is_empty());

    // the delivery leased the row in storage
    wait_until(|| env.store.get("t1", "1").map(|m| m.epoch) == Some(1)).await;

    env.engine.close().await;
}

#[tokio::test]
async fn test_unsubscribed_receiver_gets_nothing() {
    let env = create_test_environment(MessagerConfig::default()).await;
    let (subscription, mut rx) = subscribe(&env).await;

    subscription.unsubscribe();
    assert!(env.engine.add("t1", MessageRow::new(vec![Value::text("2")])));

    assert!(rx.recv().await.is_none());
    assert_eq!(env.engine.manager("t1").unwrap().stats().cached, 1);

    env.engine.close().await;
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_after_lease() {
    let env = create_test_environment(fast_config()).await;
    let (_subscription, mut rx) = subscribe(&env).await;
    env.store.insert("t1", message("1"));

    assert_eq!(recv_id(&mut rx).await, "1");
    let first = Instant::now();

    assert_eq!(recv_id(&mut rx).await, "1");
    assert!(first.elapsed() >= Duration::from_millis(50));

    wait_until(|| env.store.get("t1", "1").map(|m| m.epoch) == Some(2)).await;

    env.engine.close().await;
}

#[tokio::test]
async fn test_acked_message_is_not_redelivered() {
    let env = create_test_environment(fast_config()).await;
    let (_subscription, mut rx) = subscribe(&env).await;
    env.store.insert("t1", message("1"));

    assert_eq!(recv_id(&mut rx).await, "1");
    let acked = env.engine.ack("t1", &[Value::text("1")]).await.unwrap();
    assert_eq!(acked, 1);

    let stored = env.store.get("t1", "1").unwrap();
    assert!(stored.is_acked());
    assert_eq!(stored.time_next, None);

    let redelivered = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
    assert!(redelivered.is_err(), "acked message was delivered again");

    // acking twice is harmless
    assert_eq!(env.engine.ack("t1", &[Value::text("1")]).await.unwrap(), 0);

    env.engine.close().await;
}

#[tokio::test]
async fn test_message_expires_after_max_epoch() {
    let env = create_test_environment(MessagerConfig {
        poller_interval_ms: 20,
        ack_wait_ms: 20,
        max_epoch: 2,
        ..Default::default()
    })
    .await;
    let (_subscription, mut rx) = subscribe(&env).await;
    env.store.insert("t1", message("1"));

    assert_eq!(recv_id(&mut rx).await, "1");
    assert_eq!(recv_id(&mut rx).await, "1");

    wait_until(|| env.store.get("t1", "1").is_some_and(|m| m.is_acked())).await;
    let stored = env.store.get("t1", "1").unwrap();
    assert_eq!(stored.epoch, 2);
    assert!(env.store.executed("expire") >= 1);

    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "expired message was delivered again");

    env.engine.close().await;
}

#[tokio::test]
async fn test_purger_removes_old_acked_rows() {
    let env = create_test_environment(MessagerConfig {
        purge_after_ms: 0,
        purge_interval_ms: 20,
        purge_batch_size: 1,
        ack_wait_ms: 60_000,
        ..Default::default()
    })
    .await;

    for id in ["old1", "old2", "old3"] {
        let mut acked = message(id);
        acked.time_next = None;
        acked.time_acked = Some(1);
        env.store.insert("t1", acked);
    }
    env.store.insert(
        "t1",
        message("pending").with_time_next(now_nanos() + 3_600_000_000_000),
    );

    wait_until(|| env.store.len("t1") == 1).await;
    assert!(env.store.get("t1", "pending").is_some());

    env.engine.close().await;
}

#[tokio::test]
async fn test_poll_recovers_from_storage_errors() {
    let store = Arc::new(MemoryMessageStore::new());
    store.insert("t1", message("1"));
    store.fail_next(2);

    let env = open_with_store(
        store,
        MessagerConfig {
            poller_interval_ms: 60_000,
            ..Default::default()
        },
    )
    .await;

    let (_subscription, mut rx) = subscribe(&env).await;
    assert_eq!(recv_id(&mut rx).await, "1");
    assert!(env.store.executed("load") >= 1);

    env.engine.close().await;
}

#[tokio::test]
async fn test_receivers_share_the_load() {
    let env = create_test_environment(MessagerConfig {
        ack_wait_ms: 60_000,
        ..Default::default()
    })
    .await;
    let (_sub_a, mut rx_a) = subscribe(&env).await;
    let (_sub_b, mut rx_b) = subscribe(&env).await;

    for id in ["1", "2", "3", "4"] {
        env.store.insert("t1", message(id));
        assert!(env.engine.add(
            "t1",
            MessageRow::new(vec![Value::text(id), Value::text(format!("payload {}", id))])
        ));
    }

    wait_until(|| env.store.executed("reschedule") >= 4).await;

    let mut a = 0;
    while rx_a.try_recv().is_ok() {
        a += 1;
    }
    let mut b = 0;
    while rx_b.try_recv().is_ok() {
        b += 1;
    }
    assert_eq!(a + b, 4);
    assert!(a >= 1 && b >= 1, "deliveries were not spread: {} / {}", a, b);

    env.engine.close().await;
}

#[tokio::test]
async fn test_not_primary_suppresses_delivery() {
    let env = create_test_environment(MessagerConfig::default()).await;
    let (_subscription, mut rx) = subscribe(&env).await;

    env.engine.schema_changed(&[], &[], &[], false).await;
    assert!(!env.engine.add("t1", MessageRow::new(vec![Value::text("1")])));

    let delivered = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(delivered.is_err());

    env.engine.close().await;
}
