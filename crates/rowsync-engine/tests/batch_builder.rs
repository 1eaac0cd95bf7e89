//! Batch builder behavior through the public API

mod common;

use common::*;
use rowsync_engine::prelude::*;
use rowsync_rdbc::prelude::DmlType;
use std::sync::Arc;
use std::time::Duration;

struct Routing {
    store: Arc<MemoryEventStore>,
    registry: Arc<MemoryBatchRegistry>,
    lock: Arc<MemoryClusterLock>,
    builder: BatchBuilder,
}

fn routing(config: RoutingConfig) -> Routing {
    let store = Arc::new(MemoryEventStore::new());
    let registry = Arc::new(MemoryBatchRegistry::new());
    let lock = Arc::new(MemoryClusterLock::new());
    let builder = BatchBuilder::new(config, store.clone(), registry.clone(), lock.clone());
    Routing {
        store,
        registry,
        lock,
        builder,
    }
}

fn event(id: i64, transaction_id: &str) -> ChangeEvent {
    ChangeEvent::new(id, "sale", "orders", DmlType::Insert).with_transaction(transaction_id)
}

fn ids(store: &MemoryEventStore, node: &str, batch: &OutgoingBatch) -> Vec<i64> {
    store
        .batch_events(node, batch.batch_id)
        .iter()
        .map(|e| e.event_id)
        .collect()
}

#[tokio::test]
async fn test_transactions_are_not_split_at_the_size_limit() {
    init_test_logging();
    let r = routing(RoutingConfig::default());
    for (id, txn) in [(1, "T1"), (2, "T1"), (3, "T2"), (4, "T2"), (5, "T3")] {
        r.store.append("store-001", event(id, txn));
    }
    let channel = Channel::new("sale").with_max_batch_size(2);

    let first = r.builder.build_batches("store-001", &channel).await.unwrap().unwrap();
    assert_eq!(ids(&r.store, "store-001", &first), vec![1, 2, 3, 4]);

    let second = r.builder.build_batches("store-001", &channel).await.unwrap().unwrap();
    assert_eq!(ids(&r.store, "store-001", &second), vec![5]);

    assert!(r
        .builder
        .build_batches("store-001", &channel)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_batches_are_registered_as_new() {
    init_test_logging();
    let r = routing(RoutingConfig::default());
    for id in 1..=3 {
        r.store.append("store-001", event(id, "T1"));
    }
    r.store.append("store-002", event(4, "T9"));
    let channel = Channel::new("sale");

    let batch = r.builder.build_batches("store-001", &channel).await.unwrap().unwrap();
    r.builder.build_batches("store-002", &channel).await.unwrap().unwrap();

    let listed = r.registry.list_batches("store-001").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].batch_id, batch.batch_id);
    assert_eq!(listed[0].status, BatchStatus::New);
    assert_eq!(listed[0].event_count, 3);
    assert_eq!(listed[0].channel_id, "sale");
}

#[tokio::test]
async fn test_other_channels_are_left_for_their_own_batches() {
    init_test_logging();
    let r = routing(RoutingConfig::default());
    r.store.append("store-001", event(1, "T1"));
    r.store.append(
        "store-001",
        ChangeEvent::new(2, "config", "settings", DmlType::Update).with_transaction("T1"),
    );

    let batch = r
        .builder
        .build_batches("store-001", &Channel::new("sale"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(batch.event_count, 1);
    assert_eq!(r.store.batch_of("store-001", 2), None);
    assert_eq!(
        r.store.count_unbatched("store-001", "config").await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_small_flush_size_tags_every_event() {
    init_test_logging();
    let r = routing(RoutingConfig::default().with_tag_flush_size(2));
    for id in 1..=7 {
        r.store.append("store-001", event(id, "T1"));
    }

    let batch = r
        .builder
        .build_batches("store-001", &Channel::new("sale"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(batch.event_count, 7);
    assert_eq!(r.store.batch_events("store-001", batch.batch_id).len(), 7);
    assert_eq!(
        r.store.count_unbatched("store-001", "sale").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_run_is_skipped_while_another_router_holds_the_lock() {
    init_test_logging();
    let r = routing(RoutingConfig::default());
    r.store.append("store-001", event(1, "T1"));
    let channel = Channel::new("sale");

    assert!(r
        .lock
        .acquire("route:store-001:sale", Duration::ZERO)
        .await
        .unwrap());
    let outcome = r.builder.run("store-001", &channel).await.unwrap();
    assert!(outcome.is_skipped());
    assert!(r.registry.is_empty());

    r.lock.release("route:store-001:sale").await.unwrap();
    let outcome = r.builder.run("store-001", &channel).await.unwrap();
    assert_eq!(outcome.ran().flatten().map(|b| b.event_count), Some(1));
    assert!(!r.lock.is_held("route:store-001:sale"));
}
