/// Refresh scheduling tests
///
/// Debounced refresh passes and the validation gate, observed through the
/// number of queries reaching the backend.
/// Run with: cargo test --test scheduler_tests

use shigodeki_sync::{
    Collection, CollectionScope, Identifier, MemoryRemote, Record, RecordPatch, RemoteFailure,
    RemoteOp, SyncConfig, SyncEngine, TriggerGroup, ValidationDecision,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::assert_ok;

fn family(id: &str, name: &str) -> Record {
    Record::new(Identifier::from(id), Collection::Families)
        .with_field("name", name)
        .with_members(["u1"])
}

fn scope() -> CollectionScope {
    CollectionScope::member_of(Collection::Families, "u1")
}

fn engine_for(remote: &MemoryRemote) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_navigation_burst_issues_single_query() {
    let remote = MemoryRemote::new();
    remote.insert_document(family("f1", "Tanaka"));
    let engine = engine_for(&remote);

    for _ in 0..5 {
        engine.request_refresh(TriggerGroup::Navigation, scope());
        sleep(Duration::from_millis(40)).await;
    }
    sleep(Duration::from_millis(300)).await;

    assert_eq!(remote.calls(RemoteOp::Query), 1);
    assert!(engine.get(&Identifier::from("f1")).await.is_some());
    assert_eq!(engine.scheduled_work(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_generations_increase_per_request() {
    let remote = MemoryRemote::new();
    let engine = engine_for(&remote);

    let first = engine.request_refresh(TriggerGroup::Foreground, scope());
    let second = engine.request_refresh(TriggerGroup::Foreground, scope());
    assert!(second > first);
    assert_eq!(engine.scheduled_work(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_runs_at_most_once_per_interval() {
    let remote = MemoryRemote::new();
    let engine = engine_for(&remote);

    assert_eq!(engine.request_validation(scope()), ValidationDecision::Started);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.request_validation(scope()), ValidationDecision::Deferred);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.request_validation(scope()), ValidationDecision::Deferred);

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(remote.calls(RemoteOp::Query), 1);

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(remote.calls(RemoteOp::Query), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_defers_to_in_flight_update() {
    let remote = MemoryRemote::new();
    remote.insert_document(family("f1", "Tanaka"));
    let engine = engine_for(&remote);
    let f1 = Identifier::from("f1");

    engine.request_refresh(TriggerGroup::Navigation, scope());
    sleep(Duration::from_millis(200)).await;
    assert!(engine.get(&f1).await.is_some());

    remote.hold(RemoteOp::Update);
    let updating = {
        let engine = engine.clone();
        let f1 = f1.clone();
        tokio::spawn(async move { engine.update(&f1, RecordPatch::new().set("name", "Sato")).await })
    };
    remote.wait_for_calls(RemoteOp::Update, 1).await;

    engine.request_refresh(TriggerGroup::Navigation, scope());
    sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.calls(RemoteOp::Query), 2);
    assert_eq!(engine.get(&f1).await.unwrap().display_name(), Some("Sato"));

    remote.open(RemoteOp::Update);
    assert_ok!(updating.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_leaves_store_untouched() {
    let remote = MemoryRemote::new();
    remote.insert_document(family("f1", "Tanaka"));
    let engine = engine_for(&remote);

    engine.request_refresh(TriggerGroup::Navigation, scope());
    sleep(Duration::from_millis(200)).await;
    let before = engine.snapshot().await;

    remote.fail_next(RemoteOp::Query, RemoteFailure::transient("offline"));
    engine.request_refresh(TriggerGroup::Navigation, scope());
    sleep(Duration::from_millis(200)).await;

    assert_eq!(remote.calls(RemoteOp::Query), 2);
    assert_eq!(engine.snapshot().await, before);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_scheduled_work() {
    let remote = MemoryRemote::new();
    let engine = engine_for(&remote);

    engine.request_refresh(TriggerGroup::Navigation, scope());
    engine.request_refresh(TriggerGroup::Foreground, scope());
    engine.shutdown().await.unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(remote.calls(RemoteOp::Query), 0);
    assert_eq!(engine.scheduled_work(), 0);
}
