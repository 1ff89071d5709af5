/// Real-time reconciliation tests
///
/// Listener merges, retention of optimistic records and reconnect behavior.
/// Run with: cargo test --test reconciler_tests

use shigodeki_sync::{
    Collection, CollectionScope, Identifier, MemoryRemote, Record, ReconcilerStatus,
    ReconnectPolicy, RemoteClient, RemoteFailure, RemoteOp, SyncConfig, SyncEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn family(id: &str, name: &str) -> Record {
    Record::new(Identifier::from(id), Collection::Families)
        .with_field("name", name)
        .with_members(["u1"])
}

fn draft(name: &str) -> Record {
    Record::draft(Collection::Families)
        .with_field("name", name)
        .with_members(["u1"])
}

fn scope() -> CollectionScope {
    CollectionScope::member_of(Collection::Families, "u1")
}

async fn wait_for_status(
    engine: &SyncEngine,
    scope: &CollectionScope,
    predicate: impl Fn(&ReconcilerStatus) -> bool,
) -> ReconcilerStatus {
    loop {
        if let Some(status) = engine.reconciler_status(scope).await {
            if predicate(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_listener_follows_changes_from_other_clients() {
    let remote = MemoryRemote::new();
    let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
    let scope = scope();

    let mut events = engine.subscribe().await;
    engine.start([scope.clone()]).await;
    events.recv().await.unwrap();
    assert!(engine.snapshot().await.is_empty());

    remote.insert_document(family("f1", "Tanaka"));
    events.recv().await.unwrap();
    assert!(engine.get(&Identifier::from("f1")).await.is_some());

    assert_ok!(remote.delete(Collection::Families, "f1").await);
    events.recv().await.unwrap();
    assert!(engine.get(&Identifier::from("f1")).await.is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_records_outside_scope_are_ignored() {
    let remote = MemoryRemote::new();
    let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();

    let mut events = engine.subscribe().await;
    engine.start([scope()]).await;
    events.recv().await.unwrap();

    let stranger = Record::new(Identifier::from("f9"), Collection::Families)
        .with_field("name", "Suzuki")
        .with_members(["u7"]);
    remote.insert_document(stranger);
    remote.insert_document(family("f1", "Tanaka"));
    while engine.get(&Identifier::from("f1")).await.is_none() {
        events.recv().await.unwrap();
    }

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key(&Identifier::from("f1")));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_keeps_unconfirmed_records() {
    let remote = MemoryRemote::new();
    remote.set_manual_push(true);
    let engine = Arc::new(SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap());
    let scope = scope();

    let mut events = engine.subscribe().await;
    engine.start([scope.clone()]).await;
    events.recv().await.unwrap();

    remote.hold(RemoteOp::Create);
    let creating = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create(Collection::Families, draft("Tanaka")).await })
    };
    remote.wait_for_calls(RemoteOp::Create, 1).await;

    events.drain();
    remote.push_batch(&scope, Vec::new());
    events.recv().await.unwrap();

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.values().all(|record| !record.is_confirmed()));

    remote.open(RemoteOp::Create);
    assert_ok!(creating.await.unwrap());
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lagging_snapshot_keeps_recently_committed_record() {
    let remote = MemoryRemote::new();
    remote.set_manual_push(true);
    let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
    let scope = scope();

    let mut events = engine.subscribe().await;
    engine.start([scope.clone()]).await;
    events.recv().await.unwrap();

    let created = assert_ok!(engine.create(Collection::Families, draft("Tanaka")).await);

    // A snapshot taken before the write reached the server.
    events.drain();
    remote.push_batch(&scope, Vec::new());
    events.recv().await.unwrap();
    assert!(engine.get(&created.id).await.is_some());

    tokio::time::advance(Duration::from_secs(6)).await;
    remote.push_batch(&scope, Vec::new());
    events.recv().await.unwrap();
    assert!(engine.get(&created.id).await.is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_listener_reconnects_after_disconnect() {
    let remote = MemoryRemote::new();
    let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
    let scope = scope();

    engine.start([scope.clone()]).await;
    wait_for_status(&engine, &scope, |s| *s == ReconcilerStatus::Live).await;

    remote.disconnect_all();
    let status = wait_for_status(&engine, &scope, |s| {
        matches!(s, ReconcilerStatus::Reconnecting { .. })
    })
    .await;
    assert_eq!(status, ReconcilerStatus::Reconnecting { attempt: 1 });

    wait_for_status(&engine, &scope, |s| *s == ReconcilerStatus::Live).await;
    assert_eq!(remote.calls(RemoteOp::Subscribe), 2);

    let mut events = engine.subscribe().await;
    remote.insert_document(family("f1", "Tanaka"));
    events.recv().await.unwrap();
    assert!(engine.get(&Identifier::from("f1")).await.is_some());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_listener_gives_up_after_retry_ceiling() {
    let remote = MemoryRemote::new();
    for _ in 0..2 {
        remote.fail_next(RemoteOp::Subscribe, RemoteFailure::transient("unavailable"));
    }
    let config = SyncConfig::default().reconnect(ReconnectPolicy {
        max_attempts: 2,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        ..ReconnectPolicy::default()
    });
    let engine = SyncEngine::with_backend(remote.clone(), config).unwrap();
    let scope = scope();

    engine.start([scope.clone()]).await;
    let status = wait_for_status(&engine, &scope, ReconcilerStatus::is_terminal).await;

    assert!(matches!(status, ReconcilerStatus::Failed(_)));
    assert_eq!(remote.calls(RemoteOp::Subscribe), 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stream_failing_right_after_subscribe_gives_up() {
    let remote = MemoryRemote::new();
    let config = SyncConfig::default().reconnect(ReconnectPolicy {
        max_attempts: 3,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        stable_after_ms: 10_000,
    });
    let engine = SyncEngine::with_backend(remote.clone(), config).unwrap();
    let scope = scope();

    engine.start([scope.clone()]).await;
    for attempt in 1..=3u32 {
        wait_for_status(&engine, &scope, |s| *s == ReconcilerStatus::Live).await;
        remote.push_error(&scope, RemoteFailure::transient("stream reset"));
        if attempt < 3 {
            let status = wait_for_status(&engine, &scope, |s| {
                matches!(s, ReconcilerStatus::Reconnecting { .. })
            })
            .await;
            assert_eq!(status, ReconcilerStatus::Reconnecting { attempt });
        }
    }

    let status = wait_for_status(&engine, &scope, ReconcilerStatus::is_terminal).await;
    assert!(matches!(status, ReconcilerStatus::Failed(_)));
    assert_eq!(remote.calls(RemoteOp::Subscribe), 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_loss_keeps_store_contents() {
    let remote = MemoryRemote::new();
    remote.insert_document(family("f1", "Tanaka"));
    let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
    let scope = scope();

    let mut events = engine.subscribe().await;
    engine.start([scope.clone()]).await;
    events.recv().await.unwrap();

    remote.push_error(&scope, RemoteFailure::transient("socket closed"));
    wait_for_status(&engine, &scope, |s| {
        matches!(s, ReconcilerStatus::Reconnecting { .. })
    })
    .await;
    assert!(engine.get(&Identifier::from("f1")).await.is_some());

    wait_for_status(&engine, &scope, |s| *s == ReconcilerStatus::Live).await;
    assert!(engine.get(&Identifier::from("f1")).await.is_some());
    engine.shutdown().await.unwrap();
}
