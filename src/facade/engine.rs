use crate::config::SyncConfig;
use crate::core::{Collection, CollectionScope, Identifier, Record, RecordPatch, Result, SyncError};
use crate::mutator::OptimisticMutator;
use crate::reconciler::{Reconciler, ReconcilerHandle, ReconcilerStatus, merge_locked};
use crate::remote::{PushSource, RemoteClient};
use crate::scheduler::{RefreshScheduler, TriggerGroup, ValidationDecision};
use crate::state::{SharedState, SyncState};
use crate::store::{StoreSnapshot, StoreSubscription, SubscriptionId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Sync engine for one signed-in session
///
/// Owns the store, the pending ledger, the listeners and the scheduler.
/// There is no global instance; create one per session and call
/// `shutdown` at sign-out.
///
/// # Examples
///
/// ```
/// use shigodeki_sync::{Collection, CollectionScope, MemoryRemote, Record, SyncConfig, SyncEngine};
///
/// # tokio_test::block_on(async {
/// let engine = SyncEngine::with_backend(MemoryRemote::new(), SyncConfig::default()).unwrap();
/// engine
///     .start([CollectionScope::member_of(Collection::Families, "u1")])
///     .await;
///
/// let draft = Record::draft(Collection::Families)
///     .with_field("name", "Tanaka")
///     .with_members(["u1"]);
/// let family = engine.create(Collection::Families, draft).await.unwrap();
/// assert!(family.is_confirmed());
///
/// engine.shutdown().await.unwrap();
/// # });
/// ```
pub struct SyncEngine {
    config: SyncConfig,
    state: SharedState,
    remote: Arc<dyn RemoteClient>,
    push: Arc<dyn PushSource>,
    mutator: OptimisticMutator,
    scheduler: RefreshScheduler,
    reconcilers: Mutex<Vec<ReconcilerHandle>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        push: Arc<dyn PushSource>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let state = SyncState::shared(&config);
        let mutator = OptimisticMutator::new(state.clone(), remote.clone());
        let scheduler = RefreshScheduler::from_config(&config);

        Ok(Self {
            config,
            state,
            remote,
            push,
            mutator,
            scheduler,
            reconcilers: Mutex::new(Vec::new()),
        })
    }

    /// Uses one backend for both document calls and change streams.
    pub fn with_backend<B>(backend: B, config: SyncConfig) -> Result<Self>
    where
        B: RemoteClient + PushSource + 'static,
    {
        let backend = Arc::new(backend);
        Self::new(backend.clone(), backend, config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The shared state, for callers that need several reads under one lock.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns one listener per scope. Scopes already listened to are skipped.
    pub async fn start(&self, scopes: impl IntoIterator<Item = CollectionScope>) {
        let mut reconcilers = self.reconcilers.lock().await;
        for scope in scopes {
            if reconcilers.iter().any(|handle| handle.scope() == &scope) {
                event!(Level::DEBUG, scope = %scope, "listener already running");
                continue;
            }
            event!(Level::INFO, scope = %scope, "starting listener");
            reconcilers.push(Reconciler::spawn(
                scope,
                self.push.clone(),
                self.state.clone(),
                self.config.reconnect.clone(),
            ));
        }
    }

    /// Sign-out teardown.
    ///
    /// Stops every listener, cancels scheduled work and clears the store and
    /// ledger. Store subscriptions end after receiving `Cleared`.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<ReconcilerHandle> = self.reconcilers.lock().await.drain(..).collect();
        let mut first_error = None;
        for handle in handles {
            if let Err(err) = handle.stop().await {
                event!(Level::WARN, error = %err, "listener did not stop cleanly");
                first_error.get_or_insert(err);
            }
        }

        self.scheduler.cancel_all();
        self.state.lock().await.reset();
        event!(Level::INFO, "sync engine shut down");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn reconciler_status(&self, scope: &CollectionScope) -> Option<ReconcilerStatus> {
        self.reconcilers
            .lock()
            .await
            .iter()
            .find(|handle| handle.scope() == scope)
            .map(ReconcilerHandle::status)
    }

    pub async fn reconciler_statuses(&self) -> Vec<(CollectionScope, ReconcilerStatus)> {
        self.reconcilers
            .lock()
            .await
            .iter()
            .map(|handle| (handle.scope().clone(), handle.status()))
            .collect()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn create(&self, collection: Collection, draft: Record) -> Result<Record> {
        self.mutator.create(collection, draft).await
    }

    pub async fn update(&self, id: &Identifier, patch: RecordPatch) -> Result<Record> {
        self.mutator.update(id, patch).await
    }

    pub async fn delete(&self, id: &Identifier) -> Result<()> {
        self.mutator.delete(id).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current store contents, including unconfirmed records.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().await.store.snapshot()
    }

    /// Looks a record up, following a committed temporary id to its server id.
    pub async fn get(&self, id: &Identifier) -> Option<Record> {
        let state = self.state.lock().await;
        let id = state.resolve(id);
        state.store.get(&id).cloned()
    }

    pub async fn records_in(&self, scope: &CollectionScope) -> Vec<Record> {
        self.state.lock().await.store.records_in(scope)
    }

    pub async fn subscribe(&self) -> StoreSubscription {
        self.state.lock().await.store.subscribe()
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().await.store.unsubscribe(id)
    }

    pub async fn pending_operations(&self) -> usize {
        self.state.lock().await.ledger.in_flight_count()
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Debounced full pass over `scope`.
    pub fn request_refresh(&self, group: TriggerGroup, scope: CollectionScope) -> u64 {
        let state = self.state.clone();
        let remote = self.remote.clone();
        let span = info_span!("refresh", group = %group, scope = %scope);
        self.scheduler.schedule(group, move |token| {
            full_pass(state, remote, scope, token).instrument(span)
        })
    }

    /// Rate-limited full pass over `scope`.
    pub fn request_validation(&self, scope: CollectionScope) -> ValidationDecision {
        let state = self.state.clone();
        let remote = self.remote.clone();
        let key = scope.to_string();
        let span = info_span!("validation", scope = %scope);
        self.scheduler.schedule_validation(key, move |token| {
            full_pass(state, remote, scope, token).instrument(span)
        })
    }

    pub fn cancel_refresh(&self, group: &TriggerGroup) -> bool {
        self.scheduler.cancel(group)
    }

    pub fn scheduled_work(&self) -> usize {
        self.scheduler.pending_count()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Queries the scope and merges the result unless the token was cancelled.
async fn full_pass(
    state: SharedState,
    remote: Arc<dyn RemoteClient>,
    scope: CollectionScope,
    token: CancellationToken,
) {
    let result = tokio::select! {
        _ = token.cancelled() => return,
        result = remote.query(&scope) => result,
    };

    let records = match result {
        Ok(records) => records,
        Err(failure) => {
            let err = SyncError::from(failure);
            event!(Level::WARN, error = %err, "full pass failed");
            return;
        }
    };

    let mut state = state.lock().await;
    if token.is_cancelled() {
        event!(Level::DEBUG, "full pass cancelled before merge");
        return;
    }
    let report = merge_locked(&mut state, &scope, records);
    event!(
        Level::DEBUG,
        applied = report.applied.len(),
        removed = report.removed.len(),
        deferred = report.deferred.len(),
        "full pass merged"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteOp};
    use std::time::Duration;

    fn family(id: &str, name: &str) -> Record {
        Record::new(Identifier::from(id), Collection::Families)
            .with_field("name", name)
            .with_members(["u1"])
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SyncConfig::default().audit_capacity(0);
        let err = SyncEngine::with_backend(MemoryRemote::new(), config).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_skips_duplicate_scopes() {
        let remote = MemoryRemote::new();
        let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
        let scope = CollectionScope::member_of(Collection::Families, "u1");

        engine.start([scope.clone(), scope.clone()]).await;
        assert_eq!(engine.reconciler_statuses().await.len(), 1);

        engine.shutdown().await.unwrap();
        assert!(engine.reconciler_statuses().await.is_empty());
        assert_eq!(remote.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_pass_merges_remote_state() {
        let remote = MemoryRemote::new();
        remote.insert_document(family("f1", "Tanaka"));
        let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
        let scope = CollectionScope::member_of(Collection::Families, "u1");

        engine.request_refresh(TriggerGroup::Navigation, scope.clone());
        engine.request_refresh(TriggerGroup::Navigation, scope);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(remote.calls(RemoteOp::Query), 1);
        assert!(engine.get(&Identifier::from("f1")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_refresh_never_applies() {
        let remote = MemoryRemote::new();
        remote.insert_document(family("f1", "Tanaka"));
        remote.hold(RemoteOp::Query);
        let engine = SyncEngine::with_backend(remote.clone(), SyncConfig::default()).unwrap();
        let scope = CollectionScope::all(Collection::Families);

        engine.request_refresh(TriggerGroup::Foreground, scope);
        remote.wait_for_calls(RemoteOp::Query, 1).await;
        assert!(engine.cancel_refresh(&TriggerGroup::Foreground));
        remote.open(RemoteOp::Query);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let remote = MemoryRemote::new();
        let engine = SyncEngine::with_backend(remote, SyncConfig::default()).unwrap();
        let draft = Record::draft(Collection::Families)
            .with_field("name", "Tanaka")
            .with_members(["u1"]);
        engine.create(Collection::Families, draft).await.unwrap();
        assert_eq!(engine.snapshot().await.len(), 1);

        engine.shutdown().await.unwrap();
        assert!(engine.snapshot().await.is_empty());
        assert_eq!(engine.pending_operations().await, 0);
    }
}
