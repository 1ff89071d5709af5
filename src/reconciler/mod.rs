// ============================================================================
// Real-Time Reconciler
// ============================================================================
//
// One background task per subscribed collection scope:
//
//   Connecting ──subscribe ok──> Live ──error / stream end──> Reconnecting
//        ▲                                                        │
//        └──────────────────── backoff elapsed ───────────────────┘
//
// After `max_attempts` consecutive failures the task ends in Failed. A
// session only resets the count once it proves healthy: it delivered a
// change after its catch-up batch, or stayed connected for `stable_after`.
// Every batch is merged through `EntityStore::apply_authoritative`, which
// never overwrites records owned by an in-flight optimistic operation.
//
// ============================================================================

use crate::config::ReconnectPolicy;
use crate::core::{CollectionScope, Identifier, Record, Result, SyncError};
use crate::remote::{PushEvent, PushSource, PushSubscription};
use crate::state::{SharedState, SyncState};
use crate::store::ApplyReport;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerStatus {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Failed(String),
    Stopped,
}

impl ReconcilerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcilerStatus::Failed(_) | ReconcilerStatus::Stopped)
    }
}

impl fmt::Display for ReconcilerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilerStatus::Connecting => write!(f, "connecting"),
            ReconcilerStatus::Live => write!(f, "live"),
            ReconcilerStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ReconcilerStatus::Failed(reason) => write!(f, "failed: {}", reason),
            ReconcilerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct Reconciler;

impl Reconciler {
    /// Starts listening to `scope` and merging its batches into `state`.
    pub fn spawn(
        scope: CollectionScope,
        source: Arc<dyn PushSource>,
        state: SharedState,
        policy: ReconnectPolicy,
    ) -> ReconcilerHandle {
        let (status_tx, status_rx) = watch::channel(ReconcilerStatus::Connecting);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let span = info_span!("reconciler", scope = %scope);
        let worker = ListenWorker {
            scope: scope.clone(),
            source,
            state,
            policy,
            status_tx,
        };
        let join_handle = tokio::spawn(worker.run(stop_rx).instrument(span));

        ReconcilerHandle {
            scope,
            status_rx,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Owner of a running reconciler task.
///
/// `stop` ends the task and releases its subscription. Dropping the handle
/// aborts the task.
pub struct ReconcilerHandle {
    scope: CollectionScope,
    status_rx: watch::Receiver<ReconcilerStatus>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    pub fn scope(&self) -> &CollectionScope {
        &self.scope
    }

    pub fn status(&self) -> ReconcilerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ReconcilerStatus> {
        self.status_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await.map_err(|err| {
                SyncError::Reconciliation(format!("{} listener join: {}", self.scope, err))
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ReconcilerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerHandle")
            .field("scope", &self.scope)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

struct ListenWorker {
    scope: CollectionScope,
    source: Arc<dyn PushSource>,
    state: SharedState,
    policy: ReconnectPolicy,
    status_tx: watch::Sender<ReconcilerStatus>,
}

enum Session {
    Stopped,
    Lost { reason: String, healthy: bool },
}

impl ListenWorker {
    async fn run(self, mut stop_rx: oneshot::Receiver<()>) {
        let ceiling = self.policy.max_attempts.max(1);
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                _ = &mut stop_rx => break,
                result = self.source.subscribe(&self.scope) => result,
            };

            let reason = match subscribed {
                Ok(subscription) => {
                    self.status_tx.send_replace(ReconcilerStatus::Live);
                    event!(Level::INFO, "listener connected");

                    match self.listen(subscription, &mut stop_rx).await {
                        Session::Stopped => break,
                        Session::Lost { reason, healthy } => {
                            if healthy {
                                failures = 0;
                            }
                            reason
                        }
                    }
                }
                Err(failure) => failure.to_string(),
            };

            failures += 1;
            if failures >= ceiling {
                let err = SyncError::Reconciliation(format!(
                    "{}: gave up after {} attempts: {}",
                    self.scope, failures, reason
                ));
                event!(Level::WARN, error = %err, "listener failed");
                self.status_tx
                    .send_replace(ReconcilerStatus::Failed(err.to_string()));
                return;
            }

            let backoff = self.policy.backoff(failures);
            event!(
                Level::WARN,
                attempt = failures,
                backoff_ms = backoff.as_millis() as u64,
                reason = %reason,
                "listener lost; resubscribing"
            );
            self.status_tx
                .send_replace(ReconcilerStatus::Reconnecting { attempt: failures });

            tokio::select! {
                _ = &mut stop_rx => break,
                _ = sleep(backoff) => {}
            }
        }

        self.status_tx.send_replace(ReconcilerStatus::Stopped);
        event!(Level::INFO, "listener stopped");
    }

    async fn listen(
        &self,
        subscription: PushSubscription,
        stop_rx: &mut oneshot::Receiver<()>,
    ) -> Session {
        let PushSubscription { mut events, mut handle } = subscription;
        let connected_at = Instant::now();

        let session = tokio::select! {
            _ = stop_rx => Session::Stopped,
            (reason, batches) = self.pump(&mut events) => Session::Lost {
                reason,
                // The first batch is the catch-up snapshot.
                healthy: batches > 1 || connected_at.elapsed() >= self.policy.stable_after(),
            },
        };

        handle.unsubscribe();
        session
    }

    /// Merges batches until the stream reports an error or ends.
    ///
    /// Returns the reason the stream was lost and how many batches it delivered.
    async fn pump(&self, events: &mut BoxStream<'static, PushEvent>) -> (String, usize) {
        let mut batches = 0;
        while let Some(event) = events.next().await {
            match event {
                PushEvent::Batch(records) => {
                    batches += 1;
                    let report = apply_batch(&self.state, &self.scope, records).await;
                    event!(
                        Level::DEBUG,
                        applied = report.applied.len(),
                        removed = report.removed.len(),
                        deferred = report.deferred.len(),
                        retained = report.retained.len(),
                        "batch merged"
                    );
                }
                PushEvent::Error(failure) => return (failure.to_string(), batches),
            }
        }
        ("stream ended".to_string(), batches)
    }
}

/// Merges one authoritative result set of `scope` into the shared state.
pub(crate) async fn apply_batch(
    state: &SharedState,
    scope: &CollectionScope,
    records: Vec<Record>,
) -> ApplyReport {
    let mut guard = state.lock().await;
    merge_locked(&mut guard, scope, records)
}

/// Same as `apply_batch` for a caller already holding the lock.
pub(crate) fn merge_locked(
    state: &mut SyncState,
    scope: &CollectionScope,
    records: Vec<Record>,
) -> ApplyReport {
    let records = dedupe_last_wins(records);
    state.ledger.sweep_grace();
    let report = state.store.apply_authoritative(records, scope, &state.ledger);
    for id in &report.removed {
        if let Some(server_id) = id.server_id() {
            state.forget_aliases_of(server_id);
        }
    }
    report
}

fn dedupe_last_wins(records: Vec<Record>) -> Vec<Record> {
    let mut positions: HashMap<Identifier, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.id) {
            Some(&index) => unique[index] = record,
            None => {
                positions.insert(record.id.clone(), unique.len());
                unique.push(record);
            }
        }
    }
    unique
}
