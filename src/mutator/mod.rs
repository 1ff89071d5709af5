// ============================================================================
// Optimistic Mutator
// ============================================================================
//
// Per mutation:
//
//   Proposed ──validate──> Applied ──remote ok──> Committed
//                             │
//                             └──remote err──> RolledBack (store reverted)
//
// Overlap policy: a create/update aimed at a target that already has an
// in-flight operation is rejected with Conflict before any store change.
// A delete supersedes the in-flight operation instead.
//
// ============================================================================

pub mod duplicate;
pub mod validation;

pub use duplicate::DuplicateGuard;

use crate::core::{Collection, Identifier, LocalToken, Record, RecordPatch, Result, SyncError};
use crate::ledger::{OperationId, OperationKind};
use crate::remote::RemoteClient;
use crate::state::{CreateOutcome, SharedState};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{Instrument, Level, event, info_span};

/// Where the remote half of a delete should go.
enum DeleteTarget {
    Server(String),
    /// Unconfirmed record whose create is still in flight.
    AwaitCreate(oneshot::Receiver<CreateOutcome>),
    /// Unconfirmed record that never reached the server.
    LocalOnly,
}

#[derive(Clone)]
pub struct OptimisticMutator {
    state: SharedState,
    remote: Arc<dyn RemoteClient>,
}

impl OptimisticMutator {
    pub fn new(state: SharedState, remote: Arc<dyn RemoteClient>) -> Self {
        Self { state, remote }
    }

    /// Optimistically creates `draft` and returns the confirmed record.
    ///
    /// The draft shows up in the store under its `Pending` id immediately.
    /// On success it is moved to the server id; on failure it disappears.
    /// If a delete superseded the create while it was in flight, the result
    /// is `SyncError::Cancelled` and the server id is handed to that delete.
    pub async fn create(&self, collection: Collection, draft: Record) -> Result<Record> {
        let draft = validation::prepare_draft(collection, draft, Utc::now())?;
        let Some(token) = draft.id.local_token() else {
            return Err(SyncError::Validation("draft must carry a pending id".to_string()));
        };
        let key = DuplicateGuard::key_for(collection, &draft);

        let op = {
            let mut state = self.state.lock().await;
            state.duplicates.begin(&key)?;
            let op = match state
                .ledger
                .begin(draft.id.clone(), collection, OperationKind::Create, None)
            {
                Ok(op) => op,
                Err(err) => {
                    state.duplicates.finish(&key);
                    return Err(err);
                }
            };
            state.store.upsert(draft.clone());
            op
        };

        let span = info_span!("mutation", kind = "create", target = %draft.id, operation = %op);
        self.complete_create(op, token, key, draft)
            .instrument(span)
            .await
    }

    async fn complete_create(
        &self,
        op: OperationId,
        token: LocalToken,
        key: String,
        draft: Record,
    ) -> Result<Record> {
        let collection = draft.collection;
        let temp = draft.id.clone();
        event!(Level::DEBUG, "optimistic create applied");

        let result = self.remote.create(collection, &draft).await;

        let mut state = self.state.lock().await;
        state.duplicates.finish(&key);
        let superseded = !state.ledger.is_operation_in_flight(op);

        let server_id = match result {
            Ok(server_id) => server_id,
            Err(failure) => {
                let err = SyncError::from(failure);
                if !superseded {
                    state.store.remove(&temp);
                    state.ledger.rollback(op)?;
                    event!(Level::WARN, error = %err, "create rolled back");
                }
                state.resolve_create(token, CreateOutcome::Failed);
                return Err(err);
            }
        };

        let confirmed = Identifier::Confirmed(server_id.clone());
        state.record_alias(token, server_id.clone());
        // Every in-flight reference moves to the server id in this critical section.
        state.ledger.retarget(&temp, confirmed.clone());

        if superseded {
            event!(
                Level::DEBUG,
                server_id = %server_id,
                "create superseded while in flight; handing server id to delete"
            );
            // The record now exists on the server; a failed delete must bring it back.
            let mut landed = draft;
            landed.id = confirmed.clone();
            state.ledger.set_restore_point(&confirmed, landed);
            state.resolve_create(token, CreateOutcome::Confirmed(server_id));
            return Err(SyncError::Cancelled);
        }

        let landed = match state.store.rekey(&temp, confirmed) {
            Ok(landed) => landed,
            Err(err) => {
                state.ledger.rollback(op)?;
                return Err(err);
            }
        };
        state.ledger.commit(op)?;
        state.resolve_create(token, CreateOutcome::Confirmed(server_id));
        event!(Level::INFO, id = %landed.id, "create committed");
        Ok(landed)
    }

    /// Optimistically applies `patch` to the record and returns the result.
    ///
    /// On remote failure the record is restored field-by-field to the state
    /// captured before the patch.
    pub async fn update(&self, id: &Identifier, patch: RecordPatch) -> Result<Record> {
        if patch.is_empty() {
            return Err(SyncError::Validation("patch is empty".to_string()));
        }

        let (op, next, server_id) = {
            let mut state = self.state.lock().await;
            let target = state.resolve(id);
            if let Some(err) = state.in_flight_conflict(&target) {
                return Err(err);
            }
            let current = state.store.get(&target).cloned().ok_or_else(|| {
                SyncError::Validation(format!("record {} is not in the store", target))
            })?;
            let Some(server_id) = target.server_id().map(str::to_string) else {
                return Err(SyncError::Validation(format!(
                    "record {} is not confirmed yet",
                    target
                )));
            };

            let next = patch.apply_to(&current, Utc::now());
            validation::check_record(&next)?;

            let op = state.ledger.begin(
                target,
                current.collection,
                OperationKind::Update,
                Some(current),
            )?;
            state.store.upsert(next.clone());
            (op, next, server_id)
        };

        let span = info_span!("mutation", kind = "update", target = %next.id, operation = %op);
        self.complete_update(op, server_id, patch, next)
            .instrument(span)
            .await
    }

    async fn complete_update(
        &self,
        op: OperationId,
        server_id: String,
        patch: RecordPatch,
        next: Record,
    ) -> Result<Record> {
        let result = self.remote.update(next.collection, &server_id, &patch).await;

        let mut state = self.state.lock().await;
        if !state.ledger.is_operation_in_flight(op) {
            event!(Level::DEBUG, "update superseded while in flight; leaving store alone");
            return Err(SyncError::Cancelled);
        }

        match result {
            Ok(()) => {
                state.ledger.commit(op)?;
                event!(Level::INFO, "update committed");
                Ok(state.store.get(&next.id).cloned().unwrap_or(next))
            }
            Err(failure) => {
                let err = SyncError::from(failure);
                if let Some(previous) = state.ledger.rollback(op)? {
                    state.store.upsert(previous);
                }
                event!(Level::WARN, error = %err, "update rolled back");
                Err(err)
            }
        }
    }

    /// Optimistically deletes the record.
    ///
    /// Supersedes any in-flight operation on the same record. Deleting a
    /// record whose create is still in flight waits for the server id first.
    pub async fn delete(&self, id: &Identifier) -> Result<()> {
        let (op, target, collection, delete_target) = {
            let mut state = self.state.lock().await;
            let target = state.resolve(id);
            let current = state.store.get(&target).cloned().ok_or_else(|| {
                SyncError::Validation(format!("record {} is not in the store", target))
            })?;
            let collection = current.collection;
            let superseding_create = state
                .ledger
                .in_flight_for(&target)
                .is_some_and(|prior| prior.kind() == OperationKind::Create);

            let op = state.ledger.begin(
                target.clone(),
                collection,
                OperationKind::Delete,
                Some(current),
            )?;
            state.store.remove(&target);

            let delete_target = match &target {
                Identifier::Confirmed(server_id) => DeleteTarget::Server(server_id.clone()),
                Identifier::Pending(token) if superseding_create => {
                    DeleteTarget::AwaitCreate(state.await_create(*token))
                }
                Identifier::Pending(_) => DeleteTarget::LocalOnly,
            };
            (op, target, collection, delete_target)
        };

        let span = info_span!("mutation", kind = "delete", target = %target, operation = %op);
        self.complete_delete(op, collection, delete_target)
            .instrument(span)
            .await
    }

    async fn complete_delete(
        &self,
        op: OperationId,
        collection: Collection,
        delete_target: DeleteTarget,
    ) -> Result<()> {
        let server_id = match delete_target {
            DeleteTarget::Server(server_id) => server_id,
            DeleteTarget::AwaitCreate(outcome) => match outcome.await {
                Ok(CreateOutcome::Confirmed(server_id)) => server_id,
                Ok(CreateOutcome::Failed) | Err(_) => {
                    event!(Level::DEBUG, "create never reached the server; delete is local only");
                    return self.finish_local_delete(op).await;
                }
            },
            DeleteTarget::LocalOnly => return self.finish_local_delete(op).await,
        };

        let result = self.remote.delete(collection, &server_id).await;

        let mut state = self.state.lock().await;
        if !state.ledger.is_operation_in_flight(op) {
            return Err(SyncError::Cancelled);
        }

        match result {
            Ok(()) => {
                state.ledger.commit(op)?;
                state.forget_aliases_of(&server_id);
                event!(Level::INFO, server_id = %server_id, "delete committed");
                Ok(())
            }
            Err(failure) => {
                let err = SyncError::from(failure);
                if let Some(previous) = state.ledger.rollback(op)? {
                    state.store.upsert(previous);
                }
                event!(Level::WARN, error = %err, "delete rolled back");
                Err(err)
            }
        }
    }

    async fn finish_local_delete(&self, op: OperationId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.ledger.is_operation_in_flight(op) {
            state.ledger.commit(op)?;
        }
        Ok(())
    }
}
