// ============================================================================
// Pending Operation Ledger
// ============================================================================

use super::{OperationId, OperationKind, OperationStatus, PendingOperation};
use crate::core::{Collection, Identifier, Record, Result, SyncError};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Level, event};

/// Bookkeeping for in-flight optimistic operations.
///
/// Only in-flight entries are retained. Finalized entries move to a bounded
/// audit trail, and committed targets are remembered for the commit grace
/// window so that a lagging authoritative snapshot cannot drop them.
#[derive(Debug)]
pub struct PendingLedger {
    entries: HashMap<OperationId, PendingOperation>,
    by_target: HashMap<Identifier, OperationId>,
    audit: VecDeque<PendingOperation>,
    audit_capacity: usize,
    recently_committed: HashMap<Identifier, Instant>,
    commit_grace: Duration,
    next_id: u64,
}

impl Default for PendingLedger {
    fn default() -> Self {
        Self::new(32, Duration::from_secs(5))
    }
}

impl PendingLedger {
    pub fn new(audit_capacity: usize, commit_grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_target: HashMap::new(),
            audit: VecDeque::with_capacity(audit_capacity),
            audit_capacity,
            recently_committed: HashMap::new(),
            commit_grace,
            next_id: 1,
        }
    }

    /// Registers an in-flight operation for `target`.
    ///
    /// A delete supersedes whatever is in flight for the target: the earlier
    /// entry is rolled back in the ledger and, when it was an update, its
    /// last-confirmed snapshot replaces `previous`. Any other kind conflicts.
    pub fn begin(
        &mut self,
        target: Identifier,
        collection: Collection,
        kind: OperationKind,
        previous: Option<Record>,
    ) -> Result<OperationId> {
        let mut previous = previous;

        if let Some(existing_id) = self.by_target.get(&target).copied() {
            if kind != OperationKind::Delete {
                event!(
                    Level::WARN,
                    target = %target,
                    operation = %existing_id,
                    "rejecting overlapping mutation"
                );
                return Err(SyncError::Conflict {
                    target: target.to_string(),
                    operation: existing_id.to_string(),
                });
            }

            let superseded = self.finalize(existing_id, OperationStatus::RolledBack)?;
            event!(
                Level::DEBUG,
                target = %target,
                superseded = %existing_id,
                superseded_kind = %superseded.kind,
                "delete supersedes in-flight operation"
            );
            previous = match superseded.kind {
                OperationKind::Create => None,
                OperationKind::Update | OperationKind::Delete => superseded.previous_snapshot,
            };
        }

        let id = OperationId(self.next_id);
        self.next_id += 1;

        self.by_target.insert(target.clone(), id);
        self.entries
            .insert(id, PendingOperation::new(id, target, collection, kind, previous));
        Ok(id)
    }

    /// Marks the operation committed and prunes it.
    pub fn commit(&mut self, id: OperationId) -> Result<()> {
        let committed = self.finalize(id, OperationStatus::Committed)?;
        match committed.kind {
            OperationKind::Create | OperationKind::Update => {
                self.recently_committed
                    .insert(committed.target.clone(), Instant::now());
            }
            OperationKind::Delete => {
                self.recently_committed.remove(&committed.target);
            }
        }
        Ok(())
    }

    /// Marks the operation rolled back and returns the snapshot to restore.
    ///
    /// `None` means the optimistic record has no confirmed predecessor and
    /// should be removed.
    pub fn rollback(&mut self, id: OperationId) -> Result<Option<Record>> {
        let mut rolled_back = self.finalize(id, OperationStatus::RolledBack)?;
        Ok(rolled_back.previous_snapshot.take())
    }

    /// Moves in-flight and grace bookkeeping from a temporary id to a server id.
    pub fn retarget(&mut self, from: &Identifier, to: Identifier) -> bool {
        if let Some(at) = self.recently_committed.remove(from) {
            self.recently_committed.insert(to.clone(), at);
        }

        let Some(id) = self.by_target.remove(from) else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.target = to.clone();
        }
        self.by_target.insert(to, id);
        true
    }

    /// Gives the in-flight operation on `target` a snapshot to restore on
    /// rollback, unless it already carries one.
    pub fn set_restore_point(&mut self, target: &Identifier, snapshot: Record) -> bool {
        let Some(id) = self.by_target.get(target).copied() else {
            return false;
        };
        match self.entries.get_mut(&id) {
            Some(entry) if entry.previous_snapshot.is_none() => {
                entry.previous_snapshot = Some(snapshot);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.entries.get(&id)
    }

    /// Status of a live or recently finalized operation.
    pub fn status(&self, id: OperationId) -> Option<OperationStatus> {
        if let Some(entry) = self.entries.get(&id) {
            return Some(entry.status);
        }
        self.audit
            .iter()
            .rev()
            .find(|entry| entry.id == id)
            .map(|entry| entry.status)
    }

    pub fn is_operation_in_flight(&self, id: OperationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn in_flight_for(&self, target: &Identifier) -> Option<&PendingOperation> {
        self.by_target
            .get(target)
            .and_then(|id| self.entries.get(id))
    }

    pub fn is_in_flight(&self, target: &Identifier) -> bool {
        self.by_target.contains_key(target)
    }

    pub fn is_recently_committed(&self, target: &Identifier) -> bool {
        self.recently_committed
            .get(target)
            .is_some_and(|at| at.elapsed() < self.commit_grace)
    }

    /// Drops grace entries older than the commit grace window.
    pub fn sweep_grace(&mut self) {
        let grace = self.commit_grace;
        self.recently_committed.retain(|_, at| at.elapsed() < grace);
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries.len()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &PendingOperation> {
        self.entries.values()
    }

    pub fn audit(&self) -> impl Iterator<Item = &PendingOperation> {
        self.audit.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_target.clear();
        self.audit.clear();
        self.recently_committed.clear();
    }

    fn finalize(&mut self, id: OperationId, status: OperationStatus) -> Result<PendingOperation> {
        let mut entry = self.entries.remove(&id).ok_or_else(|| {
            SyncError::NotFound(format!("operation {} is unknown or already finalized", id))
        })?;

        if self.by_target.get(&entry.target) == Some(&id) {
            self.by_target.remove(&entry.target);
        }
        entry.status = status;

        if self.audit_capacity > 0 {
            if self.audit.len() == self.audit_capacity {
                self.audit.pop_front();
            }
            let mut trail = entry.clone();
            trail.previous_snapshot = None;
            self.audit.push_back(trail);
        }

        event!(
            Level::DEBUG,
            operation = %id,
            kind = %entry.kind,
            target = %entry.target,
            status = %status,
            "operation finalized"
        );
        Ok(entry)
    }
}
