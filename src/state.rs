use crate::config::SyncConfig;
use crate::core::{Identifier, LocalToken, SyncError};
use crate::ledger::PendingLedger;
use crate::mutator::DuplicateGuard;
use crate::store::EntityStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};

/// How an in-flight create ended, as seen by a delete waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CreateOutcome {
    Confirmed(String),
    Failed,
}

/// Everything the engine mutates, owned by one logical context.
///
/// Background tasks (remote calls, listeners, refresh passes) never touch
/// these maps directly; they take the lock, post their result and leave.
/// The lock is never held across a remote call.
#[derive(Debug)]
pub struct SyncState {
    pub store: EntityStore,
    pub ledger: PendingLedger,
    aliases: HashMap<LocalToken, String>,
    create_waiters: HashMap<LocalToken, Vec<oneshot::Sender<CreateOutcome>>>,
    pub(crate) duplicates: DuplicateGuard,
}

pub type SharedState = Arc<Mutex<SyncState>>;

impl SyncState {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            store: EntityStore::new(),
            ledger: PendingLedger::new(config.audit_capacity, config.commit_grace_duration()),
            aliases: HashMap::new(),
            create_waiters: HashMap::new(),
            duplicates: DuplicateGuard::new(config.duplicate_window_duration()),
        }
    }

    pub fn shared(config: &SyncConfig) -> SharedState {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Maps a temporary id whose create already committed to its server id.
    pub fn resolve(&self, id: &Identifier) -> Identifier {
        match id {
            Identifier::Pending(token) => match self.aliases.get(token) {
                Some(server_id) => Identifier::Confirmed(server_id.clone()),
                None => id.clone(),
            },
            Identifier::Confirmed(_) => id.clone(),
        }
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    pub(crate) fn record_alias(&mut self, token: LocalToken, server_id: String) {
        self.aliases.insert(token, server_id);
    }

    /// Drops the temporary ids pointing at a record that no longer exists.
    pub(crate) fn forget_aliases_of(&mut self, server_id: &str) {
        self.aliases.retain(|_, aliased| aliased != server_id);
    }

    pub(crate) fn await_create(&mut self, token: LocalToken) -> oneshot::Receiver<CreateOutcome> {
        let (tx, rx) = oneshot::channel();
        self.create_waiters.entry(token).or_default().push(tx);
        rx
    }

    pub(crate) fn resolve_create(&mut self, token: LocalToken, outcome: CreateOutcome) {
        if let Some(waiters) = self.create_waiters.remove(&token) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Conflict for a mutation aimed at a target another operation still owns.
    pub(crate) fn in_flight_conflict(&self, target: &Identifier) -> Option<SyncError> {
        self.ledger
            .in_flight_for(target)
            .map(|op| SyncError::Conflict {
                target: target.to_string(),
                operation: op.id().to_string(),
            })
    }

    /// Sign-out teardown: drops records, ledger entries, aliases and waiters.
    pub fn reset(&mut self) {
        self.store.clear();
        self.store.close_observers();
        self.ledger.clear();
        self.aliases.clear();
        for (_, waiters) in self.create_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(CreateOutcome::Failed);
            }
        }
        self.duplicates.clear();
    }
}
