use super::{PushEvent, PushSource, PushSubscription, RemoteClient, SubscriptionHandle};
use crate::core::{Collection, CollectionScope, Identifier, Record, RecordPatch, RemoteFailure};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Create,
    Update,
    Delete,
    Query,
    Subscribe,
}

#[derive(Default)]
struct Subscriber {
    scope: Option<CollectionScope>,
    sender: Option<UnboundedSender<PushEvent>>,
}

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, Record>,
    next_id: u64,
    failures: HashMap<RemoteOp, VecDeque<RemoteFailure>>,
    gates: HashMap<RemoteOp, Arc<Semaphore>>,
    calls: HashMap<RemoteOp, usize>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    manual_push: bool,
}

struct Shared {
    state: Mutex<MemoryState>,
    call_made: Notify,
}

/// In-process document store implementing both remote traits.
///
/// Supports failure injection (`fail_next`), holding calls until released
/// (`hold` / `release` / `open`) and hand-fed push batches. Every successful
/// write pushes a fresh snapshot to matching subscribers unless
/// `set_manual_push(true)` was called.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState::default()),
                call_made: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds a server-side document.
    pub fn insert_document(&self, record: Record) {
        let collection = record.collection;
        {
            let mut state = self.lock();
            if let Some(id) = record.id.server_id() {
                state.documents.insert(id.to_string(), record);
            }
        }
        self.broadcast_changes(collection);
    }

    pub fn document(&self, id: &str) -> Option<Record> {
        self.lock().documents.get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Queues a failure for the next call of `op`.
    pub fn fail_next(&self, op: RemoteOp, failure: RemoteFailure) {
        self.lock().failures.entry(op).or_default().push_back(failure);
    }

    /// Blocks calls of `op` until permits are released.
    pub fn hold(&self, op: RemoteOp) {
        self.lock().gates.insert(op, Arc::new(Semaphore::new(0)));
    }

    /// Lets `calls` held calls of `op` proceed.
    pub fn release(&self, op: RemoteOp, calls: usize) {
        if let Some(gate) = self.lock().gates.get(&op) {
            gate.add_permits(calls);
        }
    }

    /// Removes the gate for `op`, letting every waiting call through.
    pub fn open(&self, op: RemoteOp) {
        if let Some(gate) = self.lock().gates.remove(&op) {
            gate.close();
        }
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Waits until at least `count` calls of `op` have started.
    pub async fn wait_for_calls(&self, op: RemoteOp, count: usize) {
        loop {
            let notified = self.shared.call_made.notified();
            if self.calls(op) >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn set_manual_push(&self, manual: bool) {
        self.lock().manual_push = manual;
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .subscribers
            .values()
            .filter(|sub| sub.sender.is_some())
            .count()
    }

    /// Sends `records` as a batch to every subscriber of exactly `scope`.
    pub fn push_batch(&self, scope: &CollectionScope, records: Vec<Record>) {
        self.push_to(scope, PushEvent::Batch(records));
    }

    pub fn push_error(&self, scope: &CollectionScope, failure: RemoteFailure) {
        self.push_to(scope, PushEvent::Error(failure));
    }

    /// Ends every open stream, as a dropped connection would.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        for subscriber in state.subscribers.values_mut() {
            subscriber.sender = None;
        }
    }

    fn push_to(&self, scope: &CollectionScope, event: PushEvent) {
        let state = self.lock();
        for subscriber in state.subscribers.values() {
            if subscriber.scope.as_ref() == Some(scope) {
                if let Some(sender) = &subscriber.sender {
                    let _ = sender.unbounded_send(event.clone());
                }
            }
        }
    }

    fn broadcast_changes(&self, collection: Collection) {
        let state = self.lock();
        if state.manual_push {
            return;
        }
        for subscriber in state.subscribers.values() {
            let (Some(scope), Some(sender)) = (&subscriber.scope, &subscriber.sender) else {
                continue;
            };
            if scope.collection != collection {
                continue;
            }
            let batch = documents_in(&state.documents, scope);
            let _ = sender.unbounded_send(PushEvent::Batch(batch));
        }
    }

    async fn enter(&self, op: RemoteOp) -> Result<(), RemoteFailure> {
        let gate = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.gates.get(&op).cloned()
        };
        self.shared.call_made.notify_waiters();

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

fn documents_in(documents: &BTreeMap<String, Record>, scope: &CollectionScope) -> Vec<Record> {
    documents
        .values()
        .filter(|record| scope.contains(record))
        .cloned()
        .collect()
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn create(
        &self,
        collection: Collection,
        draft: &Record,
    ) -> Result<String, RemoteFailure> {
        self.enter(RemoteOp::Create).await?;

        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("srv-{}", state.next_id);
            let mut record = draft.clone();
            record.id = Identifier::confirmed(id.clone());
            record.collection = collection;
            record.created_at.get_or_insert_with(Utc::now);
            state.documents.insert(id.clone(), record);
            id
        };
        self.broadcast_changes(collection);
        Ok(id)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &RecordPatch,
    ) -> Result<(), RemoteFailure> {
        self.enter(RemoteOp::Update).await?;

        {
            let mut state = self.lock();
            let current = state
                .documents
                .get(id)
                .ok_or_else(|| RemoteFailure::permanent(format!("document {} not found", id)))?;
            let next = patch.apply_to(current, Utc::now());
            state.documents.insert(id.to_string(), next);
        }
        self.broadcast_changes(collection);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteFailure> {
        self.enter(RemoteOp::Delete).await?;

        {
            let mut state = self.lock();
            if state.documents.remove(id).is_none() {
                return Err(RemoteFailure::permanent(format!("document {} not found", id)));
            }
        }
        self.broadcast_changes(collection);
        Ok(())
    }

    async fn query(&self, scope: &CollectionScope) -> Result<Vec<Record>, RemoteFailure> {
        self.enter(RemoteOp::Query).await?;
        Ok(documents_in(&self.lock().documents, scope))
    }
}

#[async_trait]
impl PushSource for MemoryRemote {
    async fn subscribe(&self, scope: &CollectionScope) -> Result<PushSubscription, RemoteFailure> {
        self.enter(RemoteOp::Subscribe).await?;

        let (tx, rx) = unbounded();
        let subscriber_id = {
            let mut state = self.lock();
            state.next_subscriber += 1;
            let subscriber_id = state.next_subscriber;

            // Catch-up snapshot, as a fresh listener would receive.
            let _ = tx.unbounded_send(PushEvent::Batch(documents_in(&state.documents, scope)));
            state.subscribers.insert(
                subscriber_id,
                Subscriber {
                    scope: Some(scope.clone()),
                    sender: Some(tx),
                },
            );
            subscriber_id
        };

        let remote = self.clone();
        let handle = SubscriptionHandle::new(move || {
            remote.lock().subscribers.remove(&subscriber_id);
        });

        Ok(PushSubscription {
            events: rx.boxed(),
            handle,
        })
    }
}
