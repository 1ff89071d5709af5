// ============================================================================
// Remote Store Boundary
// ============================================================================
//
// The engine never talks to a concrete backend. It depends on two traits:
// - RemoteClient: request/response document operations
// - PushSource:   real-time change streams per collection scope
//
// ============================================================================

pub mod memory;

use crate::core::{Collection, CollectionScope, Record, RecordPatch, RemoteFailure};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

pub use memory::{MemoryRemote, RemoteOp};

/// Document operations against the remote store.
///
/// Retry and backoff for individual calls are the implementor's business;
/// the engine only distinguishes transient from permanent failures.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Creates the document and returns its server-assigned id.
    async fn create(&self, collection: Collection, draft: &Record)
    -> Result<String, RemoteFailure>;

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &RecordPatch,
    ) -> Result<(), RemoteFailure>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteFailure>;

    async fn query(&self, scope: &CollectionScope) -> Result<Vec<Record>, RemoteFailure>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Full authoritative result set of the subscribed scope.
    Batch(Vec<Record>),
    Error(RemoteFailure),
}

/// Explicit registration handle for a push subscription.
///
/// `unsubscribe` is idempotent and also runs on drop.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

pub struct PushSubscription {
    pub events: BoxStream<'static, PushEvent>,
    pub handle: SubscriptionHandle,
}

impl fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSubscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Source of real-time change streams.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn subscribe(&self, scope: &CollectionScope) -> Result<PushSubscription, RemoteFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_handle_runs_cancel_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handle = SubscriptionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_active());
        handle.unsubscribe();
        handle.unsubscribe();
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_handle_unsubscribes_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        drop(SubscriptionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
