//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` covers application code driving a session through `SyncEngine`.
//! `advanced` exposes the building blocks for custom wiring and tests.

pub mod dx {
    //! Stable high-level surface for screens and view models.
    pub use crate::{
        Collection, CollectionScope, Identifier, Record, RecordPatch, Result, StoreEvent,
        SyncConfig, SyncEngine, SyncError, TriggerGroup, Value,
    };
}

pub mod advanced {
    //! Lower-level components, normally owned by `SyncEngine`.
    pub use crate::ledger::{OperationId, OperationKind, OperationStatus, PendingLedger};
    pub use crate::mutator::OptimisticMutator;
    pub use crate::reconciler::{Reconciler, ReconcilerHandle, ReconcilerStatus};
    pub use crate::remote::{
        MemoryRemote, PushEvent, PushSource, PushSubscription, RemoteClient, RemoteOp,
        SubscriptionHandle,
    };
    pub use crate::scheduler::{RefreshScheduler, ValidationDecision};
    pub use crate::state::{SharedState, SyncState};
    pub use crate::store::EntityStore;
}
