// ============================================================================
// Shigodeki Sync Library
// ============================================================================
//
// Optimistic mutation and reconciliation engine for a collaborative
// family / project / task store. Local writes are applied immediately,
// confirmed or reverted by the remote store, and merged with real-time
// snapshots without clobbering in-flight state.
//
// ============================================================================

pub mod config;
pub mod core;
pub mod facade;
pub mod ledger;
pub mod mutator;
pub mod prelude;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod state;
pub mod store;

// Re-export main types for convenience
pub use config::{DebounceConfig, ReconnectPolicy, SyncConfig};
pub use core::{
    Collection, CollectionScope, FailureKind, Identifier, LocalToken, Record, RecordPatch,
    RemoteFailure, Result, ScopeFilter, SyncError, Value,
};
pub use facade::SyncEngine;
pub use ledger::{OperationId, OperationKind, OperationStatus, PendingOperation};
pub use reconciler::ReconcilerStatus;
pub use remote::{MemoryRemote, PushEvent, PushSource, RemoteClient, RemoteOp};
pub use scheduler::{TriggerGroup, ValidationDecision};
pub use store::{ApplyReport, StoreChange, StoreEvent, StoreSnapshot, StoreSubscription};
