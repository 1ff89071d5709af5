// ============================================================================
// Pending Operation Ledger Module
// ============================================================================
//
// Tracks optimistic mutations that have been applied locally but not yet
// confirmed by the remote store.
//
// Design Patterns Used:
// - State Pattern: InFlight -> Committed / RolledBack
// - Memento: previous snapshot kept for exact revert
//
// ============================================================================

pub mod manager;
pub mod operation;

pub use manager::PendingLedger;
pub use operation::{OperationId, OperationKind, OperationStatus, PendingOperation};
