// ============================================================================
// Pending Operation State
// ============================================================================
//
// Every optimistic mutation is tracked as a PendingOperation that moves
// through InFlight -> Committed/RolledBack. The previous snapshot it carries
// is what makes an exact revert possible.
//
// ============================================================================

use crate::core::{Collection, Identifier, Record};
use chrono::{DateTime, Utc};
use std::fmt;

/// Unique identifier for a pending operation, assigned by its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Operation status
///
/// State transitions:
/// ```text
/// InFlight ──commit──> Committed
///   │
///   └──rollback / supersede──> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InFlight,
    Committed,
    RolledBack,
}

impl OperationStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, OperationStatus::InFlight)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Committed | OperationStatus::RolledBack
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::InFlight => write!(f, "IN_FLIGHT"),
            OperationStatus::Committed => write!(f, "COMMITTED"),
            OperationStatus::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub(crate) id: OperationId,
    pub(crate) target: Identifier,
    pub(crate) collection: Collection,
    pub(crate) kind: OperationKind,
    /// State to restore on rollback; `None` for creates.
    pub(crate) previous_snapshot: Option<Record>,
    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) status: OperationStatus,
}

impl PendingOperation {
    pub(crate) fn new(
        id: OperationId,
        target: Identifier,
        collection: Collection,
        kind: OperationKind,
        previous_snapshot: Option<Record>,
    ) -> Self {
        Self {
            id,
            target,
            collection,
            kind,
            previous_snapshot,
            submitted_at: Utc::now(),
            status: OperationStatus::InFlight,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn target(&self) -> &Identifier {
        &self.target
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn previous_snapshot(&self) -> Option<&Record> {
        self.previous_snapshot.as_ref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_is_in_flight() {
        let op = PendingOperation::new(
            OperationId(7),
            Identifier::from("f1"),
            Collection::Families,
            OperationKind::Update,
            None,
        );
        assert!(op.status().is_in_flight());
        assert!(!op.status().is_terminal());
        assert_eq!(op.id().to_string(), "op_7");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OperationStatus::Committed.is_terminal());
        assert!(OperationStatus::RolledBack.is_terminal());
        assert_eq!(OperationStatus::RolledBack.to_string(), "ROLLED_BACK");
    }
}
