use thiserror::Error;

/// Whether a remote failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blip, timeout, unavailable backend.
    Transient,
    /// Rejected by the server (permissions, missing document, bad payload).
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure reported by a remote collaborator (`RemoteClient` / `PushSource`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} remote failure: {message}")]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate request: {0}")]
    Duplicate(String),

    #[error("Remote error ({kind}): {message}")]
    Remote { kind: FailureKind, message: String },

    #[error("Conflict: operation {operation} is already in flight for {target}")]
    Conflict { target: String, operation: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True for remote failures the backend classified as transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Remote {
                kind: FailureKind::Transient,
                ..
            }
        )
    }

    /// Errors after which the user may simply try the same action again.
    pub fn is_retryable_by_user(&self) -> bool {
        matches!(
            self,
            SyncError::Remote { .. } | SyncError::Conflict { .. } | SyncError::Duplicate(_)
        )
    }
}

impl From<RemoteFailure> for SyncError {
    fn from(err: RemoteFailure) -> Self {
        SyncError::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
