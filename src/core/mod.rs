pub mod error;
pub mod record;
pub mod types;
pub mod value;

pub use error::{FailureKind, RemoteFailure, Result, SyncError};
pub use record::{Record, RecordPatch};
pub use types::{Collection, CollectionScope, Identifier, LocalToken, ScopeFilter};
pub use value::Value;
