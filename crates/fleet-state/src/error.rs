//! Error types for the fleet state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the backend store.
#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or locked.
    #[error("cannot open state database: {0}")]
    Open(#[source] redb::DatabaseError),

    /// A transaction, table or page operation inside redb failed.
    #[error("state storage failed: {0}")]
    Storage(#[from] redb::Error),

    /// A record could not be encoded for storage.
    #[error("cannot encode record: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored record no longer decodes.
    #[error("corrupt stored record: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

macro_rules! storage_error {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StateError {
            fn from(e: $ty) -> Self {
                Self::Storage(e.into())
            }
        })*
    };
}

storage_error!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);
