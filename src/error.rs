//! Error types for corestore operations.
//!
//! Every public operation returns [`StoreResult<T>`], an alias for
//! `Result<T, StoreError>`. `StoreError` enumerates the taxonomy every
//! backend and component in this crate is expected to raise; callers
//! that want richer context should match on the variant rather than the
//! message.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// The error taxonomy shared by every component of the store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Empty/too-large key, negative ttl, unknown backend, malformed query.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Key absent on read or delete.
    #[error("key not found")]
    NotFound,

    /// Transaction `begin` called on an already-terminated handle.
    #[error("transaction already exists")]
    AlreadyExists,

    /// A derived path escaped the backend's root.
    #[error("path traversal attempt: {0}")]
    PathTraversal(String),

    /// Value exceeds the backend's `max_value_size_bytes`.
    #[error("value of {actual} bytes exceeds backend limit of {limit} bytes")]
    ValueTooLarge { actual: usize, limit: usize },

    /// Disk/network I/O failure, protocol error, or pool exhaustion.
    #[error("backend I/O error: {0}")]
    BackendIO(String),

    /// Checksum mismatch in a backup archive or replication payload.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Nested transaction, double-commit, closed store, or write on a
    /// read-only secondary (see [`StoreError::ReadOnly`]).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Write attempted against a replication secondary.
    #[error("store is read-only (replication secondary)")]
    ReadOnly,

    /// Connection pool exhausted past its wait deadline.
    #[error("backend busy, pool exhausted")]
    Busy,

    /// Internal signal for a TTL-expired key encountered mid-read.
    /// Never escapes a public function; callers see [`StoreError::NotFound`].
    #[error("key expired")]
    Expired,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::BackendIO(err.to_string())
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::BackendIO(err.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::BackendIO(err.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::BackendIO(err.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::BackendIO(err.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::BackendIO(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StoreError::BackendIO(format!("encode error: {err}"))
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StoreError::BackendIO(format!("decode error: {err}"))
    }
}
