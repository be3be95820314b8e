use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during local store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds the database file lock
    #[error("Database {path:?} is in use by another process")]
    InUse { path: PathBuf },

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Failed to encode or decode stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}
