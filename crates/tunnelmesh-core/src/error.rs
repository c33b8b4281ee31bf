//! Error types for tunnelmesh

use thiserror::Error;

/// Main error type for tunnelmesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// The secret a tunnel is derived from was empty
    #[error("Invalid secret: secret must not be empty")]
    InvalidSecret,

    /// Decryption failed (wrong key, reordered/corrupted/truncated fragments, bad tag)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Sync payload could not be parsed or violates the log schema
    #[error("Malformed import: {0}")]
    MalformedImport(String),

    /// The record is already part of the log (a no-op signal, not a fault)
    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Identity-related error (keys, signatures)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// The local hash chain does not match the stored records
    #[error("Hash chain broken at link {index}: {reason}")]
    ChainBroken {
        /// Position of the first bad link
        index: usize,
        /// What did not match
        reason: String,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshError {
    /// Whether this error came from the persistence layer.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            MeshError::Storage(_)
                | MeshError::Database(_)
                | MeshError::Transaction(_)
                | MeshError::Table(_)
                | MeshError::StorageOp(_)
                | MeshError::Commit(_)
                | MeshError::Io(_)
        )
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;
