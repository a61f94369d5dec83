//! Error type shared by every layer of the filesystem

use crate::transaction::TxnState;
use crate::Revnum;

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur while reading, writing, dumping or loading a repository
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Malformed node id: '{0}'")]
    MalformedId(String),

    #[error("Malformed dump stream: {0}")]
    MalformedStream(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("No such revision: {0}")]
    NoSuchRevision(Revnum),

    #[error("Transaction is {0}, expected open")]
    InvalidTransactionState(TxnState),

    #[error("Conflict: '{path}' was changed in r{rev} after base r{base}")]
    Conflict { path: String, base: Revnum, rev: Revnum },

    #[error("Commit contains no changes")]
    EmptyCommit,

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("No such node version: {0}")]
    NoSuchNode(String),

    #[error("Path not found: '{0}'")]
    PathNotFound(String),

    #[error("Path already exists: '{0}'")]
    PathExists(String),

    #[error("Not a directory: '{0}'")]
    NotDirectory(String),

    #[error("Not a file: '{0}'")]
    NotFile(String),

    #[error("Invalid path: '{0}'")]
    InvalidPath(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl FsError {
    /// Whether the caller may re-open a transaction on the new youngest
    /// revision and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Conflict { .. })
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        FsError::MalformedStream(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        FsError::CorruptData(msg.into())
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        FsError::Database(e.to_string())
    }
}
