//! Storage error handling
//!
//! Provides typed errors for storage operations with descriptive messages
//! and recovery suggestions, plus the `ErrorRecord` kept by the pool as the
//! last failure seen by any connection.

use std::fmt;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Input document is malformed or describes an invalid operation
    #[error("Invalid payload: {details}")]
    InvalidPayload { details: String },

    /// Table, row range or other named resource does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Snapshot id is not known for the table
    #[error("Snapshot '{id}' of table '{table}' not found")]
    SnapshotNotFound { table: String, id: String },

    /// Snapshot id is already taken for the table
    #[error("Snapshot '{id}' already exists for table '{table}'")]
    DuplicateSnapshot { table: String, id: String },

    /// The pool cannot create another backing session
    #[error("Connection pool exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// The pool has been shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The backing store lacks the capability for this operation
    #[error("Operation '{operation}' is not supported by the '{backend}' storage engine")]
    NotSupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// A connection was handed back to a pool that does not own it
    #[error("Connection released to a pool that does not own it")]
    ForeignConnection,

    /// Driver-level failure reported by a backing store
    #[error("Backing store error: {message}")]
    Backend { message: String, retryable: bool },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error taxonomy shared by every backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    DuplicateSnapshot,
    ResourceExhausted,
    PoolClosed,
    NotSupported,
    ForeignConnection,
    BackingStoreError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidPayload => "InvalidPayload",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::DuplicateSnapshot => "DuplicateSnapshot",
            ErrorCode::ResourceExhausted => "ResourceExhausted",
            ErrorCode::PoolClosed => "PoolClosed",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::ForeignConnection => "ForeignConnection",
            ErrorCode::BackingStoreError => "BackingStoreError",
        };
        f.write_str(name)
    }
}

impl StorageError {
    /// Shorthand for an `InvalidPayload` error
    pub fn invalid(details: impl Into<String>) -> Self {
        StorageError::InvalidPayload {
            details: details.into(),
        }
    }

    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::Io {
                path,
                source: error,
            },
        }
    }

    /// Map this error onto the shared taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::InvalidPayload { .. } => ErrorCode::InvalidPayload,
            StorageError::NotFound { .. } | StorageError::SnapshotNotFound { .. } => {
                ErrorCode::NotFound
            }
            StorageError::DuplicateSnapshot { .. } => ErrorCode::DuplicateSnapshot,
            StorageError::ResourceExhausted { .. } | StorageError::DiskFull { .. } => {
                ErrorCode::ResourceExhausted
            }
            StorageError::PoolClosed => ErrorCode::PoolClosed,
            StorageError::NotSupported { .. } => ErrorCode::NotSupported,
            StorageError::ForeignConnection => ErrorCode::ForeignConnection,
            StorageError::Backend { .. }
            | StorageError::PermissionDenied { .. }
            | StorageError::Database(_)
            | StorageError::Io { .. } => ErrorCode::BackingStoreError,
        }
    }

    /// Check if retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Backend { retryable, .. } => *retryable,
            StorageError::Database(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions of the data directory.")
            }
            StorageError::Io { .. } => {
                Some("Check that the data directory path exists and is a writable directory.")
            }
            StorageError::ResourceExhausted { .. } => {
                Some("Raise max_connections or the backing store's connection limit.")
            }
            StorageError::NotSupported { .. } => {
                Some("Query the engine capabilities before issuing this operation.")
            }
            _ if self.is_retryable() => Some("The store is busy; retry the operation."),
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::invalid(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Details of the most recent failed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Operation that failed (e.g. `reading_append`)
    pub operation: String,
    /// Taxonomy code
    pub code: ErrorCode,
    /// Human readable message
    pub message: String,
    /// Whether the same call may succeed if retried
    pub retryable: bool,
    /// When the failure was recorded
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(operation: impl Into<String>, error: &StorageError) -> Self {
        Self {
            operation: operation.into(),
            code: error.code(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            at: Utc::now(),
        }
    }
}
