//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`, which is what a worker loop sees.
//! Narrower enums cover the individual concerns:
//! - `SourceLocationError`: invalid source location parameters (never retried)
//! - `StateError`: rejected copy-state transitions
//! - `DatabaseError`: persistence failures
//! - `ProviderError`: storage/messaging provider failures
//! - `ConfigError`: configuration loading problems
//!
//! Per-file transfer failures are recorded on the file's copy state, not
//! surfaced as `EngineError`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::EngineInstance;
use crate::model::{StorageProviderType, SyncStatus};

/// Validation failures for a source location or a collection of them.
///
/// Single-location checks are reported in priority order: folder path,
/// file match filter, revision count, then id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceLocationError {
    /// Path is empty or (for local sources) does not exist.
    #[error("invalid folder path: '{path}'")]
    InvalidFolderPath { path: String },

    /// Filter is not empty, not `*`, and contains no wildcard.
    #[error("invalid file match filter: '{filter}'")]
    InvalidFileMatchFilter { filter: String },

    #[error("invalid revision count: {count}")]
    InvalidRevisionCount { count: i32 },

    #[error("invalid source location id: {id}")]
    InvalidId { id: i64 },

    /// Two locations in one collection share an id.
    #[error("duplicate source location id: {id}")]
    DuplicateId { id: i64 },

    /// `should_scan` was called without a scan frequency policy.
    #[error("a scan frequency policy must be provided")]
    MissingScanPolicy,
}

/// A copy-state transition the state machine refuses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cannot move copy state from {from:?} to {to:?}")]
    InvalidTransition { from: SyncStatus, to: SyncStatus },

    #[error("block {index} recorded out of order (expected block {expected})")]
    OutOfOrderBlock { index: i64, expected: i64 },

    #[error("block {index} is outside a file of {total} blocks")]
    BlockOutOfRange { index: i64, total: i64 },

    #[error("transfer incomplete: last completed block {last} of {total}")]
    IncompleteTransfer { last: i64, total: i64 },

    #[error("a diagnostic message is required to mark a copy as failed")]
    MissingFailureMessage,

    #[error("no copy state for provider {provider}")]
    MissingCopyState { provider: StorageProviderType },
}

/// Persistence layer failures.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("source location {id} was not found")]
    SourceLocationNotFound { id: i64 },

    #[error("backup file {file_id} was not found")]
    BackupFileNotFound { file_id: Uuid },

    #[error("a backup file is already tracked for {}", path.display())]
    DuplicateBackupFile { path: PathBuf },

    #[error("backup file {file_id} has no copy state for provider {provider}")]
    CopyStateNotFound {
        file_id: Uuid,
        provider: StorageProviderType,
    },

    #[error("backup file {file_id} is not claimed by instance {instance}")]
    ClaimNotHeld {
        file_id: Uuid,
        instance: EngineInstance,
    },

    #[error("source location rejected: {0}")]
    Validation(#[from] SourceLocationError),

    #[error("copy state update rejected for {file_id}/{provider}: {source}")]
    State {
        file_id: Uuid,
        provider: StorageProviderType,
        #[source]
        source: StateError,
    },

    #[error("failed to read database snapshot {}", path.display())]
    SnapshotRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write database snapshot {}", path.display())]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("database snapshot {} is corrupt", path.display())]
    SnapshotCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("database lock was poisoned by a panicking writer")]
    Poisoned,
}

/// Failure reported by a storage or messaging provider.
///
/// `code` is a provider-defined short identifier ("throttled",
/// "permission_denied", ...) that the failure classifier maps to a
/// retriable or terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a provider error from an I/O failure, using the error kind as the code.
    pub fn from_io(err: &io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => "not_found",
            io::ErrorKind::PermissionDenied => "permission_denied",
            io::ErrorKind::TimedOut => "timed_out",
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => "connection",
            _ => "io",
        };
        ProviderError::new(code, err.to_string())
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors seen by engine workers and their owners.
///
/// Worker loops catch recoverable errors (see `is_recoverable`) per
/// iteration; anything else ends the worker and is reported through its
/// stop notification.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `begin_start` was called on a running engine.
    #[error("engine instance {instance} has already been started")]
    AlreadyStarted { instance: EngineInstance },

    /// A data-transferring engine was built without storage providers.
    #[error("at least one storage provider must be supplied")]
    NoStorageProviders,

    #[error("persistence error: {0}")]
    Database(#[from] DatabaseError),

    #[error("connectivity check failed for {target}: {message}")]
    Connectivity { target: String, message: String },

    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Failed to read from source file
    #[error("Failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to enumerate source directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),

    /// A worker thread panicked.
    #[error("worker panicked: {message}")]
    Panicked { message: String },
}

impl EngineError {
    /// Whether a worker loop should log this error and carry on with its next
    /// iteration instead of stopping.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Database(_) | EngineError::Connectivity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_and_connectivity_errors_are_recoverable() {
        let db = EngineError::Database(DatabaseError::Poisoned);
        assert!(db.is_recoverable());

        let conn = EngineError::Connectivity {
            target: "\\\\nas\\share".to_string(),
            message: "unreachable".to_string(),
        };
        assert!(conn.is_recoverable());
    }

    #[test]
    fn test_other_errors_are_faults() {
        assert!(!EngineError::NoStorageProviders.is_recoverable());
        assert!(!EngineError::Panicked {
            message: "boom".to_string()
        }
        .is_recoverable());
    }

    #[test]
    fn test_provider_error_from_io_uses_kind_as_code() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let provider_err = ProviderError::from_io(&err);
        assert_eq!(provider_err.code, "permission_denied");
        assert_eq!(provider_err.to_string(), "permission_denied: denied");
    }
}
