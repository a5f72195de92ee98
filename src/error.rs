//! Error types for Bedrock
//!
//! Defines a unified error type that can represent errors from all
//! subsystems. Each variant corresponds to one error *kind*; callers
//! branch on [`BedrockError::kind`] rather than on message text.

use std::fmt;
use std::io;

/// Coarse classification of an error, used by retry loops and by callers
/// that need to distinguish deferrals from failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Snapshot conflict between concurrent writers; retryable
    WriteConflict,
    /// Missing ident, record, or timestamp
    NotFound,
    /// Duplicate ident or duplicate oplog record id
    AlreadyExists,
    /// Drop or backup deferred because a resource is still referenced
    Busy,
    /// Illegal call for the current state
    InvalidOption,
    /// The engine cannot perform the requested operation
    NotSupported,
    /// Caller-requested cancellation
    Interrupted,
    /// A background component is stopping
    ShutdownInProgress,
    /// Repair salvaged or rebuilt data; callers must record the modification
    DataModifiedByRepair,
    /// Rollback-to-stable cannot proceed; the caller must fail the node
    UnrecoverableRollback,
    /// I/O failure
    Io,
    /// Persisted state failed to decode
    Corruption,
    /// Anything else
    Internal,
}

/// Unified error type for Bedrock operations
#[derive(Debug)]
pub enum BedrockError {
    /// I/O error (file operations)
    Io(io::Error),
    /// Write-write conflict under snapshot isolation
    WriteConflict,
    /// Missing ident, record, or timestamp
    NotFound(String),
    /// Duplicate ident (or duplicate oplog record id)
    AlreadyExists(String),
    /// Operation deferred; the resource is still in use
    Busy(String),
    /// Illegal call for the current state
    InvalidOption(String),
    /// The engine cannot perform the requested operation
    NotSupported(String),
    /// Operation cancelled through its context
    Interrupted,
    /// A background component is shutting down
    ShutdownInProgress(String),
    /// Repair modified data while recovering it
    DataModifiedByRepair(String),
    /// Rollback-to-stable failed
    UnrecoverableRollback(String),
    /// Persisted state failed to decode
    Corruption(String),
    /// Generic internal error
    Internal(String),
}

impl BedrockError {
    /// Create a "no such ident" error
    pub fn ident_not_found(ident: &str) -> Self {
        BedrockError::NotFound(format!("ident '{}' does not exist", ident))
    }

    /// Create a "duplicate ident" error
    pub fn ident_already_exists(ident: &str) -> Self {
        BedrockError::AlreadyExists(format!("ident '{}' already exists", ident))
    }

    /// Create a "no such record" error
    pub fn record_not_found(ident: &str, id: u64) -> Self {
        BedrockError::NotFound(format!("record {} not found in '{}'", id, ident))
    }

    /// Error for a background component that is stopping
    pub fn shutdown(what: &str) -> Self {
        BedrockError::ShutdownInProgress(format!("{} is shutting down", what))
    }

    /// Rebuild an error from a kind and message. Used where an error
    /// must be replayed to several observers (poisoned units, shared
    /// flush rounds).
    pub fn from_kind(kind: ErrorKind, msg: String) -> Self {
        match kind {
            ErrorKind::WriteConflict => BedrockError::WriteConflict,
            ErrorKind::NotFound => BedrockError::NotFound(msg),
            ErrorKind::AlreadyExists => BedrockError::AlreadyExists(msg),
            ErrorKind::Busy => BedrockError::Busy(msg),
            ErrorKind::InvalidOption => BedrockError::InvalidOption(msg),
            ErrorKind::NotSupported => BedrockError::NotSupported(msg),
            ErrorKind::Interrupted => BedrockError::Interrupted,
            ErrorKind::ShutdownInProgress => BedrockError::ShutdownInProgress(msg),
            ErrorKind::DataModifiedByRepair => BedrockError::DataModifiedByRepair(msg),
            ErrorKind::UnrecoverableRollback => BedrockError::UnrecoverableRollback(msg),
            ErrorKind::Corruption => BedrockError::Corruption(msg),
            ErrorKind::Io | ErrorKind::Internal => BedrockError::Internal(msg),
        }
    }

    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BedrockError::Io(_) => ErrorKind::Io,
            BedrockError::WriteConflict => ErrorKind::WriteConflict,
            BedrockError::NotFound(_) => ErrorKind::NotFound,
            BedrockError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            BedrockError::Busy(_) => ErrorKind::Busy,
            BedrockError::InvalidOption(_) => ErrorKind::InvalidOption,
            BedrockError::NotSupported(_) => ErrorKind::NotSupported,
            BedrockError::Interrupted => ErrorKind::Interrupted,
            BedrockError::ShutdownInProgress(_) => ErrorKind::ShutdownInProgress,
            BedrockError::DataModifiedByRepair(_) => ErrorKind::DataModifiedByRepair,
            BedrockError::UnrecoverableRollback(_) => ErrorKind::UnrecoverableRollback,
            BedrockError::Corruption(_) => ErrorKind::Corruption,
            BedrockError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors a caller is expected to recover from by retrying
    /// the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BedrockError::WriteConflict)
    }
}

impl fmt::Display for BedrockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BedrockError::Io(e) => write!(f, "{}", e),
            BedrockError::WriteConflict => write!(f, "write conflict"),
            BedrockError::NotFound(msg) => write!(f, "{}", msg),
            BedrockError::AlreadyExists(msg) => write!(f, "{}", msg),
            BedrockError::Busy(msg) => write!(f, "{}", msg),
            BedrockError::InvalidOption(msg) => write!(f, "{}", msg),
            BedrockError::NotSupported(msg) => write!(f, "{}", msg),
            BedrockError::Interrupted => write!(f, "operation interrupted"),
            BedrockError::ShutdownInProgress(msg) => write!(f, "{}", msg),
            BedrockError::DataModifiedByRepair(msg) => write!(f, "{}", msg),
            BedrockError::UnrecoverableRollback(msg) => write!(f, "{}", msg),
            BedrockError::Corruption(msg) => write!(f, "{}", msg),
            BedrockError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BedrockError {}

impl From<io::Error> for BedrockError {
    fn from(e: io::Error) -> Self {
        BedrockError::Io(e)
    }
}

impl From<serde_json::Error> for BedrockError {
    fn from(e: serde_json::Error) -> Self {
        BedrockError::Corruption(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for BedrockError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        BedrockError::Corruption(e.to_string())
    }
}

/// Result type alias for Bedrock operations
pub type Result<T> = std::result::Result<T, BedrockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BedrockError::WriteConflict.kind(), ErrorKind::WriteConflict);
        assert_eq!(
            BedrockError::ident_not_found("t1").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BedrockError::ident_already_exists("t1").kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            BedrockError::shutdown("journal flusher").kind(),
            ErrorKind::ShutdownInProgress
        );
        assert_eq!(
            BedrockError::NotSupported("compact adaptor".into()).kind(),
            ErrorKind::NotSupported
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BedrockError::WriteConflict.is_retryable());
        assert!(!BedrockError::Interrupted.is_retryable());
        assert!(!BedrockError::ident_not_found("x").is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = BedrockError::ident_not_found("collection-7-abc");
        assert_eq!(err.to_string(), "ident 'collection-7-abc' does not exist");

        let err = BedrockError::record_not_found("t1", 42);
        assert!(err.to_string().contains("record 42"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: BedrockError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
