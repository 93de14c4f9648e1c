//! Exit codes and causes
//!
//! Every pass-level failure inside the engine is reported as a
//! [`WorkerError`]: a typed (code, cause) pair. The code tells the caller how
//! to react (retry, rebuild a snapshot, blacklist an item); the cause narrows
//! down what went wrong.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    /// Sync database read or write failed
    DbError,
    /// Data disagrees with what the algorithm expects; rebuild the snapshot
    DataError,
    /// Local I/O or platform failure
    SystemError,
    /// Transient network failure; retried by the observer loop
    NetworkError,
    /// Malformed or error-flagged server response
    BackError,
    /// Internal inconsistency, e.g. an unparsable full listing
    LogicError,
    /// The access token was rejected
    InvalidToken,
    /// The pass was stopped before completion
    OperationCanceled,
}

/// Detail attached to an [`ExitCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCause {
    Unknown,
    DbAccessError,
    DbEntryNotFound,
    InvalidSnapshot,
    FileAccessError,
    InvalidName,
    NoSearchPermission,
    NetworkTimeout,
    FullListParsingError,
    ApiErr,
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitCode::DbError => "db error",
            ExitCode::DataError => "data error",
            ExitCode::SystemError => "system error",
            ExitCode::NetworkError => "network error",
            ExitCode::BackError => "back error",
            ExitCode::LogicError => "logic error",
            ExitCode::InvalidToken => "invalid token",
            ExitCode::OperationCanceled => "operation canceled",
        };
        f.write_str(s)
    }
}

impl Display for ExitCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitCause::Unknown => "unknown",
            ExitCause::DbAccessError => "db access error",
            ExitCause::DbEntryNotFound => "db entry not found",
            ExitCause::InvalidSnapshot => "invalid snapshot",
            ExitCause::FileAccessError => "file access error",
            ExitCause::InvalidName => "invalid name",
            ExitCause::NoSearchPermission => "no search permission",
            ExitCause::NetworkTimeout => "network timeout",
            ExitCause::FullListParsingError => "full list parsing error",
            ExitCause::ApiErr => "api error",
        };
        f.write_str(s)
    }
}

/// A typed exit code + cause pair returned by engine workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} ({cause})")]
pub struct WorkerError {
    pub code: ExitCode,
    pub cause: ExitCause,
}

impl WorkerError {
    #[must_use]
    pub const fn new(code: ExitCode, cause: ExitCause) -> Self {
        Self { code, cause }
    }

    /// The sync database could not be read or written
    #[must_use]
    pub const fn db_access() -> Self {
        Self::new(ExitCode::DbError, ExitCause::DbAccessError)
    }

    /// A row the algorithm relies on is missing from the sync database
    #[must_use]
    pub const fn db_entry_not_found() -> Self {
        Self::new(ExitCode::DbError, ExitCause::DbEntryNotFound)
    }

    /// A live snapshot disagrees with the algorithm's expectations
    #[must_use]
    pub const fn invalid_snapshot() -> Self {
        Self::new(ExitCode::DataError, ExitCause::InvalidSnapshot)
    }

    #[must_use]
    pub const fn canceled() -> Self {
        Self::new(ExitCode::OperationCanceled, ExitCause::Unknown)
    }

    /// `true` when the caller should drop and rebuild the affected snapshot
    #[must_use]
    pub fn requires_snapshot_rebuild(&self) -> bool {
        matches!(
            (self.code, self.cause),
            (ExitCode::DataError, ExitCause::InvalidSnapshot)
                | (ExitCode::LogicError, ExitCause::FullListParsingError)
                | (ExitCode::NetworkError, ExitCause::FullListParsingError)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_cause() {
        let err = WorkerError::invalid_snapshot();
        assert_eq!(err.to_string(), "data error (invalid snapshot)");
    }

    #[test]
    fn db_errors_are_distinguished() {
        assert_ne!(WorkerError::db_access(), WorkerError::db_entry_not_found());
        assert_eq!(WorkerError::db_access().code, ExitCode::DbError);
    }

    #[test]
    fn rebuild_is_required_for_structural_errors_only() {
        assert!(WorkerError::invalid_snapshot().requires_snapshot_rebuild());
        assert!(
            WorkerError::new(ExitCode::LogicError, ExitCause::FullListParsingError)
                .requires_snapshot_rebuild()
        );
        assert!(!WorkerError::db_access().requires_snapshot_rebuild());
        assert!(
            !WorkerError::new(ExitCode::NetworkError, ExitCause::NetworkTimeout)
                .requires_snapshot_rebuild()
        );
    }
}
