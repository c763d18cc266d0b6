//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures, caller misuse of the queues, and
//! the one-shot conflict contract.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Invalid remote file name
    #[error("Invalid remote name: {0}")]
    InvalidRemoteName(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The caller used the queue API in a way that can never succeed
    /// (e.g. deleting an unknown file or renaming a file on upload)
    #[error("Usage error: {0}")]
    UsageError(String),

    /// A file is not known to the local store
    #[error("Unknown file: {0}")]
    UnknownFile(String),

    /// `resolve_conflict` was called more than once on the same conflict
    #[error("Conflict for {0} has already been resolved")]
    ConflictAlreadyResolved(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },
}

impl DomainError {
    /// Returns true if this error was caused by the caller rather than
    /// by the data itself
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            DomainError::UsageError(_)
                | DomainError::UnknownFile(_)
                | DomainError::ConflictAlreadyResolved(_)
        )
    }
}
