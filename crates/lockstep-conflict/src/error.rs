//! Error types for reconciliation and resolution

use thiserror::Error;

/// Errors that can occur during reconciliation and conflict resolution
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// The server index contradicts local state in a way that cannot happen
    /// in a correct protocol run
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A resolution was applied to a file the store does not know
    #[error("cannot resolve conflict: {0}")]
    Usage(String),

    /// Invalid glob pattern or resolution in a conflict rule
    #[error("invalid conflict rule: {pattern}: {reason}")]
    InvalidRule { pattern: String, reason: String },
}
