//! Lockstep Sync - Upload and download engines and the sync orchestrator
//!
//! Provides:
//! - The priority loop that serves downloads, uploads and reconciliation
//!   under the server lock
//! - Upload recovery across ambiguous commits and failed transfers
//! - Staged downloads delivered to the host as one atomic pass
//!
//! ## Modules
//!
//! - [`orchestrator`] - Gate, persisted mode and the priority loop
//! - [`context`] - Ports, settings and the persisted snapshot shared by the engines
//! - [`upload`] - Upload Engine with three-stage recovery
//! - [`download`] - Download Engine state machine
//! - [`filesystem`] - Local filesystem adapter (block I/O, atomic writes)
//! - [`host`] - Delegate that delivers into a directory, for the daemon and CLI
//! - [`retry`] - Bounded exponential backoff

pub mod context;
pub mod download;
pub mod filesystem;
pub mod host;
pub mod orchestrator;
pub mod retry;
pub mod upload;

use thiserror::Error;

use lockstep_core::domain::{DomainError, SyncMode};
use lockstep_core::ports::ApiError;
use lockstep_conflict::ConflictError;

pub use filesystem::LocalFileSystemAdapter;
pub use host::DirectoryDelegate;
pub use context::SyncSettings;
pub use orchestrator::{SyncOrchestrator, TriggerOutcome};

/// Errors that end a sync cycle
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server could not be reached; the next trigger resumes
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Another device holds the server lock
    #[error("Server lock held by another device")]
    LockDeferred,

    /// The caller asked for something that can never succeed
    #[error("Client usage error: {0}")]
    ClientUsage(String),

    /// A retry budget was exhausted
    #[error("Non-recoverable error: {0}")]
    NonRecoverable(String),

    /// A protocol invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Persisting or reading local state failed
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// The mode the engine enters when a cycle ends with this error
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncError::NetworkUnavailable(_) => SyncMode::NetworkNotConnected,
            SyncError::LockDeferred => SyncMode::Idle,
            SyncError::ClientUsage(detail) => SyncMode::ClientApiError(detail.clone()),
            SyncError::NonRecoverable(detail) => SyncMode::NonRecoverableError(detail.clone()),
            SyncError::Internal(detail) => SyncMode::InternalError(detail.clone()),
            SyncError::Storage(err) => SyncMode::InternalError(format!("{err:#}")),
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NetworkUnavailable(detail) => SyncError::NetworkUnavailable(detail),
            ApiError::LockAlreadyHeld => SyncError::LockDeferred,
            ApiError::UsageError(detail) => SyncError::ClientUsage(detail),
            ApiError::LockNotHeld => {
                SyncError::Internal("server reports the lock is not held".to_string())
            }
            ApiError::OperationFailed(detail) | ApiError::InvalidResponse(detail) => {
                SyncError::NonRecoverable(detail)
            }
        }
    }
}

impl From<DomainError> for SyncError {
    fn from(err: DomainError) -> Self {
        if err.is_usage_error() {
            SyncError::ClientUsage(err.to_string())
        } else {
            SyncError::Internal(err.to_string())
        }
    }
}

impl From<ConflictError> for SyncError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::Usage(detail) => SyncError::ClientUsage(detail),
            other => SyncError::Internal(other.to_string()),
        }
    }
}
