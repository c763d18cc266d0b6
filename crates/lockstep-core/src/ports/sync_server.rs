//! Sync server port (driven/secondary port)
//!
//! This module defines the request/response API the engine speaks to the
//! sync server. Every mutating call happens under an exclusive per-account
//! lock held on the server; the server releases that lock by itself once an
//! inbound or outbound transfer has finished.
//!
//! ## Design Notes
//!
//! - Unlike the other ports, methods return a typed [`ApiError`]: the
//!   upload recovery router branches on the error category, which an
//!   opaque `anyhow::Error` cannot express.
//! - Uses `#[async_trait]` for async trait methods.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::file_record::FileAttributes;
use crate::domain::index::ServerFileIndexEntry;
use crate::domain::newtypes::{FileUuid, OperationId};

// ============================================================================
// ApiError
// ============================================================================

/// Failure categories reported by the sync server adapter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The server could not be reached
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Another device holds the account lock
    #[error("Lock already held by another device")]
    LockAlreadyHeld,

    /// The call requires the lock, which this device does not hold
    #[error("Lock not held")]
    LockNotHeld,

    /// The server rejected the request as invalid
    #[error("Server API usage error: {0}")]
    UsageError(String),

    /// The server reported a failure that may succeed on retry
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// The response could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Returns true if the same request may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::OperationFailed(_) | ApiError::InvalidResponse(_)
        )
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::NetworkUnavailable(_))
    }
}

// ============================================================================
// Operation status
// ============================================================================

/// Status of a long-running server operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatusCode {
    NotStarted,
    CommitFailed,
    InProgress,
    FailedBeforeTransfer,
    FailedDuringTransfer,
    FailedAfterTransfer,
    Succeeded,
}

impl OperationStatusCode {
    /// Maps the numeric wire code to a status
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            200 => Some(Self::NotStarted),
            201 => Some(Self::CommitFailed),
            202 => Some(Self::InProgress),
            203 => Some(Self::FailedBeforeTransfer),
            204 => Some(Self::FailedDuringTransfer),
            205 => Some(Self::FailedAfterTransfer),
            210 => Some(Self::Succeeded),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::NotStarted => 200,
            Self::CommitFailed => 201,
            Self::InProgress => 202,
            Self::FailedBeforeTransfer => 203,
            Self::FailedDuringTransfer => 204,
            Self::FailedAfterTransfer => 205,
            Self::Succeeded => 210,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::CommitFailed
                | Self::FailedBeforeTransfer
                | Self::FailedDuringTransfer
                | Self::FailedAfterTransfer
        )
    }
}

impl std::fmt::Display for OperationStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::CommitFailed => "commit_failed",
            Self::InProgress => "in_progress",
            Self::FailedBeforeTransfer => "failed_before_transfer",
            Self::FailedDuringTransfer => "failed_during_transfer",
            Self::FailedAfterTransfer => "failed_after_transfer",
            Self::Succeeded => "succeeded",
        };
        write!(f, "{}", s)
    }
}

/// Result of `CheckOperationStatus`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub code: OperationStatusCode,
    /// Number of files the operation has processed so far
    pub count: u32,
    /// Server-side error text for failed statuses
    pub error: Option<String>,
}

impl OperationStatus {
    pub fn new(code: OperationStatusCode) -> Self {
        Self {
            code,
            count: 0,
            error: None,
        }
    }
}

// ============================================================================
// Request and response DTOs
// ============================================================================

/// Result of `UploadRecovery`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRecoveryResult {
    /// Present when the server already holds a commit for this device
    pub operation_id: Option<OperationId>,
    /// Outbound staging index: files whose upload already reached the server
    pub uploaded: Option<Vec<ServerFileIndexEntry>>,
}

/// One file named in a `DeleteFiles` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileToDelete {
    pub uuid: FileUuid,
    pub version: u32,
}

/// One block of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadBlock {
    pub uuid: FileUuid,
    /// Version the file will have once the batch commits
    pub version: u32,
    pub attributes: FileAttributes,
    pub undelete: bool,
    pub block_index: u32,
    pub block_count: u32,
    pub data: Vec<u8>,
}

/// One block of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadBlock {
    pub uuid: FileUuid,
    pub version: u32,
    pub offset: u64,
    pub length: u64,
}

// ============================================================================
// ISyncServerApi trait
// ============================================================================

/// Port trait for the sync server
///
/// Each method maps to one server operation. Implementations perform
/// transport-level retries (e.g. rate limiting) themselves and report
/// everything else through [`ApiError`].
#[async_trait::async_trait]
pub trait ISyncServerApi: Send + Sync {
    /// Acquires the account lock
    ///
    /// # Errors
    /// `ApiError::LockAlreadyHeld` when another device holds it
    async fn lock(&self) -> Result<(), ApiError>;

    /// Releases the account lock
    async fn unlock(&self) -> Result<(), ApiError>;

    /// Fetches the authoritative file index
    async fn get_file_index(&self) -> Result<Vec<ServerFileIndexEntry>, ApiError>;

    /// Sends one block of a file to outbound staging
    async fn upload_file_block(&self, block: UploadBlock) -> Result<(), ApiError>;

    /// Stages deletions to be applied by the next outbound transfer
    async fn delete_files(&self, files: &[FileToDelete]) -> Result<(), ApiError>;

    /// Commits outbound staging and starts copying it to cloud storage
    ///
    /// # Returns
    /// The id of the transfer operation, to be polled
    async fn start_outbound_transfer(&self) -> Result<OperationId, ApiError>;

    /// Names the files the next inbound transfer should stage
    async fn setup_inbound_transfer(&self, files: &[FileUuid]) -> Result<(), ApiError>;

    /// Starts copying the staged files out of cloud storage
    async fn start_inbound_transfer(&self) -> Result<OperationId, ApiError>;

    async fn check_operation_status(
        &self,
        operation_id: &OperationId,
    ) -> Result<OperationStatus, ApiError>;

    /// Forgets this device's current operation id
    async fn remove_operation_id(&self) -> Result<(), ApiError>;

    /// Asks the server what survived of an interrupted upload
    ///
    /// # Errors
    /// `ApiError::LockNotHeld` when the lock was lost in the meantime
    async fn upload_recovery(&self) -> Result<UploadRecoveryResult, ApiError>;

    /// Restarts a failed outbound transfer
    async fn outbound_transfer_recovery(&self) -> Result<(), ApiError>;

    /// Discards all server-side state for this device and releases the lock
    async fn cleanup(&self) -> Result<(), ApiError>;

    /// Returns this device's current operation id, if any
    async fn get_operation_id(&self) -> Result<Option<OperationId>, ApiError>;

    /// Fetches one block of an inbound-staged file
    async fn download_file_block(&self, block: DownloadBlock) -> Result<Vec<u8>, ApiError>;
}
