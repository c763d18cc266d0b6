//! Persisted engine state
//!
//! An [`EngineSnapshot`] is everything the orchestrator needs to resume
//! after a crash: the operation store, the operating mode, the server lock
//! flag and the progress of the upload and download state machines.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mode::SyncMode;
use super::newtypes::{FileUuid, OperationId};
use super::store::OperationStore;

/// Current layout version of the persisted snapshot
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Upload progress
// ============================================================================

/// What a `TransferInProgress` stage does when it is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferResume {
    /// The outbound transfer is running; keep polling
    Poll,
    /// The transfer failed while copying to cloud storage
    RetryDuringTransfer,
    /// The transfer failed after copying, while finishing up
    RetryAfterTransfer,
}

/// Recovery position of the upload state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum UploadStage {
    /// Nothing has been sent for the active batch, or the pipeline
    /// restarted from scratch
    #[default]
    Normal,
    /// The lock or the index must be re-established before continuing
    AwaitingLockAndIndex,
    /// The commit request may or may not have reached the server
    PossiblyCommitted,
    /// The server accepted the commit and is copying to cloud storage
    TransferInProgress { resume: TransferResume },
}

impl UploadStage {
    pub fn name(&self) -> &'static str {
        match self {
            UploadStage::Normal => "normal",
            UploadStage::AwaitingLockAndIndex => "awaiting_lock_and_index",
            UploadStage::PossiblyCommitted => "possibly_committed",
            UploadStage::TransferInProgress { .. } => "transfer_in_progress",
        }
    }
}

impl std::fmt::Display for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Attempts spent in each recovery category for the active batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryCounters {
    pub awaiting_lock_and_index: u32,
    pub possibly_committed: u32,
    pub transfer_in_progress: u32,
}

impl RecoveryCounters {
    /// Counter that guards entry into `stage`, if it is a recovery stage
    pub fn for_stage_mut(&mut self, stage: &UploadStage) -> Option<&mut u32> {
        match stage {
            UploadStage::Normal => None,
            UploadStage::AwaitingLockAndIndex => Some(&mut self.awaiting_lock_and_index),
            UploadStage::PossiblyCommitted => Some(&mut self.possibly_committed),
            UploadStage::TransferInProgress { .. } => Some(&mut self.transfer_in_progress),
        }
    }
}

/// Upload state machine progress for the active batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadProgress {
    pub stage: UploadStage,
    pub operation_id: Option<OperationId>,
    pub counters: RecoveryCounters,
    /// Files whose blocks have all been sent in the current attempt
    pub uploaded: BTreeSet<FileUuid>,
}

impl UploadProgress {
    pub fn is_fresh(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// Download progress
// ============================================================================

/// Position of the download state machine within a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStage {
    #[default]
    SetupRemoteStaging,
    StartTransfer,
    PollUntilFinished,
    RemoveOperationId,
    PerformFileTransfers,
    DeliverAtomically,
}

impl std::fmt::Display for DownloadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadStage::SetupRemoteStaging => "setup_remote_staging",
            DownloadStage::StartTransfer => "start_transfer",
            DownloadStage::PollUntilFinished => "poll_until_finished",
            DownloadStage::RemoveOperationId => "remove_operation_id",
            DownloadStage::PerformFileTransfers => "perform_file_transfers",
            DownloadStage::DeliverAtomically => "deliver_atomically",
        };
        f.write_str(s)
    }
}

/// Download state machine progress for the pending pass
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub stage: DownloadStage,
    pub operation_id: Option<OperationId>,
    /// Errors seen in `stage`; reset on every transition
    pub error_count: u32,
}

// ============================================================================
// EngineSnapshot
// ============================================================================

/// Complete persisted state of one engine instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub schema_version: u32,
    pub mode: SyncMode,
    pub server_lock_held: bool,
    pub store: OperationStore,
    pub upload: UploadProgress,
    pub download: DownloadProgress,
    pub saved_at: DateTime<Utc>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            mode: SyncMode::Idle,
            server_lock_held: false,
            store: OperationStore::default(),
            upload: UploadProgress::default(),
            download: DownloadProgress::default(),
            saved_at: Utc::now(),
        }
    }
}

impl EngineSnapshot {
    /// Prepares a snapshot taken after a crash for resumption
    ///
    /// A process that died in `Synchronizing` with an untouched active
    /// batch cannot know whether the commit reached the server, so that
    /// batch is routed through `PossiblyCommitted`. Returns true if the
    /// snapshot describes an interrupted cycle.
    pub fn prepare_for_recovery(&mut self) -> bool {
        if self.mode != SyncMode::Synchronizing {
            return false;
        }
        if self.store.has_active_batch() && self.upload.stage == UploadStage::Normal {
            self.upload.stage = UploadStage::PossiblyCommitted;
        }
        true
    }

    /// Clears both state machines' progress
    pub fn clear_progress(&mut self) {
        self.upload = UploadProgress::default();
        self.download = DownloadProgress::default();
    }
}
