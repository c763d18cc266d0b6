//! Upload and download operations
//!
//! Operations are tagged unions: every variant that touches a file carries
//! the file's uuid, and the engines switch on the variant instead of
//! dispatching through a class hierarchy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::conflict::ConflictType;
use super::newtypes::{FileUuid, RemoteName};

/// Default size of one transfer block: 100 KiB
pub const DEFAULT_BLOCK_SIZE: u64 = 100 * 1024;

// ============================================================================
// TransferBlock
// ============================================================================

/// A fixed-size slice of a file sent or fetched in one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBlock {
    pub offset: u64,
    pub length: u64,
}

impl TransferBlock {
    /// Splits a file of `size` bytes into ordered blocks of `block_size`
    ///
    /// The last block may be shorter. An empty file still yields one empty
    /// block so that the server sees the upload.
    pub fn split(size: u64, block_size: u64) -> Vec<TransferBlock> {
        let block_size = block_size.max(1);
        if size == 0 {
            return vec![TransferBlock {
                offset: 0,
                length: 0,
            }];
        }

        let mut blocks = Vec::with_capacity(size.div_ceil(block_size) as usize);
        let mut offset = 0;
        while offset < size {
            let length = block_size.min(size - offset);
            blocks.push(TransferBlock { offset, length });
            offset += length;
        }
        blocks
    }
}

// ============================================================================
// Upload side
// ============================================================================

/// A pending upload of one file's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    pub uuid: FileUuid,
    /// Where the content is read from when the batch is sent
    pub payload: PathBuf,
    /// Remove `payload` once the batch has been committed
    pub delete_after_upload: bool,
    pub blocks: Vec<TransferBlock>,
    /// Ask the server to restore a file that another device deleted
    pub undelete_override: bool,
}

/// One entry of an upload batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadOperation {
    FileUpload(FileUpload),
    FileDeletion { uuid: FileUuid },
    /// Terminates a batch the caller has committed
    CommitMarker,
}

impl UploadOperation {
    /// The file this operation refers to; `None` for the commit marker
    pub fn uuid(&self) -> Option<FileUuid> {
        match self {
            UploadOperation::FileUpload(upload) => Some(upload.uuid),
            UploadOperation::FileDeletion { uuid } => Some(*uuid),
            UploadOperation::CommitMarker => None,
        }
    }

    pub fn is_upload_of(&self, uuid: FileUuid) -> bool {
        matches!(self, UploadOperation::FileUpload(upload) if upload.uuid == uuid)
    }

    pub fn is_deletion_of(&self, uuid: FileUuid) -> bool {
        matches!(self, UploadOperation::FileDeletion { uuid: u } if *u == uuid)
    }
}

/// Ordered set of upload operations committed together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    operations: Vec<UploadOperation>,
}

impl UploadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> &[UploadOperation] {
        &self.operations
    }

    /// True once the caller has committed the batch
    pub fn is_committed(&self) -> bool {
        matches!(self.operations.last(), Some(UploadOperation::CommitMarker))
    }

    /// True when the batch holds no uploads or deletions
    pub fn is_empty(&self) -> bool {
        self.operations
            .iter()
            .all(|op| matches!(op, UploadOperation::CommitMarker))
    }

    pub fn uploads(&self) -> impl Iterator<Item = &FileUpload> {
        self.operations.iter().filter_map(|op| match op {
            UploadOperation::FileUpload(upload) => Some(upload),
            _ => None,
        })
    }

    pub fn deletions(&self) -> impl Iterator<Item = FileUuid> + '_ {
        self.operations.iter().filter_map(|op| match op {
            UploadOperation::FileDeletion { uuid } => Some(*uuid),
            _ => None,
        })
    }

    pub fn has_upload(&self, uuid: FileUuid) -> bool {
        self.operations.iter().any(|op| op.is_upload_of(uuid))
    }

    pub fn has_deletion(&self, uuid: FileUuid) -> bool {
        self.operations.iter().any(|op| op.is_deletion_of(uuid))
    }

    /// Appends an operation, superseding any earlier operation on the same file
    pub(crate) fn push_superseding(&mut self, operation: UploadOperation) {
        if let Some(uuid) = operation.uuid() {
            self.operations.retain(|op| op.uuid() != Some(uuid));
        }
        self.operations.push(operation);
    }

    pub(crate) fn push_commit_marker(&mut self) {
        if !self.is_committed() {
            self.operations.push(UploadOperation::CommitMarker);
        }
    }

    /// Removes uploads of `uuid`, returning how many were removed
    pub(crate) fn remove_uploads(&mut self, uuid: FileUuid) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| !op.is_upload_of(uuid));
        before - self.operations.len()
    }

    /// Removes deletions of `uuid`, returning how many were removed
    pub(crate) fn remove_deletions(&mut self, uuid: FileUuid) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| !op.is_deletion_of(uuid));
        before - self.operations.len()
    }

    pub(crate) fn set_undelete_override(&mut self, uuid: FileUuid) -> bool {
        let mut changed = false;
        for op in &mut self.operations {
            if let UploadOperation::FileUpload(upload) = op {
                if upload.uuid == uuid {
                    upload.undelete_override = true;
                    changed = true;
                }
            }
        }
        changed
    }
}

// ============================================================================
// Download side
// ============================================================================

/// One entry of a download pass produced by reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadOperation {
    /// Leads every non-empty pass
    StartupMarker { has_file_downloads: bool },
    FileDownload {
        uuid: FileUuid,
        version: u32,
        size_bytes: u64,
        remote_name: RemoteName,
        mime_type: String,
        app_file_type: Option<String>,
        /// Local file the content is written to during the transfer stage
        staged_path: Option<PathBuf>,
        /// Set once every block has been written to `staged_path`
        transferred: bool,
    },
    FileDeletion { uuid: FileUuid, version: u32 },
    Conflict {
        uuid: FileUuid,
        conflict_type: ConflictType,
    },
}

impl DownloadOperation {
    pub fn uuid(&self) -> Option<FileUuid> {
        match self {
            DownloadOperation::StartupMarker { .. } => None,
            DownloadOperation::FileDownload { uuid, .. }
            | DownloadOperation::FileDeletion { uuid, .. }
            | DownloadOperation::Conflict { uuid, .. } => Some(*uuid),
        }
    }

    pub fn is_file_download(&self) -> bool {
        matches!(self, DownloadOperation::FileDownload { .. })
    }
}
