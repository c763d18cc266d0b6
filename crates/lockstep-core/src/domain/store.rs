//! Operation Store
//!
//! Durable representation of per-file sync state and of the pending upload
//! and download queues. The store is a plain serializable value; the
//! orchestrator owns the only instance and persists it through the
//! `IStateStore` port after every mutation.
//!
//! ## Upload queues
//!
//! ```text
//!  enqueue ──► being_prepared ──commit()──► committed (FIFO) ──promote──► active
//! ```
//!
//! Only the being-prepared batch accepts new operations. Committed batches
//! are immutable until promoted, except for the conflict-resolution helpers
//! which may drop or flag operations anywhere in the queues.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::file_record::{FileAttributes, LocalFileRecord};
use super::index::ServerFileIndexEntry;
use super::newtypes::FileUuid;
use super::operations::{
    DownloadOperation, FileUpload, TransferBlock, UploadBatch, UploadOperation,
};

/// The queue half of the store, persisted separately from the records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationQueues {
    pub being_prepared: UploadBatch,
    pub committed: VecDeque<UploadBatch>,
    pub active: Option<UploadBatch>,
    pub being_downloaded: Vec<DownloadOperation>,
}

/// Summary of a batch whose commit completed on the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedBatch {
    pub uploaded: Vec<FileUuid>,
    pub deleted: Vec<FileUuid>,
    /// Payloads enqueued as temporary files, now safe to remove
    pub temporary_payloads: Vec<PathBuf>,
}

/// Summary of a download pass applied to the records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedPass {
    pub downloaded: Vec<FileUuid>,
    pub deleted: Vec<FileUuid>,
}

/// Per-file records plus upload and download queues
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStore {
    records: BTreeMap<FileUuid, LocalFileRecord>,
    queues: OperationQueues,
}

impl OperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from persisted records and queues
    pub fn from_parts(records: Vec<LocalFileRecord>, queues: OperationQueues) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.uuid(), r)).collect(),
            queues,
        }
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    pub fn record(&self, uuid: FileUuid) -> Option<&LocalFileRecord> {
        self.records.get(&uuid)
    }

    pub fn records(&self) -> impl Iterator<Item = &LocalFileRecord> {
        self.records.values()
    }

    pub fn queues(&self) -> &OperationQueues {
        &self.queues
    }

    /// Inserts a provisional record for a file first seen on the server
    ///
    /// Existing records are left untouched.
    pub fn insert_provisional(&mut self, entry: &ServerFileIndexEntry) {
        self.records
            .entry(entry.uuid)
            .or_insert_with(|| LocalFileRecord::new_provisional_download(entry));
    }

    pub fn mark_deleted_on_server(&mut self, uuid: FileUuid) {
        if let Some(record) = self.records.get_mut(&uuid) {
            record.mark_deleted_on_server();
        }
    }

    // ------------------------------------------------------------------
    // Enqueueing
    // ------------------------------------------------------------------

    /// Adds an upload of `uuid` to the being-prepared batch
    ///
    /// A later upload of the same file replaces an earlier one in the batch.
    ///
    /// # Errors
    /// Returns `DomainError::UsageError` when:
    /// - the file is new and `attributes` is missing or incomplete
    /// - the remote name differs from the one already recorded
    /// - the file was deleted on the server
    /// - a deletion of the file is pending
    pub fn enqueue_upload(
        &mut self,
        uuid: FileUuid,
        attributes: Option<&FileAttributes>,
        payload: PathBuf,
        delete_after_upload: bool,
        blocks: Vec<TransferBlock>,
    ) -> Result<(), DomainError> {
        match self.records.get(&uuid) {
            Some(record) => {
                if record.deleted_on_server() {
                    return Err(DomainError::UsageError(format!(
                        "cannot upload {uuid}: the file was deleted on the server"
                    )));
                }
                if let (Some(attrs), Some(existing)) = (attributes, record.remote_name()) {
                    if attrs.remote_name != *existing {
                        return Err(DomainError::UsageError(format!(
                            "cannot upload {uuid} as '{}': it is already named '{}'",
                            attrs.remote_name, existing
                        )));
                    }
                }
                if self.has_pending_deletion(uuid) {
                    return Err(DomainError::UsageError(format!(
                        "cannot upload {uuid}: a deletion is pending"
                    )));
                }
            }
            None => {
                let attrs = attributes.ok_or_else(|| {
                    DomainError::UsageError(format!(
                        "first upload of {uuid} needs a remote name and MIME type"
                    ))
                })?;
                if attrs.mime_type.trim().is_empty() {
                    return Err(DomainError::UsageError(format!(
                        "first upload of {uuid} needs a MIME type"
                    )));
                }
                self.records
                    .insert(uuid, LocalFileRecord::new_for_upload(uuid, attrs));
            }
        }

        self.queues
            .being_prepared
            .push_superseding(UploadOperation::FileUpload(FileUpload {
                uuid,
                payload,
                delete_after_upload,
                blocks,
                undelete_override: false,
            }));
        Ok(())
    }

    /// Adds a deletion of `uuid` to the being-prepared batch
    ///
    /// Pending uploads of the file in the being-prepared batch are expunged.
    ///
    /// # Errors
    /// - `DomainError::UnknownFile` if there is no record
    /// - `DomainError::UsageError` if the file is already deleted, already
    ///   pending deletion, or has never reached the server
    pub fn enqueue_deletion(&mut self, uuid: FileUuid) -> Result<(), DomainError> {
        let record = self
            .records
            .get(&uuid)
            .ok_or_else(|| DomainError::UnknownFile(uuid.to_string()))?;

        if record.deleted_on_server() {
            return Err(DomainError::UsageError(format!(
                "cannot delete {uuid}: it is already deleted"
            )));
        }
        if record.local_version().is_none() {
            return Err(DomainError::UsageError(format!(
                "cannot delete {uuid}: it has never been synced"
            )));
        }
        if self.has_pending_deletion(uuid) {
            return Err(DomainError::UsageError(format!(
                "cannot delete {uuid}: a deletion is already pending"
            )));
        }

        self.queues
            .being_prepared
            .push_superseding(UploadOperation::FileDeletion { uuid });
        Ok(())
    }

    /// Moves the being-prepared batch to the committed queue
    ///
    /// Returns false, leaving everything untouched, if there is nothing to
    /// commit.
    pub fn commit(&mut self) -> bool {
        if self.queues.being_prepared.is_empty() {
            return false;
        }
        let mut batch = std::mem::take(&mut self.queues.being_prepared);
        batch.push_commit_marker();
        self.queues.committed.push_back(batch);
        true
    }

    // ------------------------------------------------------------------
    // Upload queues
    // ------------------------------------------------------------------

    /// Promotes the oldest committed batch to active
    ///
    /// Batches emptied by conflict resolution are discarded on the way.
    /// Returns true if an active batch is now present.
    pub fn promote_next_committed(&mut self) -> bool {
        if self.has_active_batch() {
            return true;
        }
        while let Some(batch) = self.queues.committed.pop_front() {
            if !batch.is_empty() {
                self.queues.active = Some(batch);
                return true;
            }
        }
        false
    }

    pub fn active_batch(&self) -> Option<&UploadBatch> {
        self.queues.active.as_ref()
    }

    /// True when an active batch with real work exists
    pub fn has_active_batch(&self) -> bool {
        self.queues
            .active
            .as_ref()
            .is_some_and(|batch| !batch.is_empty())
    }

    pub fn has_committed_batches(&self) -> bool {
        !self.queues.committed.is_empty()
    }

    pub fn committed_batch_count(&self) -> usize {
        self.queues.committed.len()
    }

    pub fn being_prepared(&self) -> &UploadBatch {
        &self.queues.being_prepared
    }

    /// Applies a confirmed commit of the active batch to the records
    pub fn complete_active_batch(&mut self) -> CompletedBatch {
        let mut completed = CompletedBatch::default();
        let Some(batch) = self.queues.active.take() else {
            return completed;
        };

        for op in batch.operations() {
            match op {
                UploadOperation::FileUpload(upload) => {
                    if let Some(record) = self.records.get_mut(&upload.uuid) {
                        record.apply_committed_upload(upload.undelete_override);
                    }
                    if upload.delete_after_upload {
                        completed.temporary_payloads.push(upload.payload.clone());
                    }
                    completed.uploaded.push(upload.uuid);
                }
                UploadOperation::FileDeletion { uuid } => {
                    if let Some(record) = self.records.get_mut(uuid) {
                        record.mark_deleted_on_server();
                    }
                    completed.deleted.push(*uuid);
                }
                UploadOperation::CommitMarker => {}
            }
        }
        completed
    }

    /// True if an upload of `uuid` is queued anywhere
    pub fn has_pending_upload(&self, uuid: FileUuid) -> bool {
        self.upload_batches().any(|batch| batch.has_upload(uuid))
    }

    /// True if a deletion of `uuid` is queued anywhere
    pub fn has_pending_deletion(&self, uuid: FileUuid) -> bool {
        self.upload_batches().any(|batch| batch.has_deletion(uuid))
    }

    /// Drops every pending upload of `uuid`, returning how many were dropped
    pub fn remove_pending_uploads(&mut self, uuid: FileUuid) -> usize {
        self.upload_batches_mut()
            .map(|batch| batch.remove_uploads(uuid))
            .sum()
    }

    /// Drops every pending deletion of `uuid`, returning how many were dropped
    pub fn remove_pending_deletions(&mut self, uuid: FileUuid) -> usize {
        self.upload_batches_mut()
            .map(|batch| batch.remove_deletions(uuid))
            .sum()
    }

    /// Flags every pending upload of `uuid` to restore the file on the server
    pub fn set_undelete_override(&mut self, uuid: FileUuid) -> bool {
        let mut changed = false;
        for batch in self.upload_batches_mut() {
            changed |= batch.set_undelete_override(uuid);
        }
        changed
    }

    /// Discards the active batch without applying it
    pub fn flush_active_batch(&mut self) {
        self.queues.active = None;
    }

    /// Discards the active and committed batches
    ///
    /// The being-prepared batch is kept: it has not been handed to the
    /// engine yet.
    pub fn flush_upload_queues(&mut self) {
        self.queues.active = None;
        self.queues.committed.clear();
    }

    fn upload_batches(&self) -> impl Iterator<Item = &UploadBatch> {
        std::iter::once(&self.queues.being_prepared)
            .chain(self.queues.committed.iter())
            .chain(self.queues.active.iter())
    }

    fn upload_batches_mut(&mut self) -> impl Iterator<Item = &mut UploadBatch> {
        std::iter::once(&mut self.queues.being_prepared)
            .chain(self.queues.committed.iter_mut())
            .chain(self.queues.active.iter_mut())
    }

    // ------------------------------------------------------------------
    // Download pass
    // ------------------------------------------------------------------

    /// Installs the result of a reconciliation pass
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if a previous pass is still pending
    pub fn set_download_pass(&mut self, operations: Vec<DownloadOperation>) -> Result<(), DomainError> {
        if !self.queues.being_downloaded.is_empty() {
            return Err(DomainError::InvalidState {
                from: "download pass pending".to_string(),
                to: "new download pass".to_string(),
            });
        }
        self.queues.being_downloaded = operations;
        Ok(())
    }

    pub fn download_pass(&self) -> &[DownloadOperation] {
        &self.queues.being_downloaded
    }

    pub fn download_pass_mut(&mut self) -> &mut [DownloadOperation] {
        &mut self.queues.being_downloaded
    }

    pub fn has_download_pass(&self) -> bool {
        !self.queues.being_downloaded.is_empty()
    }

    /// Applies every download and deletion of the pass, then clears it
    ///
    /// A local deletion still pending for a file the server already deleted
    /// is dropped.
    pub fn complete_download_pass(&mut self) -> CompletedPass {
        let mut completed = CompletedPass::default();
        let pass = std::mem::take(&mut self.queues.being_downloaded);

        for op in &pass {
            match op {
                DownloadOperation::FileDownload {
                    uuid,
                    version,
                    remote_name,
                    mime_type,
                    app_file_type,
                    ..
                } => {
                    if let Some(record) = self.records.get_mut(uuid) {
                        record.apply_download(
                            *version,
                            remote_name,
                            mime_type,
                            app_file_type.as_deref(),
                        );
                        completed.downloaded.push(*uuid);
                    }
                }
                DownloadOperation::FileDeletion { uuid, .. } => {
                    if let Some(record) = self.records.get_mut(uuid) {
                        record.mark_deleted_on_server();
                        completed.deleted.push(*uuid);
                    }
                    // Another device already deleted it; ours would be rejected
                    self.remove_pending_deletions(*uuid);
                }
                DownloadOperation::StartupMarker { .. } | DownloadOperation::Conflict { .. } => {}
            }
        }
        completed
    }

    /// Drops a pending pass without applying it
    pub fn clear_download_pass(&mut self) {
        self.queues.being_downloaded.clear();
    }

    // ------------------------------------------------------------------
    // Development aids
    // ------------------------------------------------------------------

    /// Forgets one file, or everything when `uuid` is `None`
    pub fn purge(&mut self, uuid: Option<FileUuid>) {
        match uuid {
            None => *self = Self::default(),
            Some(uuid) => {
                self.records.remove(&uuid);
                self.remove_pending_uploads(uuid);
                self.remove_pending_deletions(uuid);
                self.queues
                    .being_downloaded
                    .retain(|op| op.uuid() != Some(uuid));
            }
        }
    }
}
