//! Reconciliation of local state against the server file index
//!
//! Compares every entry of the server index with the local record of the
//! same file and produces the download pass: downloads, download-deletions
//! and the conflicts they raise with pending local changes.

use tracing::{debug, info, warn};

use lockstep_core::domain::{
    conflict::ConflictType, index::ServerFileIndexEntry, newtypes::FileUuid,
    operations::DownloadOperation, store::OperationStore,
};

use crate::error::ConflictError;

/// Builds download passes from the server file index
pub struct Reconciler;

impl Reconciler {
    /// Computes the download pass for `index`
    ///
    /// Provisional records for files first seen on the server are inserted
    /// into `store` only when the whole index reconciles; on error the store
    /// is left untouched.
    ///
    /// # Returns
    /// The operations of the pass, led by a `StartupMarker`, or an empty
    /// vector when there is nothing to download
    ///
    /// # Errors
    /// `ConflictError::InvariantViolation` if the server holds an older
    /// version of a file than the client
    pub fn reconcile(
        store: &mut OperationStore,
        index: &[ServerFileIndexEntry],
    ) -> Result<Vec<DownloadOperation>, ConflictError> {
        let mut operations = Vec::new();
        let mut provisional = Vec::new();

        for entry in index {
            if entry.deleted {
                Self::reconcile_deleted(store, entry, &mut operations);
            } else if Self::reconcile_live(store, entry, &mut operations)? {
                provisional.push(entry);
            }
        }

        for entry in provisional {
            store.insert_provisional(entry);
        }

        if operations.is_empty() {
            debug!(entries = index.len(), "Server index matches local state");
            return Ok(operations);
        }

        let has_file_downloads = operations.iter().any(DownloadOperation::is_file_download);
        operations.insert(0, DownloadOperation::StartupMarker { has_file_downloads });

        info!(
            operations = operations.len() - 1,
            has_file_downloads, "Reconciliation produced a download pass"
        );
        Ok(operations)
    }

    fn reconcile_deleted(
        store: &OperationStore,
        entry: &ServerFileIndexEntry,
        operations: &mut Vec<DownloadOperation>,
    ) {
        // Unknown files were created and deleted elsewhere; nothing to do
        let Some(record) = store.record(entry.uuid) else {
            return;
        };
        if record.deleted_on_server() {
            return;
        }

        operations.push(DownloadOperation::FileDeletion {
            uuid: entry.uuid,
            version: entry.version,
        });

        if store.has_pending_upload(entry.uuid) {
            info!(uuid = %entry.uuid, "Server deleted a file with a pending upload");
            operations.push(conflict(entry.uuid, ConflictType::DownloadDeletionLocalUpload));
        }
    }

    /// Returns true when `entry` needs a provisional record
    fn reconcile_live(
        store: &OperationStore,
        entry: &ServerFileIndexEntry,
        operations: &mut Vec<DownloadOperation>,
    ) -> Result<bool, ConflictError> {
        let Some(record) = store.record(entry.uuid) else {
            operations.push(download(entry));
            return Ok(true);
        };

        match record.local_version() {
            Some(local) if local == entry.version => return Ok(false),
            Some(local) if local > entry.version => {
                warn!(
                    uuid = %entry.uuid,
                    local,
                    server = entry.version,
                    "Server version is older than local version"
                );
                return Err(ConflictError::InvariantViolation(format!(
                    "server has version {} of {} but the client has version {}",
                    entry.version, entry.uuid, local
                )));
            }
            _ => {}
        }

        operations.push(download(entry));

        // A deletion takes precedence: only one conflict per file per pass
        if store.has_pending_deletion(entry.uuid) {
            operations.push(conflict(entry.uuid, ConflictType::DownloadLocalUploadDeletion));
        } else if store.has_pending_upload(entry.uuid) {
            operations.push(conflict(entry.uuid, ConflictType::DownloadLocalUpload));
        }
        Ok(false)
    }
}

fn download(entry: &ServerFileIndexEntry) -> DownloadOperation {
    DownloadOperation::FileDownload {
        uuid: entry.uuid,
        version: entry.version,
        size_bytes: entry.size_bytes,
        remote_name: entry.remote_name.clone(),
        mime_type: entry.mime_type.clone(),
        app_file_type: entry.app_file_type.clone(),
        staged_path: None,
        transferred: false,
    }
}

fn conflict(uuid: FileUuid, conflict_type: ConflictType) -> DownloadOperation {
    DownloadOperation::Conflict {
        uuid,
        conflict_type,
    }
}
