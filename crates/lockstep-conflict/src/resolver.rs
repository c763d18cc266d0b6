//! Conflict resolution side effects
//!
//! Applies a caller's resolution to the upload queues:
//!
//! | Conflict                      | Accept remote                         | Keep local                 |
//! |-------------------------------|---------------------------------------|----------------------------|
//! | `DownloadDeletionLocalUpload` | drop uploads, mark deleted on server  | flag uploads to undelete   |
//! | `DownloadLocalUploadDeletion` | drop the pending deletion             | nothing                    |
//! | `DownloadLocalUpload`         | drop the pending upload               | nothing                    |

use tracing::{debug, info};

use lockstep_core::domain::{
    conflict::{ConflictResolution, ConflictType},
    newtypes::FileUuid,
    store::OperationStore,
};

use crate::error::ConflictError;

/// Applies `resolution` of a `conflict_type` conflict on `uuid` to `store`
///
/// Committed batches may be edited; a batch emptied this way is skipped
/// when promoted.
///
/// # Errors
/// `ConflictError::Usage` if the store has no record of `uuid`
pub fn apply_resolution(
    store: &mut OperationStore,
    uuid: FileUuid,
    conflict_type: ConflictType,
    resolution: ConflictResolution,
) -> Result<(), ConflictError> {
    if store.record(uuid).is_none() {
        return Err(ConflictError::Usage(format!("no local record for {uuid}")));
    }

    info!(
        uuid = %uuid,
        conflict = %conflict_type,
        resolution = %resolution,
        "Applying conflict resolution"
    );

    match (conflict_type, resolution) {
        (
            ConflictType::DownloadDeletionLocalUpload,
            ConflictResolution::DeleteConflictingClientOperations,
        ) => {
            let removed = store.remove_pending_uploads(uuid);
            store.mark_deleted_on_server(uuid);
            debug!(uuid = %uuid, removed, "Dropped uploads of a file deleted on the server");
        }
        (
            ConflictType::DownloadDeletionLocalUpload,
            ConflictResolution::KeepConflictingClientOperations,
        ) => {
            let flagged = store.set_undelete_override(uuid);
            debug!(uuid = %uuid, flagged, "Uploads will restore the deleted file");
        }
        (
            ConflictType::DownloadLocalUploadDeletion,
            ConflictResolution::DeleteConflictingClientOperations,
        ) => {
            let removed = store.remove_pending_deletions(uuid);
            debug!(uuid = %uuid, removed, "Dropped pending deletion");
        }
        (
            ConflictType::DownloadLocalUpload,
            ConflictResolution::DeleteConflictingClientOperations,
        ) => {
            let removed = store.remove_pending_uploads(uuid);
            debug!(uuid = %uuid, removed, "Dropped pending upload");
        }
        (_, ConflictResolution::KeepConflictingClientOperations) => {
            debug!(uuid = %uuid, "Keeping pending local operations");
        }
    }

    Ok(())
}
