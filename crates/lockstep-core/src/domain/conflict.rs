//! Conflict domain entities
//!
//! A conflict is a collision between a server-side change found during
//! reconciliation and a pending local change to the same file. The caller
//! resolves it through a one-shot [`Conflict`] object.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{FileUuid, RemoteName};

/// Kind of collision between a download pass and the local queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The server deleted the file while a local upload is pending
    DownloadDeletionLocalUpload,
    /// The server updated the file while a local deletion is pending
    DownloadLocalUploadDeletion,
    /// The server updated the file while a local upload is pending
    DownloadLocalUpload,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictType::DownloadDeletionLocalUpload => "download_deletion_local_upload",
            ConflictType::DownloadLocalUploadDeletion => "download_local_upload_deletion",
            ConflictType::DownloadLocalUpload => "download_local_upload",
        };
        write!(f, "{}", s)
    }
}

/// How the caller resolved a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Accept the server's change and drop the conflicting local operations
    DeleteConflictingClientOperations,
    /// Keep the local operations queued so they supersede the server's change
    KeepConflictingClientOperations,
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictResolution::DeleteConflictingClientOperations => "delete_conflicting",
            ConflictResolution::KeepConflictingClientOperations => "keep_conflicting",
        };
        write!(f, "{}", s)
    }
}

type ResolveCallback = Box<dyn FnOnce(ConflictResolution) + Send>;

/// One-shot conflict handed to the caller during delivery
///
/// [`resolve_conflict`](Conflict::resolve_conflict) may succeed exactly
/// once. Later calls fail with [`DomainError::ConflictAlreadyResolved`]
/// and never reach the callback.
pub struct Conflict {
    uuid: FileUuid,
    conflict_type: ConflictType,
    remote_name: Option<RemoteName>,
    callback: Mutex<Option<ResolveCallback>>,
}

impl Conflict {
    pub fn new(
        uuid: FileUuid,
        conflict_type: ConflictType,
        callback: impl FnOnce(ConflictResolution) + Send + 'static,
    ) -> Self {
        Self {
            uuid,
            conflict_type,
            remote_name: None,
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Attaches the file's remote name, for callers that resolve by name
    pub fn with_remote_name(mut self, remote_name: Option<RemoteName>) -> Self {
        self.remote_name = remote_name;
        self
    }

    pub fn uuid(&self) -> FileUuid {
        self.uuid
    }

    pub fn conflict_type(&self) -> ConflictType {
        self.conflict_type
    }

    pub fn remote_name(&self) -> Option<&RemoteName> {
        self.remote_name.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.callback
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// Resolves the conflict
    ///
    /// # Errors
    /// Returns `DomainError::ConflictAlreadyResolved` on every call after
    /// the first one
    pub fn resolve_conflict(&self, resolution: ConflictResolution) -> Result<(), DomainError> {
        let callback = {
            let mut guard = self
                .callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };

        match callback {
            Some(callback) => {
                callback(resolution);
                Ok(())
            }
            None => Err(DomainError::ConflictAlreadyResolved(self.uuid.to_string())),
        }
    }
}

impl std::fmt::Debug for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conflict")
            .field("uuid", &self.uuid)
            .field("conflict_type", &self.conflict_type)
            .field("remote_name", &self.remote_name)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
