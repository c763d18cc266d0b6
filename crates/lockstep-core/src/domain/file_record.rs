//! Per-file synchronization state
//!
//! A [`LocalFileRecord`] exists for every file the client knows about,
//! whether it was created locally or discovered in the server's file index.
//!
//! ## State Machine
//!
//! ```text
//!   enqueue upload (new uuid)           reconcile (new remote file)
//!            │                                    │
//!            ▼                                    ▼
//!   PendingInitialUpload               PendingInitialDownload
//!            │  batch committed                   │  pass delivered
//!            └──────────────► Synced ◄────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::index::ServerFileIndexEntry;
use super::newtypes::{FileUuid, RemoteName};

// ============================================================================
// SyncState
// ============================================================================

/// Where a file stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Created locally, never committed to the server
    PendingInitialUpload,
    /// Discovered on the server, never delivered to the caller
    PendingInitialDownload,
    /// Local and server versions agree as of the last completed batch or pass
    Synced,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::PendingInitialUpload => "pending_initial_upload",
            SyncState::PendingInitialDownload => "pending_initial_download",
            SyncState::Synced => "synced",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// FileAttributes
// ============================================================================

/// Caller-supplied attributes describing a file in cloud storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Name of the file in cloud storage
    pub remote_name: RemoteName,
    /// MIME type of the content
    pub mime_type: String,
    /// Opaque application tag, stored and returned unchanged
    pub app_file_type: Option<String>,
}

impl FileAttributes {
    /// Creates attributes without an application tag
    pub fn new(remote_name: RemoteName, mime_type: impl Into<String>) -> Self {
        Self {
            remote_name,
            mime_type: mime_type.into(),
            app_file_type: None,
        }
    }

    /// Sets the application tag
    pub fn with_app_file_type(mut self, app_file_type: impl Into<String>) -> Self {
        self.app_file_type = Some(app_file_type.into());
        self
    }
}

// ============================================================================
// LocalFileRecord
// ============================================================================

/// Client-side record of one synchronized file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    uuid: FileUuid,
    /// Version of the last content committed or delivered; unset until
    /// the first successful sync
    local_version: Option<u32>,
    mime_type: Option<String>,
    remote_name: Option<RemoteName>,
    app_file_type: Option<String>,
    deleted_on_server: bool,
    sync_state: SyncState,
    updated_at: DateTime<Utc>,
}

impl LocalFileRecord {
    /// Creates the record for a file whose first upload is being enqueued
    pub fn new_for_upload(uuid: FileUuid, attributes: &FileAttributes) -> Self {
        Self {
            uuid,
            local_version: None,
            mime_type: Some(attributes.mime_type.clone()),
            remote_name: Some(attributes.remote_name.clone()),
            app_file_type: attributes.app_file_type.clone(),
            deleted_on_server: false,
            sync_state: SyncState::PendingInitialUpload,
            updated_at: Utc::now(),
        }
    }

    /// Creates a provisional record for a file first seen in the server index
    ///
    /// The version stays unset until the download pass is delivered.
    pub fn new_provisional_download(entry: &ServerFileIndexEntry) -> Self {
        Self {
            uuid: entry.uuid,
            local_version: None,
            mime_type: Some(entry.mime_type.clone()),
            remote_name: Some(entry.remote_name.clone()),
            app_file_type: entry.app_file_type.clone(),
            deleted_on_server: false,
            sync_state: SyncState::PendingInitialDownload,
            updated_at: Utc::now(),
        }
    }

    /// Rebuilds a record from persisted fields
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        uuid: FileUuid,
        local_version: Option<u32>,
        mime_type: Option<String>,
        remote_name: Option<RemoteName>,
        app_file_type: Option<String>,
        deleted_on_server: bool,
        sync_state: SyncState,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid,
            local_version,
            mime_type,
            remote_name,
            app_file_type,
            deleted_on_server,
            sync_state,
            updated_at,
        }
    }

    pub fn uuid(&self) -> FileUuid {
        self.uuid
    }

    pub fn local_version(&self) -> Option<u32> {
        self.local_version
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn remote_name(&self) -> Option<&RemoteName> {
        self.remote_name.as_ref()
    }

    pub fn app_file_type(&self) -> Option<&str> {
        self.app_file_type.as_deref()
    }

    pub fn deleted_on_server(&self) -> bool {
        self.deleted_on_server
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The version this file will carry once its pending upload commits
    ///
    /// `local_version + 1`, or `0` for a file the server has never seen.
    pub fn version_after_commit(&self) -> u32 {
        self.local_version.map_or(0, |v| v + 1)
    }

    /// Applies the effect of a committed upload
    pub(crate) fn apply_committed_upload(&mut self, undelete: bool) {
        self.local_version = Some(self.version_after_commit());
        self.sync_state = SyncState::Synced;
        if undelete {
            self.deleted_on_server = false;
        }
        self.touch();
    }

    /// Applies the effect of a delivered download
    pub(crate) fn apply_download(
        &mut self,
        version: u32,
        remote_name: &RemoteName,
        mime_type: &str,
        app_file_type: Option<&str>,
    ) {
        self.local_version = Some(version);
        self.remote_name = Some(remote_name.clone());
        self.mime_type = Some(mime_type.to_string());
        self.app_file_type = app_file_type.map(str::to_string);
        self.deleted_on_server = false;
        self.sync_state = SyncState::Synced;
        self.touch();
    }

    pub(crate) fn mark_deleted_on_server(&mut self) {
        self.deleted_on_server = true;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
