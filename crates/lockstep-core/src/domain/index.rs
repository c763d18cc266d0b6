//! Server file index entries
//!
//! The file index is fetched once per reconciliation pass and is never
//! persisted beyond that pass.

use serde::{Deserialize, Serialize};

use super::newtypes::{FileUuid, RemoteName};

/// One row of the server's authoritative file listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFileIndexEntry {
    pub uuid: FileUuid,
    pub version: u32,
    pub remote_name: RemoteName,
    pub mime_type: String,
    pub app_file_type: Option<String>,
    pub deleted: bool,
    pub size_bytes: u64,
}

/// Finds the entry for `uuid` in an index slice
pub fn find_entry(index: &[ServerFileIndexEntry], uuid: FileUuid) -> Option<&ServerFileIndexEntry> {
    index.iter().find(|entry| entry.uuid == uuid)
}
