//! Download delivery handed to the host application
//!
//! A delivery groups every file, deletion and conflict of one download
//! pass. Each file and deletion carries an [`Acknowledgement`] and each
//! conflict must be resolved; the pass only completes once all of them
//! have been answered.

use std::path::PathBuf;

use super::conflict::Conflict;
use super::newtypes::{FileUuid, RemoteName};

/// Consumable acknowledgement for one delivered item
///
/// Dropping it without calling [`acknowledge`](Acknowledgement::acknowledge)
/// leaves the pass pending.
pub struct Acknowledgement {
    callback: Box<dyn FnOnce() + Send>,
}

impl Acknowledgement {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn acknowledge(self) {
        (self.callback)();
    }
}

impl std::fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Acknowledgement")
    }
}

/// A downloaded file, staged locally and ready to be taken over
#[derive(Debug)]
pub struct DeliveredFile {
    pub uuid: FileUuid,
    pub version: u32,
    /// Staged content; the caller owns it after acknowledging
    pub path: PathBuf,
    pub remote_name: RemoteName,
    pub mime_type: String,
    pub app_file_type: Option<String>,
    pub ack: Acknowledgement,
}

/// A file another device deleted on the server
#[derive(Debug)]
pub struct DeliveredDeletion {
    pub uuid: FileUuid,
    /// Last known name, if the file was ever synced here
    pub remote_name: Option<RemoteName>,
    pub ack: Acknowledgement,
}

/// Everything one download pass delivers to the caller
#[derive(Debug, Default)]
pub struct DownloadDelivery {
    pub downloads: Vec<DeliveredFile>,
    pub deletions: Vec<DeliveredDeletion>,
    pub conflicts: Vec<Conflict>,
}

impl DownloadDelivery {
    /// Number of items that need an acknowledgement
    pub fn acknowledgements_expected(&self) -> usize {
        self.downloads.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.deletions.is_empty() && self.conflicts.is_empty()
    }
}
