//! Sync delegate port (driving side callbacks)
//!
//! The host application implements [`ISyncDelegate`] to observe engine
//! progress and to take over downloaded content.
//!
//! ## Design Notes
//!
//! - Events are fire-and-forget; `on_event` must not block.
//! - `deliver` hands over ownership of one whole download pass. The pass
//!   completes only once every acknowledgement has been given and every
//!   conflict resolved, which may happen after `deliver` returns.

use serde::{Deserialize, Serialize};

use crate::domain::delivery::DownloadDelivery;
use crate::domain::mode::SyncMode;
use crate::domain::newtypes::FileUuid;

/// Progress notifications emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ModeChanged { mode: SyncMode },
    /// A trigger arrived while a cycle was already running
    AlreadyRunning,
    /// Another device holds the server lock; the cycle was deferred
    LockDeferred,
    /// An interrupted cycle is being recovered
    Recovery { stage: String },
    DeletionsSent { uuids: Vec<FileUuid> },
    SingleUploadComplete { uuid: FileUuid },
    OutboundTransferComplete { files: usize },
    SingleDownloadComplete { uuid: FileUuid },
    InboundTransferComplete { files: usize },
    /// Reconciliation found nothing to download
    NoFilesToDownload,
}

impl std::fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncEvent::ModeChanged { mode } => write!(f, "mode changed to {}", mode),
            SyncEvent::AlreadyRunning => write!(f, "sync already running"),
            SyncEvent::LockDeferred => write!(f, "server lock held elsewhere, deferred"),
            SyncEvent::Recovery { stage } => write!(f, "recovering from {}", stage),
            SyncEvent::DeletionsSent { uuids } => write!(f, "{} deletion(s) sent", uuids.len()),
            SyncEvent::SingleUploadComplete { uuid } => write!(f, "uploaded {}", uuid),
            SyncEvent::OutboundTransferComplete { files } => {
                write!(f, "outbound transfer complete ({} file(s))", files)
            }
            SyncEvent::SingleDownloadComplete { uuid } => write!(f, "downloaded {}", uuid),
            SyncEvent::InboundTransferComplete { files } => {
                write!(f, "inbound transfer complete ({} file(s))", files)
            }
            SyncEvent::NoFilesToDownload => write!(f, "no files to download"),
        }
    }
}

/// Port trait implemented by the host application
#[async_trait::async_trait]
pub trait ISyncDelegate: Send + Sync {
    /// Receives a progress event
    fn on_event(&self, event: SyncEvent);

    /// Takes over one download pass
    ///
    /// # Errors
    /// An error leaves the pass pending; it is delivered again on the next
    /// sync
    async fn deliver(&self, delivery: DownloadDelivery) -> anyhow::Result<()>;
}

/// Delegate that ignores events and leaves every delivery pending
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDelegate;

#[async_trait::async_trait]
impl ISyncDelegate for NullDelegate {
    fn on_event(&self, _event: SyncEvent) {}

    async fn deliver(&self, _delivery: DownloadDelivery) -> anyhow::Result<()> {
        Ok(())
    }
}
