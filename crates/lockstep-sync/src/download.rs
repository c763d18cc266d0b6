//! Download Engine
//!
//! Carries one download pass from the server into the host application.
//!
//! ```text
//! SetupRemoteStaging ─► StartTransfer ─► PollUntilFinished ─► RemoveOperationId
//!         ▲                                     │
//!         └────────── failed status ────────────┘
//!
//! ─► PerformFileTransfers ─► DeliverAtomically
//! ```
//!
//! The stage is persisted after every transition, so a restarted process
//! resumes where the previous one stopped. The remote staging round (setup,
//! start, poll) shares one error counter; later stages reset it on entry.
//!
//! Delivery is all-or-nothing: records are updated only once the host has
//! acknowledged every file and deletion and resolved every conflict.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use lockstep_conflict::apply_resolution;
use lockstep_core::domain::{
    Acknowledgement, Conflict, ConflictResolution, ConflictType, DeliveredDeletion,
    DeliveredFile, DownloadDelivery, DownloadOperation, DownloadProgress, DownloadStage, FileUuid,
    TransferBlock,
};
use lockstep_core::ports::{ApiError, DownloadBlock, OperationStatusCode, SyncEvent};

use crate::context::EngineContext;
use crate::SyncError;

/// How a download run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The pass was delivered and applied
    Applied,
    /// The host did not answer every item; the pass stays pending
    Pending,
}

/// Result of one stage handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    To(DownloadStage),
    /// Count an error and continue at the given stage
    Retry(DownloadStage),
    Finished(DownloadOutcome),
}

/// Answer sent back from a delivered item
#[derive(Debug)]
enum Reply {
    Acknowledged,
    Resolved {
        uuid: FileUuid,
        conflict_type: ConflictType,
        resolution: ConflictResolution,
    },
}

/// Path a file download is staged at
pub fn staged_path(staging_dir: &std::path::Path, uuid: FileUuid, version: u32) -> PathBuf {
    staging_dir.join(format!("{uuid}.v{version}.download"))
}

/// Drives the pending download pass to completion
pub struct DownloadEngine<'a> {
    ctx: &'a EngineContext,
}

impl<'a> DownloadEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Runs the pass from its persisted stage
    ///
    /// # Errors
    /// - `NetworkUnavailable` with the stage persisted
    /// - `NonRecoverable` once a stage exhausts its error budget
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<DownloadOutcome, SyncError> {
        self.skip_transfer_if_nothing_to_fetch().await?;

        loop {
            let stage = self.ctx.read(|s| s.download.stage).await;
            debug!(stage = %stage, "Download stage");

            match self.step(stage).await? {
                Transition::To(next) => {
                    self.ctx
                        .update(|s| {
                            s.download.stage = next;
                            if !matches!(
                                next,
                                DownloadStage::StartTransfer | DownloadStage::PollUntilFinished
                            ) {
                                s.download.error_count = 0;
                            }
                        })
                        .await?;
                }
                Transition::Retry(next) => self.count_error(stage, next).await?,
                Transition::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    /// A pass without file downloads goes straight to delivery
    async fn skip_transfer_if_nothing_to_fetch(&self) -> Result<(), SyncError> {
        let skip = self
            .ctx
            .read(|s| {
                let has_downloads = s
                    .store
                    .download_pass()
                    .iter()
                    .any(DownloadOperation::is_file_download);
                !has_downloads && s.download.stage != DownloadStage::DeliverAtomically
            })
            .await;
        if skip {
            debug!("No file downloads in pass; delivering directly");
            self.ctx
                .update(|s| {
                    s.download = DownloadProgress {
                        stage: DownloadStage::DeliverAtomically,
                        ..DownloadProgress::default()
                    }
                })
                .await?;
        }
        Ok(())
    }

    async fn count_error(&self, failed: DownloadStage, next: DownloadStage) -> Result<(), SyncError> {
        let attempt = self
            .ctx
            .update(|s| {
                s.download.error_count += 1;
                s.download.stage = next;
                s.download.error_count
            })
            .await?;

        let backoff = self.ctx.settings.backoff;
        if backoff.exhausted(attempt) {
            warn!(stage = %failed, attempt, "Download stage exhausted");
            return Err(SyncError::NonRecoverable(format!(
                "download failed in {failed} after {} attempts",
                backoff.max_attempts()
            )));
        }
        warn!(stage = %failed, attempt, "Download stage failed, retrying");
        backoff.pause(attempt).await;
        Ok(())
    }

    /// Maps a server error for `stage`
    async fn route_error(&self, stage: DownloadStage, err: ApiError) -> Result<Transition, SyncError> {
        match err {
            ApiError::LockNotHeld => {
                self.ctx.lock_released().await?;
                Ok(Transition::Retry(DownloadStage::SetupRemoteStaging))
            }
            err if err.is_transient() => {
                debug!(stage = %stage, error = %err, "Transient download error");
                Ok(Transition::Retry(stage))
            }
            err => Err(err.into()),
        }
    }

    async fn step(&self, stage: DownloadStage) -> Result<Transition, SyncError> {
        match stage {
            DownloadStage::SetupRemoteStaging => self.setup_remote_staging().await,
            DownloadStage::StartTransfer => self.start_transfer().await,
            DownloadStage::PollUntilFinished => self.poll_until_finished().await,
            DownloadStage::RemoveOperationId => self.remove_operation_id().await,
            DownloadStage::PerformFileTransfers => self.perform_file_transfers().await,
            DownloadStage::DeliverAtomically => self.deliver_atomically().await,
        }
    }

    // ------------------------------------------------------------------
    // Remote staging round
    // ------------------------------------------------------------------

    async fn setup_remote_staging(&self) -> Result<Transition, SyncError> {
        self.ctx.ensure_lock().await?;

        let uuids: Vec<FileUuid> = self
            .ctx
            .read(|s| {
                s.store
                    .download_pass()
                    .iter()
                    .filter(|op| op.is_file_download())
                    .filter_map(DownloadOperation::uuid)
                    .collect()
            })
            .await;

        match self.ctx.server.setup_inbound_transfer(&uuids).await {
            Ok(()) => {
                debug!(files = uuids.len(), "Inbound staging set up");
                Ok(Transition::To(DownloadStage::StartTransfer))
            }
            Err(err) => self.route_error(DownloadStage::SetupRemoteStaging, err).await,
        }
    }

    async fn start_transfer(&self) -> Result<Transition, SyncError> {
        match self.ctx.server.start_inbound_transfer().await {
            Ok(operation_id) => {
                info!(operation_id = %operation_id, "Inbound transfer started");
                self.ctx
                    .update(|s| s.download.operation_id = Some(operation_id))
                    .await?;
                Ok(Transition::To(DownloadStage::PollUntilFinished))
            }
            Err(err) => self.route_error(DownloadStage::StartTransfer, err).await,
        }
    }

    async fn poll_until_finished(&self) -> Result<Transition, SyncError> {
        let Some(operation_id) = self.ctx.read(|s| s.download.operation_id.clone()).await else {
            return Ok(Transition::Retry(DownloadStage::SetupRemoteStaging));
        };

        for attempt in 1..=self.ctx.settings.max_poll_attempts {
            let status = match self.ctx.server.check_operation_status(&operation_id).await {
                Ok(status) => status,
                Err(err) => return self.route_error(DownloadStage::PollUntilFinished, err).await,
            };

            match status.code {
                OperationStatusCode::Succeeded => {
                    info!(operation_id = %operation_id, "Inbound transfer finished");
                    // The server releases the lock once the transfer is done
                    self.ctx.lock_released().await?;
                    return Ok(Transition::To(DownloadStage::RemoveOperationId));
                }
                OperationStatusCode::NotStarted | OperationStatusCode::InProgress => {
                    debug!(attempt, count = status.count, "Inbound transfer running");
                    tokio::time::sleep(self.ctx.settings.poll_interval).await;
                }
                code => {
                    warn!(
                        status = %code,
                        error = status.error.as_deref().unwrap_or(""),
                        "Inbound transfer failed"
                    );
                    self.ctx.update(|s| s.download.operation_id = None).await?;
                    return Ok(Transition::Retry(DownloadStage::SetupRemoteStaging));
                }
            }
        }

        Err(SyncError::NonRecoverable(format!(
            "inbound transfer {operation_id} did not finish after {} polls",
            self.ctx.settings.max_poll_attempts
        )))
    }

    async fn remove_operation_id(&self) -> Result<Transition, SyncError> {
        match self.ctx.server.remove_operation_id().await {
            Ok(()) => {
                self.ctx.update(|s| s.download.operation_id = None).await?;
                Ok(Transition::To(DownloadStage::PerformFileTransfers))
            }
            Err(err) => self.route_error(DownloadStage::RemoveOperationId, err).await,
        }
    }

    // ------------------------------------------------------------------
    // Local transfer
    // ------------------------------------------------------------------

    async fn perform_file_transfers(&self) -> Result<Transition, SyncError> {
        let pending: Vec<(usize, FileUuid, u32, u64)> = self
            .ctx
            .read(|s| {
                s.store
                    .download_pass()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, op)| match op {
                        DownloadOperation::FileDownload {
                            uuid,
                            version,
                            size_bytes,
                            transferred: false,
                            ..
                        } => Some((i, *uuid, *version, *size_bytes)),
                        _ => None,
                    })
                    .collect()
            })
            .await;

        for (position, uuid, version, size_bytes) in pending {
            let path = staged_path(&self.ctx.settings.staging_dir, uuid, version);
            if let Err(err) = self.fetch_file(&path, uuid, version, size_bytes).await? {
                return self
                    .route_error(DownloadStage::PerformFileTransfers, err)
                    .await;
            }

            self.ctx
                .update(|s| {
                    if let Some(DownloadOperation::FileDownload {
                        staged_path,
                        transferred,
                        ..
                    }) = s.store.download_pass_mut().get_mut(position)
                    {
                        *staged_path = Some(path);
                        *transferred = true;
                    }
                })
                .await?;
            self.ctx.emit(SyncEvent::SingleDownloadComplete { uuid });
        }

        Ok(Transition::To(DownloadStage::DeliverAtomically))
    }

    /// Writes every block of one file into `path`
    ///
    /// The outer result carries local I/O failures, the inner one server
    /// errors for routing.
    async fn fetch_file(
        &self,
        path: &std::path::Path,
        uuid: FileUuid,
        version: u32,
        size_bytes: u64,
    ) -> Result<Result<(), ApiError>, SyncError> {
        if size_bytes == 0 {
            self.ctx.fs.write_file(path, &[]).await?;
            return Ok(Ok(()));
        }

        for block in TransferBlock::split(size_bytes, self.ctx.settings.block_size) {
            let request = DownloadBlock {
                uuid,
                version,
                offset: block.offset,
                length: block.length,
            };
            let data = match self.ctx.server.download_file_block(request).await {
                Ok(data) => data,
                Err(err) => return Ok(Err(err)),
            };
            self.ctx.fs.write_block(path, block.offset, &data).await?;
        }

        debug!(uuid = %uuid, version, bytes = size_bytes, "File downloaded");
        Ok(Ok(()))
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    async fn deliver_atomically(&self) -> Result<Transition, SyncError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
        let delivery = self.ctx.read(|s| build_delivery(s, &tx)).await?;
        drop(tx);

        let acks_expected = delivery.acknowledgements_expected();
        let resolutions_expected = delivery.conflicts.len();
        info!(
            downloads = delivery.downloads.len(),
            deletions = delivery.deletions.len(),
            conflicts = resolutions_expected,
            "Delivering download pass"
        );

        if let Err(e) = self.ctx.delegate.deliver(delivery).await {
            warn!(error = %e, "Delivery rejected; pass stays pending");
            return Ok(Transition::Finished(DownloadOutcome::Pending));
        }

        let mut acks = 0;
        let mut resolutions = Vec::with_capacity(resolutions_expected);
        while acks < acks_expected || resolutions.len() < resolutions_expected {
            match rx.recv().await {
                Some(Reply::Acknowledged) => acks += 1,
                Some(Reply::Resolved {
                    uuid,
                    conflict_type,
                    resolution,
                }) => resolutions.push((uuid, conflict_type, resolution)),
                None => {
                    info!(
                        acks,
                        acks_expected,
                        resolved = resolutions.len(),
                        resolutions_expected,
                        "Delivery abandoned; pass stays pending"
                    );
                    return Ok(Transition::Finished(DownloadOutcome::Pending));
                }
            }
        }

        let completed = self
            .ctx
            .update(|s| -> Result<_, SyncError> {
                for (uuid, conflict_type, resolution) in &resolutions {
                    apply_resolution(&mut s.store, *uuid, *conflict_type, *resolution)?;
                }
                let completed = s.store.complete_download_pass();
                s.download = DownloadProgress::default();
                Ok(completed)
            })
            .await??;

        info!(
            downloaded = completed.downloaded.len(),
            deleted = completed.deleted.len(),
            "Download pass applied"
        );
        self.ctx.emit(SyncEvent::InboundTransferComplete {
            files: completed.downloaded.len(),
        });
        Ok(Transition::Finished(DownloadOutcome::Applied))
    }
}

/// Builds the delivery for the pending pass; every handle reports on `tx`
fn build_delivery(
    snapshot: &lockstep_core::domain::EngineSnapshot,
    tx: &mpsc::UnboundedSender<Reply>,
) -> Result<DownloadDelivery, SyncError> {
    let mut delivery = DownloadDelivery::default();
    let pass = snapshot.store.download_pass();

    let ack = || {
        let tx = tx.clone();
        Acknowledgement::new(move || {
            let _ = tx.send(Reply::Acknowledged);
        })
    };

    for op in pass {
        match op {
            DownloadOperation::FileDownload {
                uuid,
                version,
                remote_name,
                mime_type,
                app_file_type,
                staged_path,
                transferred,
                ..
            } => {
                let path = match (staged_path, transferred) {
                    (Some(path), true) => path.clone(),
                    _ => {
                        return Err(SyncError::Internal(format!(
                            "delivering {uuid} before its content was transferred"
                        )))
                    }
                };
                delivery.downloads.push(DeliveredFile {
                    uuid: *uuid,
                    version: *version,
                    path,
                    remote_name: remote_name.clone(),
                    mime_type: mime_type.clone(),
                    app_file_type: app_file_type.clone(),
                    ack: ack(),
                });
            }
            DownloadOperation::FileDeletion { uuid, .. } => {
                delivery.deletions.push(DeliveredDeletion {
                    uuid: *uuid,
                    remote_name: snapshot
                        .store
                        .record(*uuid)
                        .and_then(|record| record.remote_name().cloned()),
                    ack: ack(),
                });
            }
            DownloadOperation::Conflict {
                uuid,
                conflict_type,
            } => {
                let (uuid, conflict_type) = (*uuid, *conflict_type);
                let remote_name = pass
                    .iter()
                    .find_map(|op| match op {
                        DownloadOperation::FileDownload {
                            uuid: u,
                            remote_name,
                            ..
                        } if *u == uuid => Some(remote_name.clone()),
                        _ => None,
                    })
                    .or_else(|| {
                        snapshot
                            .store
                            .record(uuid)
                            .and_then(|record| record.remote_name().cloned())
                    });
                let tx = tx.clone();
                let conflict = Conflict::new(uuid, conflict_type, move |resolution| {
                    let _ = tx.send(Reply::Resolved {
                        uuid,
                        conflict_type,
                        resolution,
                    });
                })
                .with_remote_name(remote_name);
                delivery.conflicts.push(conflict);
            }
            DownloadOperation::StartupMarker { .. } => {}
        }
    }

    Ok(delivery)
}
