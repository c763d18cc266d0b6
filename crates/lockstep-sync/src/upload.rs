//! Upload Engine
//!
//! Sends the active batch to the server and commits it, recovering from
//! failures at any point of the pipeline.
//!
//! ## Normal pipeline
//!
//! ```text
//! Lock ─► GetFileIndex ─► plan ─► DeleteFiles ─► UploadFile blocks
//!      ─► StartOutboundTransfer ─► poll CheckOperationStatus ─► wrap up
//! ```
//!
//! ## Recovery routing
//!
//! ```text
//!                    ┌──────── none / failed before transfer ────────┐
//!                    │                                                ▼
//! PossiblyCommitted ─┤                                  AwaitingLockAndIndex ── lock lost ─► Normal
//!  (GetOperationId)  ├── in progress ─► TransferInProgress{Poll}       │
//!                    └── failed with files ─► TransferInProgress{Retry*}   └─► resume sending
//! ```
//!
//! Each recovery category has its own attempt counter; entering a category
//! spends one attempt and backs off exponentially.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use lockstep_core::domain::{
    find_entry, FileAttributes, FileUpload, FileUuid, OperationStore,
    ServerFileIndexEntry, TransferResume, UploadBatch, UploadProgress, UploadStage,
};
use lockstep_core::ports::{ApiError, FileToDelete, OperationStatus, OperationStatusCode, SyncEvent, UploadBlock};

use crate::context::EngineContext;
use crate::retry::with_retry;
use crate::SyncError;

// ============================================================================
// Planning
// ============================================================================

/// One upload checked against the server index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpload {
    pub upload: FileUpload,
    /// Version the file gets once the batch commits
    pub version: u32,
    pub attributes: FileAttributes,
}

/// Work the active batch sends to the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub deletions: Vec<FileToDelete>,
    pub uploads: Vec<PlannedUpload>,
}

/// Checks every operation of `batch` against the server `index`
///
/// A deletion needs a live entry at the recorded version. An upload of a
/// new file needs no entry at all; an upload of a known file needs an
/// entry at the recorded version that is live unless the upload restores
/// the file.
///
/// # Errors
/// `SyncError::ClientUsage` naming the first operation that cannot be sent
pub fn plan_batch(
    batch: &UploadBatch,
    store: &OperationStore,
    index: &[ServerFileIndexEntry],
) -> Result<UploadPlan, SyncError> {
    let mut plan = UploadPlan::default();

    for uuid in batch.deletions() {
        let version = store
            .record(uuid)
            .and_then(|record| record.local_version())
            .ok_or_else(|| SyncError::ClientUsage(format!("deletion of unsynced file {uuid}")))?;
        match find_entry(index, uuid) {
            Some(entry) if !entry.deleted && entry.version == version => {
                plan.deletions.push(FileToDelete { uuid, version });
            }
            Some(entry) => {
                return Err(SyncError::ClientUsage(format!(
                    "cannot delete {uuid} at version {version}: server has version {}{}",
                    entry.version,
                    if entry.deleted { " (deleted)" } else { "" }
                )));
            }
            None => {
                return Err(SyncError::ClientUsage(format!(
                    "cannot delete {uuid}: not on the server"
                )));
            }
        }
    }

    for upload in batch.uploads() {
        let uuid = upload.uuid;
        let record = store
            .record(uuid)
            .ok_or_else(|| SyncError::ClientUsage(format!("upload of unknown file {uuid}")))?;
        let (Some(remote_name), Some(mime_type)) = (record.remote_name(), record.mime_type())
        else {
            return Err(SyncError::ClientUsage(format!(
                "upload of {uuid} has no remote name or MIME type"
            )));
        };

        let entry = find_entry(index, uuid);
        match (record.local_version(), entry) {
            (None, None) => {}
            (None, Some(_)) => {
                return Err(SyncError::ClientUsage(format!(
                    "first upload of {uuid}: the server already has this file"
                )));
            }
            (Some(version), Some(entry)) if entry.version == version => {
                if entry.deleted && !upload.undelete_override {
                    return Err(SyncError::ClientUsage(format!(
                        "cannot upload {uuid}: it was deleted on the server"
                    )));
                }
            }
            (Some(version), Some(entry)) => {
                return Err(SyncError::ClientUsage(format!(
                    "cannot upload {uuid} over version {version}: server has version {}",
                    entry.version
                )));
            }
            (Some(version), None) => {
                return Err(SyncError::ClientUsage(format!(
                    "cannot upload {uuid} over version {version}: not on the server"
                )));
            }
        }

        let mut attributes = FileAttributes::new(remote_name.clone(), mime_type);
        if let Some(app_file_type) = record.app_file_type() {
            attributes = attributes.with_app_file_type(app_file_type);
        }
        plan.uploads.push(PlannedUpload {
            upload: upload.clone(),
            version: record.version_after_commit(),
            attributes,
        });
    }

    Ok(plan)
}

// ============================================================================
// UploadEngine
// ============================================================================

/// What the engine does after a stage handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Move to a stage as part of normal progress
    Goto(UploadStage),
    /// Enter a recovery category, spending one attempt
    Recover(UploadStage),
    /// The batch is committed and applied
    Done,
}

/// Drives the active batch to a committed state
pub struct UploadEngine<'a> {
    ctx: &'a EngineContext,
}

impl<'a> UploadEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Runs the state machine until the active batch is committed
    ///
    /// # Errors
    /// - `NetworkUnavailable` after persisting the stage to resume from
    /// - `LockDeferred` if another device holds the lock
    /// - `ClientUsage` if the batch contradicts the server index
    /// - `NonRecoverable` once a recovery category is exhausted
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), SyncError> {
        loop {
            let stage = self.ctx.read(|s| s.upload.stage).await;
            debug!(stage = %stage, "Upload stage");

            let step = match stage {
                UploadStage::Normal => self.normal().await?,
                UploadStage::AwaitingLockAndIndex => self.awaiting_lock_and_index().await?,
                UploadStage::PossiblyCommitted => self.possibly_committed().await?,
                UploadStage::TransferInProgress { resume } => {
                    self.transfer_in_progress(resume).await?
                }
            };

            match step {
                Step::Goto(next) => {
                    self.ctx.update(|s| s.upload.stage = next).await?;
                }
                Step::Recover(next) => self.enter_recovery(next).await?,
                Step::Done => return Ok(()),
            }
        }
    }

    /// Spends one attempt of `stage`'s category and backs off
    async fn enter_recovery(&self, stage: UploadStage) -> Result<(), SyncError> {
        let attempt = self
            .ctx
            .update(|s| {
                s.upload.stage = stage;
                match s.upload.counters.for_stage_mut(&stage) {
                    Some(counter) => {
                        *counter += 1;
                        *counter
                    }
                    None => 0,
                }
            })
            .await?;

        let backoff = self.ctx.settings.backoff;
        if backoff.exhausted(attempt) {
            warn!(stage = %stage, attempt, "Upload recovery exhausted");
            return Err(SyncError::NonRecoverable(format!(
                "upload recovery exhausted in {stage} after {} attempts",
                backoff.max_attempts()
            )));
        }

        info!(stage = %stage, attempt, "Entering upload recovery");
        self.ctx.emit(SyncEvent::Recovery {
            stage: stage.to_string(),
        });
        backoff.pause(attempt).await;
        Ok(())
    }

    /// Maps a server error to the next step
    ///
    /// Network failures persist `resume_at` and end the cycle. Transient
    /// failures retry `retry_stage`; a lost lock goes through
    /// `AwaitingLockAndIndex`.
    async fn route_error(
        &self,
        err: ApiError,
        retry_stage: UploadStage,
        resume_at: UploadStage,
    ) -> Result<Step, SyncError> {
        match err {
            ApiError::NetworkUnavailable(detail) => {
                warn!(resume_at = %resume_at, "Network lost during upload");
                self.ctx.update(|s| s.upload.stage = resume_at).await?;
                Err(SyncError::NetworkUnavailable(detail))
            }
            ApiError::LockNotHeld => Ok(Step::Recover(UploadStage::AwaitingLockAndIndex)),
            err if err.is_transient() => {
                warn!(error = %err, retry = %retry_stage, "Upload step failed");
                Ok(Step::Recover(retry_stage))
            }
            err => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Normal
    // ------------------------------------------------------------------

    async fn normal(&self) -> Result<Step, SyncError> {
        self.ctx.ensure_lock().await?;
        self.send_batch().await
    }

    /// Fetches the index, plans and sends everything not yet uploaded,
    /// then starts the outbound transfer
    async fn send_batch(&self) -> Result<Step, SyncError> {
        let index = match self.ctx.server.get_file_index().await {
            Ok(index) => index,
            Err(err) => {
                return self
                    .route_error(err, UploadStage::AwaitingLockAndIndex, UploadStage::PossiblyCommitted)
                    .await
            }
        };

        let (plan, uploaded) = self
            .ctx
            .read(|s| {
                let batch = s.store.active_batch().cloned().unwrap_or_default();
                plan_batch(&batch, &s.store, &index).map(|plan| (plan, s.upload.uploaded.clone()))
            })
            .await?;

        if !plan.deletions.is_empty() {
            if let Err(err) = self.ctx.server.delete_files(&plan.deletions).await {
                return self
                    .route_error(err, UploadStage::AwaitingLockAndIndex, UploadStage::PossiblyCommitted)
                    .await;
            }
            let uuids: Vec<FileUuid> = plan.deletions.iter().map(|d| d.uuid).collect();
            info!(count = uuids.len(), "Deletions sent");
            self.ctx.emit(SyncEvent::DeletionsSent { uuids });
        }

        for planned in plan.uploads.iter().filter(|p| !uploaded.contains(&p.upload.uuid)) {
            if let Err(err) = self.upload_file(planned).await? {
                return self
                    .route_error(err, UploadStage::AwaitingLockAndIndex, UploadStage::PossiblyCommitted)
                    .await;
            }
            let uuid = planned.upload.uuid;
            self.ctx.update(|s| s.upload.uploaded.insert(uuid)).await?;
            self.ctx.emit(SyncEvent::SingleUploadComplete { uuid });
        }

        match self.ctx.server.start_outbound_transfer().await {
            Ok(operation_id) => {
                info!(operation_id = %operation_id, "Outbound transfer started");
                self.ctx
                    .update(|s| s.upload.operation_id = Some(operation_id))
                    .await?;
                Ok(Step::Goto(UploadStage::TransferInProgress {
                    resume: TransferResume::Poll,
                }))
            }
            Err(err) => {
                self.route_error(err, UploadStage::PossiblyCommitted, UploadStage::PossiblyCommitted)
                    .await
            }
        }
    }

    /// Sends every block of one file
    ///
    /// The outer result fails when the payload cannot be read; the inner
    /// one carries server errors for routing.
    async fn upload_file(&self, planned: &PlannedUpload) -> Result<Result<(), ApiError>, SyncError> {
        let upload = &planned.upload;
        let block_count = u32::try_from(upload.blocks.len())
            .map_err(|_| SyncError::ClientUsage(format!("{} has too many blocks", upload.uuid)))?;

        for (block_index, block) in (0u32..).zip(upload.blocks.iter()) {
            let data = self
                .ctx
                .fs
                .read_block(&upload.payload, block.offset, block.length)
                .await
                .map_err(|e| {
                    SyncError::ClientUsage(format!(
                        "cannot read payload of {}: {e:#}",
                        upload.uuid
                    ))
                })?;

            let request = UploadBlock {
                uuid: upload.uuid,
                version: planned.version,
                attributes: planned.attributes.clone(),
                undelete: upload.undelete_override,
                block_index,
                block_count,
                data,
            };
            if let Err(err) = self.ctx.server.upload_file_block(request).await {
                return Ok(Err(err));
            }
        }

        debug!(uuid = %upload.uuid, blocks = block_count, "File uploaded");
        Ok(Ok(()))
    }

    // ------------------------------------------------------------------
    // Recovery stages
    // ------------------------------------------------------------------

    async fn possibly_committed(&self) -> Result<Step, SyncError> {
        let here = UploadStage::PossiblyCommitted;
        let operation_id = match self.ctx.server.get_operation_id().await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!("No commit reached the server");
                return Ok(Step::Recover(UploadStage::AwaitingLockAndIndex));
            }
            Err(err) => return self.route_error(err, here, here).await,
        };

        let id = operation_id.clone();
        self.ctx.update(|s| s.upload.operation_id = Some(id)).await?;

        let status = match self.ctx.server.check_operation_status(&operation_id).await {
            Ok(status) => status,
            Err(err) => return self.route_error(err, here, here).await,
        };
        info!(operation_id = %operation_id, status = %status.code, "Found earlier commit");

        Ok(match status.code {
            OperationStatusCode::NotStarted => Step::Recover(here),
            OperationStatusCode::InProgress => Step::Recover(UploadStage::TransferInProgress {
                resume: TransferResume::Poll,
            }),
            OperationStatusCode::Succeeded => {
                self.wrap_up().await?;
                Step::Done
            }
            _ => route_failed_transfer(&status),
        })
    }

    async fn awaiting_lock_and_index(&self) -> Result<Step, SyncError> {
        let here = UploadStage::AwaitingLockAndIndex;
        let recovery = match self.ctx.server.upload_recovery().await {
            Ok(recovery) => recovery,
            Err(ApiError::LockNotHeld) => {
                info!("Lock lost; restarting the batch from scratch");
                self.ctx.lock_released().await?;
                self.ctx
                    .update(|s| {
                        s.upload.uploaded.clear();
                        s.upload.operation_id = None;
                    })
                    .await?;
                return Ok(Step::Goto(UploadStage::Normal));
            }
            Err(err) => return self.route_error(err, here, here).await,
        };

        if let Some(operation_id) = recovery.operation_id {
            info!(operation_id = %operation_id, "Commit already exists; polling");
            self.ctx
                .update(|s| {
                    s.server_lock_held = true;
                    s.upload.operation_id = Some(operation_id);
                })
                .await?;
            return Ok(Step::Goto(UploadStage::TransferInProgress {
                resume: TransferResume::Poll,
            }));
        }

        let staged: BTreeSet<FileUuid> = recovery
            .uploaded
            .unwrap_or_default()
            .iter()
            .map(|entry| entry.uuid)
            .collect();
        debug!(staged = staged.len(), "Resuming batch");
        self.ctx
            .update(|s| {
                s.server_lock_held = true;
                let in_batch: BTreeSet<FileUuid> = s
                    .store
                    .active_batch()
                    .map(|batch| batch.uploads().map(|u| u.uuid).collect())
                    .unwrap_or_default();
                s.upload.uploaded = staged.intersection(&in_batch).copied().collect();
                s.upload.stage = UploadStage::Normal;
            })
            .await?;

        self.send_batch().await
    }

    async fn transfer_in_progress(&self, resume: TransferResume) -> Result<Step, SyncError> {
        let here = UploadStage::TransferInProgress { resume };
        if resume == TransferResume::Poll {
            return self.poll().await;
        }

        match self.ctx.server.outbound_transfer_recovery().await {
            Ok(()) => {
                self.ctx
                    .update(|s| {
                        s.upload.stage = UploadStage::TransferInProgress {
                            resume: TransferResume::Poll,
                        }
                    })
                    .await?;
                self.poll().await
            }
            Err(ApiError::LockNotHeld) if resume == TransferResume::RetryAfterTransfer => {
                info!("Server already finished the transfer");
                self.wrap_up().await?;
                Ok(Step::Done)
            }
            Err(ApiError::LockNotHeld) => Ok(Step::Recover(UploadStage::AwaitingLockAndIndex)),
            Err(err) => self.route_error(err, here, here).await,
        }
    }

    /// Polls the outbound transfer until it finishes
    async fn poll(&self) -> Result<Step, SyncError> {
        let here = UploadStage::TransferInProgress {
            resume: TransferResume::Poll,
        };
        let Some(operation_id) = self.ctx.read(|s| s.upload.operation_id.clone()).await else {
            return Ok(Step::Recover(UploadStage::PossiblyCommitted));
        };

        for attempt in 1..=self.ctx.settings.max_poll_attempts {
            let status = match self.ctx.server.check_operation_status(&operation_id).await {
                Ok(status) => status,
                Err(err) => {
                    return self
                        .route_error(err, UploadStage::PossiblyCommitted, here)
                        .await
                }
            };

            match status.code {
                OperationStatusCode::Succeeded => {
                    self.wrap_up().await?;
                    return Ok(Step::Done);
                }
                OperationStatusCode::NotStarted | OperationStatusCode::InProgress => {
                    debug!(attempt, count = status.count, "Outbound transfer running");
                    tokio::time::sleep(self.ctx.settings.poll_interval).await;
                }
                _ => {
                    warn!(
                        status = %status.code,
                        count = status.count,
                        error = status.error.as_deref().unwrap_or(""),
                        "Outbound transfer failed"
                    );
                    return Ok(route_failed_transfer(&status));
                }
            }
        }

        Err(SyncError::NonRecoverable(format!(
            "outbound transfer {operation_id} did not finish after {} polls",
            self.ctx.settings.max_poll_attempts
        )))
    }

    // ------------------------------------------------------------------
    // Wrap up
    // ------------------------------------------------------------------

    /// Removes the server's operation id, then applies the committed batch
    /// and clears the upload progress
    ///
    /// The server released the lock when the transfer finished. Nothing
    /// local changes until the id is gone.
    async fn wrap_up(&self) -> Result<(), SyncError> {
        self.remove_operation_id().await?;

        let completed = self
            .ctx
            .update(|s| {
                let completed = s.store.complete_active_batch();
                s.upload = UploadProgress::default();
                completed
            })
            .await?;
        self.ctx.lock_released().await?;

        for payload in &completed.temporary_payloads {
            if let Err(e) = self.ctx.fs.remove_file(payload).await {
                warn!(path = %payload.display(), error = %e, "Failed to remove temporary payload");
            }
        }

        let files = completed.uploaded.len() + completed.deleted.len();
        info!(
            uploaded = completed.uploaded.len(),
            deleted = completed.deleted.len(),
            "Outbound transfer complete"
        );
        self.ctx.emit(SyncEvent::OutboundTransferComplete { files });
        Ok(())
    }

    /// Retries `RemoveOperationId` within the recovery budget
    ///
    /// A network failure leaves the batch in `PossiblyCommitted`, which
    /// finds the succeeded commit again and repeats the wrap up. Any other
    /// failure ends the cycle as non-recoverable.
    async fn remove_operation_id(&self) -> Result<(), SyncError> {
        let backoff = self.ctx.settings.backoff;
        let server = &self.ctx.server;
        match with_retry(&backoff, "remove_operation_id", move || server.remove_operation_id()).await {
            Ok(()) => Ok(()),
            Err(ApiError::NetworkUnavailable(detail)) => {
                warn!("Network lost before the operation id was removed");
                self.ctx
                    .update(|s| s.upload.stage = UploadStage::PossiblyCommitted)
                    .await?;
                Err(SyncError::NetworkUnavailable(detail))
            }
            Err(err) => Err(SyncError::NonRecoverable(format!(
                "cannot remove outbound operation id: {err}"
            ))),
        }
    }
}

/// Next step for a failed commit or transfer
fn route_failed_transfer(status: &OperationStatus) -> Step {
    match status.code {
        OperationStatusCode::FailedDuringTransfer if status.count > 0 => {
            Step::Recover(UploadStage::TransferInProgress {
                resume: TransferResume::RetryDuringTransfer,
            })
        }
        OperationStatusCode::FailedAfterTransfer if status.count > 0 => {
            Step::Recover(UploadStage::TransferInProgress {
                resume: TransferResume::RetryAfterTransfer,
            })
        }
        _ => Step::Recover(UploadStage::AwaitingLockAndIndex),
    }
}

/// Used by the orchestrator to describe a resumed upload
pub fn describe_stage(progress: &UploadProgress) -> String {
    match &progress.operation_id {
        Some(id) => format!("{} ({id})", progress.stage),
        None => progress.stage.to_string(),
    }
}
