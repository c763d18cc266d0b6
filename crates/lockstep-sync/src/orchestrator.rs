//! Sync Orchestrator
//!
//! Owns one engine instance and runs sync cycles. A cycle repeats the
//! priority loop until there is nothing left to do:
//!
//! 1. a pending download pass runs the Download Engine
//! 2. an active upload batch runs the Upload Engine
//! 3. without the lock, or without a fresh index, the index is fetched and
//!    reconciled
//! 4. the oldest committed batch is promoted
//! 5. otherwise the lock is released and the engine goes idle
//!
//! Only one cycle runs at a time: triggers that find the gate busy return
//! [`TriggerOutcome::AlreadyRunning`]. Enqueueing never takes the gate, so
//! callers can queue work while a cycle runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use lockstep_conflict::Reconciler;
use lockstep_core::domain::{
    DownloadOperation, DownloadProgress, EngineSnapshot, FileAttributes, FileUuid,
    LocalFileRecord, SyncMode, TransferBlock, UploadProgress,
};
use lockstep_core::ports::{
    ApiError, ILocalFileSystem, ISyncDelegate, ISyncServerApi, IStateStore, SyncEvent,
};

use crate::context::{EngineContext, SyncSettings};
use crate::download::{DownloadEngine, DownloadOutcome};
use crate::retry::with_retry;
use crate::upload::{describe_stage, UploadEngine};
use crate::SyncError;

/// How a call to [`SyncOrchestrator::trigger_sync`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The cycle ran until there was nothing left to do
    Completed,
    /// Another cycle holds the gate
    AlreadyRunning,
    /// Another device holds the server lock; try again later
    Deferred,
    /// The cycle stopped in this mode
    Halted(SyncMode),
}

/// What the priority loop does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextWork {
    Download,
    Upload,
    RefreshIndex,
    Promote,
    Stop,
}

/// One sync engine instance
pub struct SyncOrchestrator {
    ctx: EngineContext,
    gate: Arc<Mutex<()>>,
    commit_lock: Mutex<()>,
    /// Set when the loaded snapshot describes an interrupted cycle
    recovering: AtomicBool,
}

impl SyncOrchestrator {
    /// Restores the engine from `state_store`
    ///
    /// A snapshot left in `Synchronizing` belongs to a process that died
    /// mid-cycle; the next trigger recovers it.
    ///
    /// # Errors
    /// `SyncError::Storage` if the snapshot cannot be read or written
    pub async fn load(
        server: Arc<dyn ISyncServerApi>,
        state_store: Arc<dyn IStateStore>,
        fs: Arc<dyn ILocalFileSystem>,
        delegate: Arc<dyn ISyncDelegate>,
        settings: SyncSettings,
    ) -> Result<Self, SyncError> {
        let mut snapshot = state_store.load().await?.unwrap_or_default();
        let recovering = snapshot.prepare_for_recovery();
        if recovering {
            info!(
                upload_stage = %snapshot.upload.stage,
                download_stage = %snapshot.download.stage,
                "Previous cycle was interrupted; recovering on next trigger"
            );
            state_store.save(&snapshot).await?;
        }

        debug!(
            mode = %snapshot.mode,
            records = snapshot.store.records().count(),
            "Engine state loaded"
        );

        Ok(Self {
            ctx: EngineContext::new(server, state_store, fs, delegate, settings, snapshot),
            gate: Arc::new(Mutex::new(())),
            commit_lock: Mutex::new(()),
            recovering: AtomicBool::new(recovering),
        })
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn mode(&self) -> SyncMode {
        self.ctx.mode().await
    }

    /// True while a cycle holds the gate
    pub fn is_operating(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub async fn local_file_status(&self, uuid: FileUuid) -> Option<LocalFileRecord> {
        self.ctx.read(|s| s.store.record(uuid).cloned()).await
    }

    /// Read-only copy of the whole engine state
    pub async fn snapshot(&self) -> EngineSnapshot {
        self.ctx.read(EngineSnapshot::clone).await
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.ctx.settings
    }

    // ========================================================================
    // Enqueueing
    // ========================================================================

    /// Queues an upload of a file the caller keeps unchanged until it is sent
    ///
    /// # Errors
    /// `SyncError::ClientUsage` if the file cannot be read or the upload is
    /// not allowed for this uuid
    #[instrument(skip_all, fields(uuid = %uuid, path = %path.display()))]
    pub async fn upload_immutable_file(
        &self,
        uuid: FileUuid,
        path: PathBuf,
        attributes: Option<FileAttributes>,
    ) -> Result<(), SyncError> {
        self.enqueue_upload(uuid, path, attributes, false).await
    }

    /// Queues an upload of a file that is removed once committed
    #[instrument(skip_all, fields(uuid = %uuid, path = %path.display()))]
    pub async fn upload_temporary_file(
        &self,
        uuid: FileUuid,
        path: PathBuf,
        attributes: Option<FileAttributes>,
    ) -> Result<(), SyncError> {
        self.enqueue_upload(uuid, path, attributes, true).await
    }

    /// Stages `data` under the staging directory and queues it
    #[instrument(skip_all, fields(uuid = %uuid, bytes = data.len()))]
    pub async fn upload_data(
        &self,
        uuid: FileUuid,
        data: &[u8],
        attributes: Option<FileAttributes>,
    ) -> Result<(), SyncError> {
        let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let path = self
            .ctx
            .settings
            .staging_dir
            .join(format!("{uuid}-{stamp}.upload"));
        self.ctx.fs.write_file(&path, data).await?;

        if let Err(err) = self.enqueue_upload(uuid, path.clone(), attributes, true).await {
            if let Err(e) = self.ctx.fs.remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove staged data");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn enqueue_upload(
        &self,
        uuid: FileUuid,
        path: PathBuf,
        attributes: Option<FileAttributes>,
        delete_after_upload: bool,
    ) -> Result<(), SyncError> {
        let size = self.ctx.fs.file_size(&path).await.map_err(|e| {
            SyncError::ClientUsage(format!("cannot read {}: {e:#}", path.display()))
        })?;
        let blocks = TransferBlock::split(size, self.ctx.settings.block_size);

        self.ctx
            .update(|s| {
                s.store
                    .enqueue_upload(uuid, attributes.as_ref(), path, delete_after_upload, blocks)
            })
            .await??;
        debug!(size, "Upload queued");
        Ok(())
    }

    /// Queues a deletion of a synced file
    #[instrument(skip_all, fields(uuid = %uuid))]
    pub async fn delete_file(&self, uuid: FileUuid) -> Result<(), SyncError> {
        self.ctx
            .update(|s| s.store.enqueue_deletion(uuid))
            .await??;
        debug!("Deletion queued");
        Ok(())
    }

    /// Commits everything queued so far and triggers a sync
    #[instrument(skip(self))]
    pub async fn commit(&self) -> Result<TriggerOutcome, SyncError> {
        {
            let _commit = self.commit_lock.lock().await;
            let committed = self.ctx.update(|s| s.store.commit()).await?;
            if committed {
                info!("Batch committed");
            } else {
                debug!("Nothing to commit");
            }
        }
        self.trigger_sync().await
    }

    // ========================================================================
    // Sync cycle
    // ========================================================================

    /// Runs a sync cycle unless one is already running
    ///
    /// # Errors
    /// `SyncError::Storage` if engine state could not be persisted; every
    /// other failure is reported through the returned mode
    #[instrument(skip(self))]
    pub async fn trigger_sync(&self) -> Result<TriggerOutcome, SyncError> {
        let Ok(gate) = self.gate.clone().try_lock_owned() else {
            debug!("Sync already running");
            self.ctx.emit(SyncEvent::AlreadyRunning);
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        let mode = self.ctx.mode().await;
        if mode.requires_reset() {
            info!(mode = %mode, "Sync halted until reset");
            return Ok(TriggerOutcome::Halted(mode));
        }

        self.ctx.set_mode(SyncMode::Synchronizing).await?;
        if self.recovering.swap(false, Ordering::SeqCst) {
            let stage = self
                .ctx
                .read(|s| {
                    if s.store.has_download_pass() {
                        format!("download {}", s.download.stage)
                    } else {
                        format!("upload {}", describe_stage(&s.upload))
                    }
                })
                .await;
            info!(stage = %stage, "Recovering interrupted cycle");
            self.ctx.emit(SyncEvent::Recovery { stage });
        }

        match self.run_cycle(gate).await {
            Ok(outcome) => Ok(outcome),
            Err(SyncError::LockDeferred) => {
                self.ctx.set_mode(SyncMode::Idle).await?;
                self.ctx.emit(SyncEvent::LockDeferred);
                Ok(TriggerOutcome::Deferred)
            }
            Err(SyncError::Storage(err)) => {
                error!(error = %format!("{err:#}"), "Failed to persist engine state");
                let mode = SyncMode::InternalError(format!("{err:#}"));
                if let Err(e) = self.ctx.set_mode(mode).await {
                    error!(error = %e, "Failed to record internal error");
                }
                Err(SyncError::Storage(err))
            }
            Err(err) => {
                let mode = err.mode();
                warn!(error = %err, mode = %mode, "Sync cycle stopped");
                self.ctx.set_mode(mode.clone()).await?;
                Ok(TriggerOutcome::Halted(mode))
            }
        }
    }

    async fn next_work(&self) -> NextWork {
        let index_checked = self.ctx.index_checked();
        self.ctx
            .read(|s| {
                if s.store.has_download_pass() {
                    NextWork::Download
                } else if s.store.has_active_batch() {
                    NextWork::Upload
                } else if !s.server_lock_held || !index_checked {
                    NextWork::RefreshIndex
                } else if s.store.has_committed_batches() {
                    NextWork::Promote
                } else {
                    NextWork::Stop
                }
            })
            .await
    }

    /// The priority loop; `gate` is released when the cycle stops
    async fn run_cycle(&self, gate: OwnedMutexGuard<()>) -> Result<TriggerOutcome, SyncError> {
        loop {
            let next = self.next_work().await;
            debug!(?next, "Priority loop");

            match next {
                NextWork::Download => match DownloadEngine::new(&self.ctx).run().await? {
                    DownloadOutcome::Applied => {}
                    DownloadOutcome::Pending => return self.stop(gate).await,
                },
                NextWork::Upload => UploadEngine::new(&self.ctx).run().await?,
                NextWork::RefreshIndex => self.refresh_index().await?,
                NextWork::Promote => {
                    let promoted = self.ctx.update(|s| s.store.promote_next_committed()).await?;
                    debug!(promoted, "Promoted committed batch");
                }
                NextWork::Stop => {
                    let commit = self.commit_lock.lock().await;
                    if self.ctx.read(|s| s.store.has_committed_batches()).await {
                        drop(commit);
                        continue;
                    }
                    return self.finish(gate, commit).await;
                }
            }
        }
    }

    /// Ends a cycle with a download pass still waiting for the host
    async fn stop(&self, gate: OwnedMutexGuard<()>) -> Result<TriggerOutcome, SyncError> {
        let commit = self.commit_lock.lock().await;
        self.finish(gate, commit).await
    }

    /// Releases the server lock, goes idle and opens the gate
    async fn finish(
        &self,
        gate: OwnedMutexGuard<()>,
        commit: tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<TriggerOutcome, SyncError> {
        if self.ctx.read(|s| s.server_lock_held).await {
            match self.ctx.server.unlock().await {
                Ok(()) | Err(ApiError::LockNotHeld) => self.ctx.lock_released().await?,
                Err(err) => return Err(err.into()),
            }
            debug!("Server lock released");
        }
        self.ctx.set_mode(SyncMode::Idle).await?;
        drop(gate);
        drop(commit);
        info!("Sync cycle complete");
        Ok(TriggerOutcome::Completed)
    }

    /// Takes the lock if needed, fetches the index and installs the
    /// reconciled download pass
    async fn refresh_index(&self) -> Result<(), SyncError> {
        self.ctx.ensure_lock().await?;

        let backoff = self.ctx.settings.backoff;
        let server = &self.ctx.server;
        let index = match with_retry(&backoff, "get_file_index", move || server.get_file_index()).await {
            Ok(index) => index,
            Err(ApiError::LockNotHeld) => {
                // The persisted flag was stale; take the lock on the next pass
                info!("Server no longer holds our lock");
                return self.ctx.lock_released().await;
            }
            Err(err) => return Err(err.into()),
        };

        let operations = self
            .ctx
            .update(|s| -> Result<Vec<DownloadOperation>, SyncError> {
                let operations = Reconciler::reconcile(&mut s.store, &index)?;
                if !operations.is_empty() {
                    s.store.set_download_pass(operations.clone())?;
                    s.download = DownloadProgress::default();
                }
                Ok(operations)
            })
            .await??;
        self.ctx.mark_index_checked();

        if operations.is_empty() {
            debug!(entries = index.len(), "Nothing to download");
            self.ctx.emit(SyncEvent::NoFilesToDownload);
        } else {
            info!(operations = operations.len(), "Download pass installed");
        }
        Ok(())
    }

    // ========================================================================
    // Reset
    // ========================================================================

    /// Leaves an error mode
    ///
    /// A client usage error is cleared locally by dropping the active batch.
    /// Other errors ask the server to clean up first, then drop every
    /// committed batch and the pending download pass; the being-prepared
    /// batch survives.
    ///
    /// # Errors
    /// - `SyncError::ClientUsage` while a cycle runs
    /// - the cleanup failure, with the mode left unchanged
    #[instrument(skip(self))]
    pub async fn reset_from_error(&self) -> Result<(), SyncError> {
        let Ok(_gate) = self.gate.clone().try_lock_owned() else {
            return Err(SyncError::ClientUsage(
                "cannot reset while a sync is running".to_string(),
            ));
        };

        match self.ctx.mode().await {
            SyncMode::Idle | SyncMode::Synchronizing => {
                debug!("Nothing to reset");
                Ok(())
            }
            SyncMode::ClientApiError(detail) => {
                info!(detail = %detail, "Resetting client usage error");
                self.ctx
                    .update(|s| {
                        s.store.flush_active_batch();
                        s.upload = UploadProgress::default();
                    })
                    .await?;
                self.ctx.set_mode(SyncMode::Idle).await
            }
            mode => {
                info!(mode = %mode, "Resetting with server cleanup");
                let backoff = self.ctx.settings.backoff;
                let server = &self.ctx.server;
                with_retry(&backoff, "cleanup", move || server.cleanup()).await?;

                let staged: Vec<PathBuf> = self
                    .ctx
                    .update(|s| {
                        let staged = s
                            .store
                            .download_pass()
                            .iter()
                            .filter_map(|op| match op {
                                DownloadOperation::FileDownload {
                                    staged_path: Some(path),
                                    ..
                                } => Some(path.clone()),
                                _ => None,
                            })
                            .collect();
                        s.store.flush_upload_queues();
                        s.store.clear_download_pass();
                        s.clear_progress();
                        staged
                    })
                    .await?;
                self.ctx.lock_released().await?;

                for path in staged {
                    if let Err(e) = self.ctx.fs.remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove staged download");
                    }
                }
                self.ctx.set_mode(SyncMode::Idle).await
            }
        }
    }

    /// Forgets one file, or everything when `uuid` is `None`
    ///
    /// A development aid: nothing is sent to the server.
    ///
    /// # Errors
    /// `SyncError::ClientUsage` while a cycle runs
    #[instrument(skip(self))]
    pub async fn reset_metadata(&self, uuid: Option<FileUuid>) -> Result<(), SyncError> {
        let Ok(_gate) = self.gate.clone().try_lock_owned() else {
            return Err(SyncError::ClientUsage(
                "cannot reset metadata while a sync is running".to_string(),
            ));
        };

        self.ctx
            .update(|s| {
                s.store.purge(uuid);
                if uuid.is_none() {
                    s.clear_progress();
                }
            })
            .await?;
        match uuid {
            Some(uuid) => info!(uuid = %uuid, "Forgot file metadata"),
            None => info!("Forgot all file metadata"),
        }
        Ok(())
    }
}
