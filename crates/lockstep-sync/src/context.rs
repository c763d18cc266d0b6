//! Shared state of one engine instance
//!
//! The orchestrator and both engines work on the same [`EngineContext`]:
//! the ports, the settings, and the snapshot behind a mutex. Every mutation
//! goes through [`EngineContext::update`], which persists the snapshot
//! before the lock is released.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use lockstep_core::config::Config;
use lockstep_core::domain::{EngineSnapshot, SyncMode};
use lockstep_core::ports::{ApiError, ILocalFileSystem, ISyncDelegate, ISyncServerApi, IStateStore, SyncEvent};

use crate::retry::Backoff;
use crate::SyncError;

// ============================================================================
// SyncSettings
// ============================================================================

/// Engine settings derived from [`Config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Where staged uploads and in-flight downloads live
    pub staging_dir: PathBuf,
    pub block_size: u64,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub backoff: Backoff,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            staging_dir: config.sync.staging_dir.clone(),
            block_size: config.block_size_bytes(),
            poll_interval: Duration::from_secs(config.sync.poll_interval_secs),
            max_poll_attempts: config.recovery.max_poll_attempts,
            backoff: Backoff::from_config(&config.recovery),
        }
    }
}

// ============================================================================
// EngineContext
// ============================================================================

/// Ports, settings and persisted state shared by the engines
pub struct EngineContext {
    pub server: Arc<dyn ISyncServerApi>,
    pub state_store: Arc<dyn IStateStore>,
    pub fs: Arc<dyn ILocalFileSystem>,
    pub delegate: Arc<dyn ISyncDelegate>,
    pub settings: SyncSettings,
    state: Mutex<EngineSnapshot>,
    /// Whether the index was fetched since the lock was taken; not persisted
    index_checked: AtomicBool,
}

impl EngineContext {
    pub fn new(
        server: Arc<dyn ISyncServerApi>,
        state_store: Arc<dyn IStateStore>,
        fs: Arc<dyn ILocalFileSystem>,
        delegate: Arc<dyn ISyncDelegate>,
        settings: SyncSettings,
        snapshot: EngineSnapshot,
    ) -> Self {
        Self {
            server,
            state_store,
            fs,
            delegate,
            settings,
            state: Mutex::new(snapshot),
            index_checked: AtomicBool::new(false),
        }
    }

    /// Reads from the snapshot without persisting
    pub async fn read<R>(&self, f: impl FnOnce(&EngineSnapshot) -> R) -> R {
        let state = self.state.lock().await;
        f(&*state)
    }

    /// Mutates the snapshot and persists it
    ///
    /// # Errors
    /// `SyncError::Storage` if the snapshot could not be saved; the
    /// in-memory mutation is kept
    pub async fn update<R>(&self, f: impl FnOnce(&mut EngineSnapshot) -> R) -> Result<R, SyncError> {
        let mut state = self.state.lock().await;
        let result = f(&mut *state);
        state.saved_at = chrono::Utc::now();
        self.state_store.save(&*state).await?;
        Ok(result)
    }

    pub fn emit(&self, event: SyncEvent) {
        debug!(%event, "Sync event");
        self.delegate.on_event(event);
    }

    pub async fn mode(&self) -> SyncMode {
        self.read(|s| s.mode.clone()).await
    }

    /// Persists `mode` and emits `ModeChanged` if it differs
    pub async fn set_mode(&self, mode: SyncMode) -> Result<(), SyncError> {
        let changed = self
            .update(|s| {
                if s.mode == mode {
                    false
                } else {
                    s.mode = mode.clone();
                    true
                }
            })
            .await?;
        if changed {
            info!(mode = %mode, "Sync mode changed");
            self.emit(SyncEvent::ModeChanged { mode });
        }
        Ok(())
    }

    pub fn index_checked(&self) -> bool {
        self.index_checked.load(Ordering::SeqCst)
    }

    pub fn mark_index_checked(&self) {
        self.index_checked.store(true, Ordering::SeqCst);
    }

    /// Records that this device no longer holds the server lock
    pub async fn lock_released(&self) -> Result<(), SyncError> {
        self.index_checked.store(false, Ordering::SeqCst);
        self.update(|s| s.server_lock_held = false).await
    }

    /// Takes the server lock unless the snapshot says it is held
    ///
    /// # Errors
    /// - `SyncError::LockDeferred` if another device holds it
    /// - the mapped [`ApiError`] for any other failure
    pub async fn ensure_lock(&self) -> Result<(), SyncError> {
        if self.read(|s| s.server_lock_held).await {
            return Ok(());
        }
        match self.server.lock().await {
            Ok(()) => {
                debug!("Server lock acquired");
                self.index_checked.store(false, Ordering::SeqCst);
                self.update(|s| s.server_lock_held = true).await
            }
            Err(ApiError::LockAlreadyHeld) => {
                info!("Server lock held by another device");
                Err(SyncError::LockDeferred)
            }
            Err(err) => Err(err.into()),
        }
    }
}
