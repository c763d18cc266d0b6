//! CLI subcommands and the plumbing they share
//!
//! Commands that change engine state open an [`EngineSession`], which takes
//! the database's instance lock; they fail while `lockstepd` is running.
//! Read-only commands load the persisted snapshot directly.

pub mod completions;
pub mod config;
pub mod file;
pub mod reset;
pub mod status;
pub mod sync;
pub mod transfer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lockstep_cache::{CacheError, DatabasePool, InstanceLock, SqliteStateStore};
use lockstep_conflict::ResolutionPolicy;
use lockstep_core::config::Config;
use lockstep_core::domain::EngineSnapshot;
use lockstep_core::ports::IStateStore;
use lockstep_remote::{HttpSyncServer, SyncServerClient};
use lockstep_sync::{
    DirectoryDelegate, LocalFileSystemAdapter, SyncOrchestrator, SyncSettings, TriggerOutcome,
};
use tracing::debug;

use crate::output::{OutputFormat, OutputFormatter};

/// Overrides the configuration file location when `--config` is absent
const CONFIG_ENV: &str = "LOCKSTEP_CONFIG";

// ============================================================================
// CliContext
// ============================================================================

/// Where the configuration lives; loaded on demand
#[derive(Debug)]
pub struct CliContext {
    pub config_path: PathBuf,
}

impl CliContext {
    /// `--config`, then `$LOCKSTEP_CONFIG`, then the default path
    pub fn new(config_override: Option<PathBuf>) -> Self {
        let config_path = config_override
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(Config::default_path);
        Self { config_path }
    }

    /// Loads the configuration; a missing file yields defaults
    pub fn config(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }
        Config::load(&self.config_path)
            .with_context(|| format!("Failed to load {}", self.config_path.display()))
    }
}

// ============================================================================
// Engine access
// ============================================================================

/// An engine opened for writing
pub struct EngineSession {
    pub engine: SyncOrchestrator,
    _instance: InstanceLock,
    pool: DatabasePool,
}

impl EngineSession {
    /// Takes ownership of the database and restores the engine
    pub async fn open(config: &Config) -> Result<Self> {
        let errors = config.validate();
        if let Some(first) = errors.first() {
            bail!(
                "Invalid configuration: {} ({} error(s), see 'lockstep config validate')",
                first,
                errors.len()
            );
        }

        let db_path = &config.storage.database;
        let instance = match InstanceLock::acquire(db_path) {
            Ok(lock) => lock,
            Err(CacheError::Locked(pid)) => {
                bail!("Engine database is in use by process {pid}; is lockstepd running?")
            }
            Err(e) => return Err(e).context("Failed to lock engine database"),
        };

        let pool = DatabasePool::new(db_path)
            .await
            .context("Failed to open database")?;
        let state_store = Arc::new(SqliteStateStore::new(pool.pool().clone()));

        let device_id = config
            .resolve_device_id()
            .context("Failed to resolve device id")?;
        let client = SyncServerClient::new(&config.server, device_id.as_str())
            .context("Failed to create sync server client")?;
        let delegate = Arc::new(DirectoryDelegate::new(
            config.sync.deliver_dir.clone(),
            ResolutionPolicy::from_config(&config.conflicts),
        ));

        let engine = SyncOrchestrator::load(
            Arc::new(HttpSyncServer::new(client)),
            state_store,
            Arc::new(LocalFileSystemAdapter::new()),
            delegate,
            SyncSettings::from_config(config),
        )
        .await
        .context("Failed to load engine state")?;
        debug!(database = %db_path.display(), "Engine session opened");

        Ok(Self {
            engine,
            _instance: instance,
            pool,
        })
    }

    /// Closes the database; the instance lock is released on drop
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Last persisted engine state, without taking the instance lock
///
/// Returns `None` when no engine has run against the database yet.
pub async fn read_snapshot(config: &Config) -> Result<Option<EngineSnapshot>> {
    let db_path = &config.storage.database;
    if !db_path.exists() {
        return Ok(None);
    }

    let pool = DatabasePool::new(db_path)
        .await
        .context("Failed to open database")?;
    let snapshot = SqliteStateStore::new(pool.pool().clone())
        .load()
        .await
        .context("Failed to read engine state");
    pool.close().await;
    snapshot
}

// ============================================================================
// Outcome reporting
// ============================================================================

/// Stable name of a trigger outcome for JSON output
pub fn outcome_name(outcome: &TriggerOutcome) -> &'static str {
    match outcome {
        TriggerOutcome::Completed => "completed",
        TriggerOutcome::AlreadyRunning => "already_running",
        TriggerOutcome::Deferred => "deferred",
        TriggerOutcome::Halted(_) => "halted",
    }
}

/// Prints how a sync cycle ended
pub fn report_outcome(
    outcome: &TriggerOutcome,
    format: OutputFormat,
    formatter: &dyn OutputFormatter,
) {
    if format.is_json() {
        let mut json = serde_json::json!({ "outcome": outcome_name(outcome) });
        if let TriggerOutcome::Halted(mode) = outcome {
            json["mode"] = serde_json::json!(mode.name());
            json["detail"] = serde_json::json!(mode.detail());
            json["requires_reset"] = serde_json::json!(mode.requires_reset());
        }
        formatter.print_json(&json);
        return;
    }

    match outcome {
        TriggerOutcome::Completed => formatter.success("Sync cycle completed"),
        TriggerOutcome::AlreadyRunning => formatter.warn("A sync cycle is already running"),
        TriggerOutcome::Deferred => {
            formatter.warn("Server is locked by another device; queued work stays committed")
        }
        TriggerOutcome::Halted(mode) if mode.requires_reset() => {
            formatter.error(&format!("Sync halted in {mode}"));
            formatter.info("Fix the cause, then run 'lockstep reset'");
        }
        TriggerOutcome::Halted(mode) => {
            formatter.warn(&format!("Sync paused in {mode}; the next sync resumes"))
        }
    }
}
