//! Lockstep Daemon - Background synchronization service
//!
//! This binary runs as a user service and handles:
//! - Periodic sync triggers against the configured server
//! - Delivery of downloaded files into the configured directory
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon owns the engine database (see [`InstanceLock`]) and enters a
//! loop that triggers a sync cycle every `sync.trigger_interval_secs`. The
//! loop is controlled by a `CancellationToken` that is triggered on receipt
//! of SIGTERM or SIGINT. A cycle cut short by shutdown resumes from its
//! persisted stage on the next start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lockstep_cache::{DatabasePool, InstanceLock, SqliteStateStore};
use lockstep_conflict::ResolutionPolicy;
use lockstep_core::config::{Config, LoggingConfig};
use lockstep_remote::{HttpSyncServer, SyncServerClient};
use lockstep_sync::{
    DirectoryDelegate, LocalFileSystemAdapter, SyncOrchestrator, SyncSettings, TriggerOutcome,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Overrides the configuration file location
const CONFIG_ENV: &str = "LOCKSTEP_CONFIG";

// ============================================================================
// DaemonService
// ============================================================================

/// Main daemon service: one engine and the loop that drives it
struct DaemonService {
    config: Config,
    engine: SyncOrchestrator,
    /// Keeps other writers away from the database
    _instance: InstanceLock,
    pool: DatabasePool,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens the database and restores the engine
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                error!(field = %e.field, "{}", e.message);
            }
            bail!("Invalid configuration ({} error(s))", errors.len());
        }

        let db_path = &config.storage.database;
        let instance = InstanceLock::acquire(db_path).with_context(|| {
            format!("Cannot take ownership of {}", db_path.display())
        })?;
        let pool = DatabasePool::new(db_path)
            .await
            .context("Failed to open database")?;
        let state_store = Arc::new(SqliteStateStore::new(pool.pool().clone()));

        let device_id = config
            .resolve_device_id()
            .context("Failed to resolve device id")?;
        let client = SyncServerClient::new(&config.server, device_id.as_str())
            .context("Failed to create sync server client")?;
        info!(server = %client.base_url(), device_id = %device_id, "Sync server configured");

        let delegate = Arc::new(DirectoryDelegate::new(
            config.sync.deliver_dir.clone(),
            ResolutionPolicy::from_config(&config.conflicts),
        ));

        let engine = SyncOrchestrator::load(
            Arc::new(HttpSyncServer::new(client)),
            state_store,
            Arc::new(LocalFileSystemAdapter::new()),
            delegate,
            SyncSettings::from_config(&config),
        )
        .await
        .context("Failed to load engine state")?;

        Ok(Self {
            config,
            engine,
            _instance: instance,
            pool,
            shutdown,
        })
    }

    // ========================================================================
    // Periodic sync
    // ========================================================================

    /// Triggers a cycle every `sync.trigger_interval_secs` until shutdown
    async fn run(&self) -> Result<()> {
        let interval_secs = self.config.sync.trigger_interval_secs;
        info!(
            trigger_interval_secs = interval_secs,
            deliver_dir = %self.config.sync.deliver_dir.display(),
            mode = %self.engine.mode().await,
            "Starting sync loop"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            tokio::select! {
                _ = self.run_cycle() => {}
                _ = self.shutdown.cancelled() => {
                    warn!("Shutdown during sync cycle; it resumes on next start");
                    break;
                }
            }
        }

        self.pool.close().await;
        info!("Sync loop terminated");
        Ok(())
    }

    async fn run_cycle(&self) {
        match self.engine.trigger_sync().await {
            Ok(outcome) => match describe_outcome(&outcome) {
                (true, message) => info!(outcome = ?outcome, "{message}"),
                (false, message) => error!(outcome = ?outcome, "{message}"),
            },
            Err(e) => error!(error = %format!("{e:#}"), "Sync cycle failed"),
        }
    }
}

/// Whether `outcome` is healthy, and a log line for it
fn describe_outcome(outcome: &TriggerOutcome) -> (bool, String) {
    match outcome {
        TriggerOutcome::Completed => (true, "Sync cycle completed".to_string()),
        TriggerOutcome::AlreadyRunning => (true, "Sync cycle already running".to_string()),
        TriggerOutcome::Deferred => (
            true,
            "Server locked by another device; retrying next interval".to_string(),
        ),
        TriggerOutcome::Halted(mode) if mode.requires_reset() => (
            false,
            format!("Sync halted in {mode}; run 'lockstep reset' after fixing the cause"),
        ),
        TriggerOutcome::Halted(mode) => (true, format!("Sync paused in {mode}; retrying next interval")),
    }
}

// ============================================================================
// Startup
// ============================================================================

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

/// Loads `path`, or defaults when it does not exist
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Initializes tracing from the `logging` section; `RUST_LOG` wins
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = load_config(&path)?;
    init_tracing(&config.logging);

    info!(config_path = %path.display(), "Lockstep daemon starting (lockstepd)");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("Lockstep daemon shut down gracefully"),
        Err(e) => error!(error = %e, "Lockstep daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
