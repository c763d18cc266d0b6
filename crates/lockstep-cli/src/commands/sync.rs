//! Sync and commit commands - Run a sync cycle in the foreground
//!
//! Provides the `lockstep sync` and `lockstep commit` CLI commands. Both
//! take ownership of the engine database for the duration of one cycle,
//! so they refuse to run while lockstepd is running.

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::{report_outcome, CliContext, EngineSession};
use crate::output::{get_formatter, OutputFormat};

/// Run one sync cycle: resume interrupted work, download, send committed batches
#[derive(Debug, Args)]
pub struct SyncCommand {}

impl SyncCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = ctx.config()?;
        let session = EngineSession::open(&config).await?;

        info!(server = %config.server.url, "Running sync cycle");
        let outcome = session.engine.trigger_sync().await;
        session.close().await;

        let outcome = outcome.context("Sync cycle failed")?;
        report_outcome(&outcome, format, &*formatter);
        Ok(())
    }
}

/// Commit the operations queued so far and send them
#[derive(Debug, Args)]
pub struct CommitCommand {}

impl CommitCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = ctx.config()?;
        let session = EngineSession::open(&config).await?;

        let pending = session
            .engine
            .snapshot()
            .await
            .store
            .being_prepared()
            .operations()
            .len();
        if pending == 0 && !format.is_json() {
            formatter.info("Nothing queued; running a sync cycle");
        }

        let outcome = session.engine.commit().await;
        session.close().await;

        let outcome = outcome.context("Commit failed")?;
        report_outcome(&outcome, format, &*formatter);
        Ok(())
    }
}
