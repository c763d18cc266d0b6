//! Reset command - Leave an error mode or forget local metadata
//!
//! Provides the `lockstep reset` CLI command which:
//! 1. Without flags, runs the engine's error reset: server cleanup where
//!    the mode calls for it, then flushing of unsent batches
//! 2. With `--metadata`, forgets the local records (all, or one with
//!    `--uuid`) so the files are downloaded again on the next sync

use anyhow::{bail, Context, Result};
use clap::Args;
use lockstep_core::domain::FileUuid;
use tracing::info;

use super::{CliContext, EngineSession};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct ResetCommand {
    /// Forget local file records instead of resetting an error
    #[arg(long)]
    pub metadata: bool,

    /// Only forget this file (requires --metadata)
    #[arg(long, requires = "metadata")]
    pub uuid: Option<FileUuid>,

    /// Confirm forgetting every record
    #[arg(long)]
    pub yes: bool,
}

impl ResetCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        if self.metadata && self.uuid.is_none() && !self.yes {
            bail!("Forgetting every file record needs --yes");
        }

        let config = ctx.config()?;
        let session = EngineSession::open(&config).await?;
        let mode_before = session.engine.mode().await;

        let result = if self.metadata {
            session.engine.reset_metadata(self.uuid).await
        } else {
            session.engine.reset_from_error().await
        };
        let mode_after = session.engine.mode().await;
        session.close().await;

        let action = if self.metadata { "Metadata reset" } else { "Reset" };
        result.with_context(|| format!("{action} failed"))?;
        info!(before = %mode_before, after = %mode_after, metadata = self.metadata, "Engine reset");

        if format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": true,
                "metadata": self.metadata,
                "uuid": self.uuid.map(|u| u.to_string()),
                "mode_before": mode_before.name(),
                "mode": mode_after.name(),
            }));
            return Ok(());
        }

        match (self.metadata, self.uuid) {
            (true, Some(uuid)) => formatter.success(&format!("Forgot local record of {uuid}")),
            (true, None) => formatter.success("Forgot all local file records"),
            (false, _) if mode_before == mode_after => {
                formatter.success(&format!("Nothing to reset; engine is {mode_after}"))
            }
            (false, _) => formatter.success(&format!("Engine reset from {mode_before} to {mode_after}")),
        }
        Ok(())
    }
}
