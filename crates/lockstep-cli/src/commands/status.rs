//! Status command - Display engine status
//!
//! Provides the `lockstep status` CLI command which:
//! 1. Shows the engine mode and whether a daemon owns the database
//! 2. Shows record counts by sync state
//! 3. Shows queued and in-flight upload and download work

use std::collections::BTreeMap;

use anyhow::Result;
use clap::Args;
use lockstep_cache::InstanceLock;
use lockstep_core::domain::{EngineSnapshot, UploadBatch};
use tracing::info;

use super::{read_snapshot, CliContext};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusCommand {}

/// Queue sizes shown by `status`
#[derive(Debug, PartialEq, Eq)]
struct QueueSummary {
    being_prepared: usize,
    committed_batches: usize,
    active_batch: Option<usize>,
    download_pass: usize,
}

impl QueueSummary {
    fn of(snapshot: &EngineSnapshot) -> Self {
        let store = &snapshot.store;
        Self {
            being_prepared: file_operations(store.being_prepared()),
            committed_batches: store.committed_batch_count(),
            active_batch: store.active_batch().map(file_operations),
            download_pass: store.download_pass().len(),
        }
    }
}

/// Uploads and deletions in `batch`, leaving out the commit marker
fn file_operations(batch: &UploadBatch) -> usize {
    batch.uploads().count() + batch.deletions().count()
}

fn records_by_state(snapshot: &EngineSnapshot) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in snapshot.store.records() {
        *counts.entry(record.sync_state().to_string()).or_insert(0) += 1;
    }
    counts
}

impl StatusCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = ctx.config()?;
        let daemon_pid = InstanceLock::owner(&config.storage.database);

        let Some(snapshot) = read_snapshot(&config).await? else {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "initialized": false,
                    "database": config.storage.database.display().to_string(),
                }));
            } else {
                formatter.warn("No engine state yet. Run 'lockstep sync' or start lockstepd.");
            }
            return Ok(());
        };

        info!(mode = %snapshot.mode, "Showing engine status");

        let queues = QueueSummary::of(&snapshot);
        let counts = records_by_state(&snapshot);
        let total: usize = counts.values().sum();

        if format.is_json() {
            let json = serde_json::json!({
                "initialized": true,
                "mode": snapshot.mode.name(),
                "detail": snapshot.mode.detail(),
                "requires_reset": snapshot.mode.requires_reset(),
                "server_lock_held": snapshot.server_lock_held,
                "daemon_pid": daemon_pid,
                "total_files": total,
                "files_by_state": counts,
                "upload": {
                    "stage": snapshot.upload.stage.name(),
                    "operation_id": snapshot.upload.operation_id.as_ref().map(|id| id.to_string()),
                    "operations_being_prepared": queues.being_prepared,
                    "committed_batches": queues.committed_batches,
                    "active_batch_operations": queues.active_batch,
                },
                "download": {
                    "stage": snapshot.download.stage.to_string(),
                    "pass_operations": queues.download_pass,
                    "error_count": snapshot.download.error_count,
                },
                "saved_at": snapshot.saved_at.to_rfc3339(),
            });
            formatter.print_json(&json);
            return Ok(());
        }

        if snapshot.mode.is_error() {
            formatter.error(&format!("Engine mode: {}", snapshot.mode));
            if snapshot.mode.requires_reset() {
                formatter.info("Fix the cause, then run 'lockstep reset'");
            }
        } else {
            formatter.success(&format!("Engine mode: {}", snapshot.mode));
        }

        match daemon_pid {
            Some(pid) => formatter.info(&format!("Daemon:            running (pid {pid})")),
            None => formatter.info("Daemon:            not running"),
        }
        if snapshot.server_lock_held {
            formatter.info("Server lock:       held");
        }
        formatter.info(&format!(
            "Last saved:        {}",
            snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        formatter.info("");
        formatter.info(&format!("Files: {total}"));
        for (state, count) in &counts {
            formatter.info(&format!("  {state:<26} {count}"));
        }

        formatter.info("");
        formatter.info("Uploads:");
        formatter.info(&format!("  stage                      {}", snapshot.upload.stage));
        formatter.info(&format!("  uncommitted operations     {}", queues.being_prepared));
        formatter.info(&format!("  committed batches          {}", queues.committed_batches));
        if let Some(ops) = queues.active_batch {
            formatter.info(&format!("  active batch operations    {ops}"));
        }

        formatter.info("");
        formatter.info("Downloads:");
        formatter.info(&format!("  stage                      {}", snapshot.download.stage));
        formatter.info(&format!("  pass operations            {}", queues.download_pass));

        Ok(())
    }
}
