//! Upload and delete commands - Queue changes for the next commit
//!
//! Both commands add to the batch being prepared. With `--commit` the
//! batch is committed and a sync cycle sends it right away; otherwise it
//! waits for `lockstep commit`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use lockstep_core::domain::{FileAttributes, FileUuid, LocalFileRecord, RemoteName};
use tracing::info;

use super::{report_outcome, CliContext, EngineSession};
use crate::output::{get_formatter, OutputFormat, OutputFormatter};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// ============================================================================
// upload
// ============================================================================

#[derive(Debug, Args)]
pub struct UploadCommand {
    /// File to upload
    pub path: PathBuf,

    /// Uuid of an existing file to replace; a new uuid is generated otherwise
    #[arg(long)]
    pub uuid: Option<FileUuid>,

    /// Remote name (defaults to the file name)
    #[arg(long)]
    pub name: Option<String>,

    /// MIME type
    #[arg(long)]
    pub mime: Option<String>,

    /// Application-defined file type
    #[arg(long)]
    pub app_type: Option<String>,

    /// Remove the local file once the upload is committed
    #[arg(long)]
    pub temporary: bool,

    /// Commit and send right away
    #[arg(long)]
    pub commit: bool,
}

impl UploadCommand {
    /// Attributes to send with the upload
    ///
    /// A file already known to the engine keeps its attributes unless any
    /// of `--name`, `--mime` or `--app-type` is given.
    fn attributes(
        &self,
        path: &Path,
        existing: Option<&LocalFileRecord>,
    ) -> Result<Option<FileAttributes>> {
        let overridden = self.name.is_some() || self.mime.is_some() || self.app_type.is_some();
        if existing.is_some() && !overridden {
            return Ok(None);
        }

        let name = match (&self.name, existing.and_then(LocalFileRecord::remote_name)) {
            (Some(name), _) => name.clone(),
            (None, Some(known)) => known.as_str().to_string(),
            (None, None) => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .with_context(|| format!("Cannot derive a remote name from {}", path.display()))?,
        };
        let remote_name = RemoteName::new(name).context("Invalid remote name")?;

        let mime = self
            .mime
            .clone()
            .or_else(|| existing.and_then(|r| r.mime_type().map(str::to_string)))
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

        let mut attributes = FileAttributes::new(remote_name, mime);
        let app_type = self
            .app_type
            .clone()
            .or_else(|| existing.and_then(|r| r.app_file_type().map(str::to_string)));
        if let Some(app_type) = app_type {
            attributes = attributes.with_app_file_type(app_type);
        }
        Ok(Some(attributes))
    }

    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = ctx.config()?;

        // The engine reads the payload later, possibly from the daemon
        let path = std::fs::canonicalize(&self.path)
            .with_context(|| format!("Cannot read {}", self.path.display()))?;

        let session = EngineSession::open(&config).await?;
        let uuid = self.uuid.unwrap_or_default();
        let existing = session.engine.local_file_status(uuid).await;
        let attributes = self.attributes(&path, existing.as_ref())?;

        let queued = if self.temporary {
            session
                .engine
                .upload_temporary_file(uuid, path.clone(), attributes)
                .await
        } else {
            session
                .engine
                .upload_immutable_file(uuid, path.clone(), attributes)
                .await
        };
        if let Err(e) = queued {
            session.close().await;
            return Err(e).context("Upload was not queued");
        }
        info!(uuid = %uuid, path = %path.display(), "Upload queued");

        if !format.is_json() {
            formatter.success(&format!("Queued upload of {} as {uuid}", path.display()));
        }
        let result = finish(&session, self.commit, format, &*formatter, || {
            serde_json::json!({ "uuid": uuid.to_string(), "queued": "upload" })
        })
        .await;
        session.close().await;
        result
    }
}

// ============================================================================
// delete
// ============================================================================

#[derive(Debug, Args)]
pub struct DeleteCommand {
    /// Uuid of the file to delete
    pub uuid: FileUuid,

    /// Commit and send right away
    #[arg(long)]
    pub commit: bool,
}

impl DeleteCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = ctx.config()?;
        let session = EngineSession::open(&config).await?;

        if let Err(e) = session.engine.delete_file(self.uuid).await {
            session.close().await;
            return Err(e).context("Deletion was not queued");
        }
        info!(uuid = %self.uuid, "Deletion queued");

        if !format.is_json() {
            formatter.success(&format!("Queued deletion of {}", self.uuid));
        }
        let uuid = self.uuid;
        let result = finish(&session, self.commit, format, &*formatter, || {
            serde_json::json!({ "uuid": uuid.to_string(), "queued": "deletion" })
        })
        .await;
        session.close().await;
        result
    }
}

/// Commits when asked to, then reports
async fn finish(
    session: &EngineSession,
    commit: bool,
    format: OutputFormat,
    formatter: &dyn OutputFormatter,
    summary: impl FnOnce() -> serde_json::Value,
) -> Result<()> {
    if !commit {
        if format.is_json() {
            formatter.print_json(&summary());
        } else {
            formatter.info("Run 'lockstep commit' to send it");
        }
        return Ok(());
    }

    let outcome = session.engine.commit().await.context("Commit failed")?;
    if format.is_json() {
        let mut json = summary();
        json["committed"] = serde_json::json!(true);
        json["outcome"] = serde_json::json!(super::outcome_name(&outcome));
        formatter.print_json(&json);
    } else {
        report_outcome(&outcome, format, formatter);
    }
    Ok(())
}
