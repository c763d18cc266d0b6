//! File command - Show the local record of one file

use anyhow::Result;
use clap::Args;
use lockstep_core::domain::{EngineSnapshot, FileUuid};

use super::{read_snapshot, CliContext};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct FileCommand {
    /// File uuid
    pub uuid: FileUuid,
}

/// Record fields plus the work queued for the file
fn describe(snapshot: &EngineSnapshot, uuid: FileUuid) -> Option<serde_json::Value> {
    let record = snapshot.store.record(uuid)?;
    Some(serde_json::json!({
        "uuid": uuid.to_string(),
        "remote_name": record.remote_name().map(|n| n.as_str().to_string()),
        "mime_type": record.mime_type(),
        "app_file_type": record.app_file_type(),
        "local_version": record.local_version(),
        "sync_state": record.sync_state().to_string(),
        "deleted_on_server": record.deleted_on_server(),
        "pending_upload": snapshot.store.has_pending_upload(uuid),
        "pending_deletion": snapshot.store.has_pending_deletion(uuid),
        "updated_at": record.updated_at().to_rfc3339(),
    }))
}

impl FileCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = ctx.config()?;

        let details = read_snapshot(&config)
            .await?
            .and_then(|snapshot| describe(&snapshot, self.uuid));

        let Some(details) = details else {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "uuid": self.uuid.to_string(),
                    "known": false,
                }));
            } else {
                formatter.warn(&format!("No local record for {}", self.uuid));
            }
            return Ok(());
        };

        if format.is_json() {
            formatter.print_json(&details);
            return Ok(());
        }

        formatter.success(&format!("File {}", self.uuid));
        if let Some(map) = details.as_object() {
            for (key, value) in map.iter().filter(|(k, _)| k.as_str() != "uuid") {
                let shown = match value {
                    serde_json::Value::Null => "-".to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                formatter.info(&format!("{key:<18} {shown}"));
            }
        }
        Ok(())
    }
}
