//! Delegate that places delivered files into a directory
//!
//! Used by the daemon and the CLI. Downloads are moved to
//! `deliver_dir/<remote name>`, deletions remove that file, and conflicts
//! are answered from the configured [`ResolutionPolicy`]. A pass with a
//! conflict the policy leaves to a person is refused as a whole, so it is
//! delivered again once the policy changes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use lockstep_conflict::{PolicyDecision, ResolutionPolicy};
use lockstep_core::domain::{DownloadDelivery, RemoteName};
use lockstep_core::ports::{ISyncDelegate, SyncEvent};

pub struct DirectoryDelegate {
    deliver_dir: PathBuf,
    policy: ResolutionPolicy,
}

impl DirectoryDelegate {
    pub fn new(deliver_dir: PathBuf, policy: ResolutionPolicy) -> Self {
        Self {
            deliver_dir,
            policy,
        }
    }

    pub fn deliver_dir(&self) -> &Path {
        &self.deliver_dir
    }

    /// Where a file named `name` is delivered
    pub fn target_path(&self, name: &RemoteName) -> anyhow::Result<PathBuf> {
        match name.as_str() {
            "." | ".." => bail!("cannot deliver a file named '{name}'"),
            other => Ok(self.deliver_dir.join(other)),
        }
    }
}

/// Renames `from` to `to`, copying when a rename is not possible
/// (for example across filesystems)
async fn move_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    if let Err(e) = tokio::fs::rename(from, to).await {
        debug!(error = %e, from = %from.display(), "Rename failed, copying instead");
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
        tokio::fs::remove_file(from)
            .await
            .with_context(|| format!("removing {}", from.display()))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl ISyncDelegate for DirectoryDelegate {
    fn on_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::SingleUploadComplete { .. } | SyncEvent::SingleDownloadComplete { .. } => {
                debug!(event = %event, "Sync event")
            }
            SyncEvent::LockDeferred | SyncEvent::Recovery { .. } => warn!(event = %event, "Sync event"),
            _ => info!(event = %event, "Sync event"),
        }
    }

    async fn deliver(&self, delivery: DownloadDelivery) -> anyhow::Result<()> {
        let mut decisions = Vec::with_capacity(delivery.conflicts.len());
        for conflict in &delivery.conflicts {
            match self.policy.decide(conflict) {
                PolicyDecision::Resolve(resolution) => decisions.push(resolution),
                PolicyDecision::Manual => {
                    warn!(
                        uuid = %conflict.uuid(),
                        conflict = %conflict.conflict_type(),
                        "Conflict needs manual resolution"
                    );
                    bail!(
                        "conflict on {} needs manual resolution; set conflicts.default_resolution or add a rule",
                        conflict.uuid()
                    );
                }
            }
        }

        // Validate every target before anything is moved
        let targets = delivery
            .downloads
            .iter()
            .map(|file| self.target_path(&file.remote_name))
            .collect::<anyhow::Result<Vec<_>>>()?;

        tokio::fs::create_dir_all(&self.deliver_dir)
            .await
            .with_context(|| format!("creating {}", self.deliver_dir.display()))?;

        for (conflict, resolution) in delivery.conflicts.iter().zip(decisions) {
            conflict.resolve_conflict(resolution)?;
            info!(uuid = %conflict.uuid(), resolution = %resolution, "Conflict resolved by policy");
        }

        for (file, target) in delivery.downloads.into_iter().zip(targets) {
            move_file(&file.path, &target).await?;
            debug!(uuid = %file.uuid, version = file.version, target = %target.display(), "File delivered");
            file.ack.acknowledge();
        }

        for deletion in delivery.deletions {
            if let Some(name) = &deletion.remote_name {
                let target = self.target_path(name)?;
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => debug!(uuid = %deletion.uuid, target = %target.display(), "File removed"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("removing {}", target.display()))
                    }
                }
            }
            deletion.ack.acknowledge();
        }

        Ok(())
    }
}
