//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`ILocalFileSystem`] using `tokio::fs` for async file operations.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: whole-file writes go to a temporary sibling and are
//!   renamed over the target, so a crash never leaves a partial file.
//! - **Block I/O**: uploads read and downloads write one transfer block at a
//!   time through a seeked handle; payloads are never loaded whole.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use lockstep_core::ports::ILocalFileSystem;

// ============================================================================
// LocalFileSystemAdapter struct
// ============================================================================

/// Adapter that bridges the [`ILocalFileSystem`] port to the real filesystem.
///
/// This is a zero-sized struct: every operation takes absolute paths, and
/// the staging directory is chosen by the engines.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystemAdapter;

impl LocalFileSystemAdapter {
    /// Create a new `LocalFileSystemAdapter`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Sibling path used while a whole-file write is in flight
fn temporary_sibling(target: &Path) -> PathBuf {
    let mut p = target.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

async fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

// ============================================================================
// ILocalFileSystem implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystemAdapter {
    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn file_size(&self, path: &Path) -> anyhow::Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        Ok(metadata.len())
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn read_block(&self, path: &Path, offset: u64, length: u64) -> anyhow::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let len = usize::try_from(length).context("block length does not fit in memory")?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await.with_context(|| {
            format!(
                "reading {} bytes at offset {} of {}",
                length,
                offset,
                path.display()
            )
        })?;

        debug!(bytes = buffer.len(), "block read");
        Ok(buffer)
    }

    #[instrument(skip(self, path, data), fields(path = %path.display(), bytes = data.len()))]
    async fn write_block(&self, path: &Path, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        ensure_parent(path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await
            .with_context(|| format!("opening {} for writing", path.display()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!("block written");
        Ok(())
    }

    #[instrument(skip(self, path, data), fields(path = %path.display(), bytes = data.len()))]
    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<()> {
        ensure_parent(path).await?;

        // Same directory, so the rename stays on one filesystem
        let tmp_path = temporary_sibling(path);
        debug!(?tmp_path, "writing to temporary file");
        tokio::fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;

        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;

        debug!("write complete");
        Ok(())
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("file already absent");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("removing {}", path.display()))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
