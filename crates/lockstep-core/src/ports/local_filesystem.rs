//! Local filesystem port (driven/secondary port)
//!
//! This module defines the file I/O the engines need: block reads of
//! upload payloads, block writes of downloads, and whole-file staging.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because filesystem errors are adapter-specific.
//! - `write_file` must not leave a partially written file behind.

use std::path::Path;

/// Port trait for local filesystem operations
#[async_trait::async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Returns the size of a file in bytes
    async fn file_size(&self, path: &Path) -> anyhow::Result<u64>;

    /// Reads `length` bytes starting at `offset`
    ///
    /// # Errors
    /// Fails if the file is shorter than `offset + length`
    async fn read_block(&self, path: &Path, offset: u64, length: u64) -> anyhow::Result<Vec<u8>>;

    /// Writes `data` at `offset`, creating the file and parent directories
    /// if needed
    async fn write_block(&self, path: &Path, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Atomically replaces the whole content of `path`
    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<()>;

    /// Removes a file; a missing file is not an error
    async fn remove_file(&self, path: &Path) -> anyhow::Result<()>;
}
