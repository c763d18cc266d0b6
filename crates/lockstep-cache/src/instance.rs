//! Single-writer guard for a state database
//!
//! Only one process may run sync cycles against a database at a time. The
//! owner holds an exclusive advisory lock on `<database>.lock` and writes
//! its process id into the file. The operating system drops the lock when
//! the owner exits, so a file left behind by a crash never blocks.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::CacheError;

/// Held for as long as the process writes to the database
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Lock file guarding `db_path`
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Takes the lock for `db_path` without waiting
    ///
    /// # Errors
    ///
    /// `CacheError::Locked` with the owner's pid if another process holds
    /// it, `CacheError::ConnectionFailed` on I/O errors.
    pub fn acquire(db_path: &Path) -> Result<Self, CacheError> {
        let path = Self::path_for(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&path, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            let owner = read_pid(&mut file).unwrap_or_default();
            return Err(CacheError::Locked(owner));
        }

        file.set_len(0).map_err(|e| io_error(&path, e))?;
        write!(file, "{}", std::process::id()).map_err(|e| io_error(&path, e))?;
        file.sync_all().map_err(|e| io_error(&path, e))?;

        debug!(path = %path.display(), "Instance lock acquired");
        Ok(Self { path, file })
    }

    /// Pid of the process holding the lock for `db_path`, if any
    pub fn owner(db_path: &Path) -> Option<u32> {
        let mut file = File::open(Self::path_for(db_path)).ok()?;
        if file.try_lock_shared().is_ok() {
            // Nobody holds it exclusively
            let _ = file.unlock();
            return None;
        }
        read_pid(&mut file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "Failed to release instance lock");
        }
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

fn io_error(path: &Path, e: std::io::Error) -> CacheError {
    CacheError::ConnectionFailed(format!("instance lock {}: {}", path.display(), e))
}
