//! Advisory file locks
//!
//! Each component (database, WAL, storage engine) owns one lock file and
//! coordinates with other processes through OS advisory locks on it.
//! Exclusive locks serialize mutations, shared locks permit concurrent
//! readers. Acquisition blocks without timeout.
//!
//! On platforms where advisory locks are per-open-file-description, locks
//! taken through the same `LockFile` do not exclude each other; in-process
//! synchronization comes from Rust's ownership rules, not from these locks.

use crate::{Result, StoreError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A component's advisory lock file. The descriptor stays open for the
/// lifetime of the owning component.
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Open (creating if absent) the lock file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Acquire the lock exclusively for the scope of the returned guard.
    pub fn exclusive(&self) -> Result<LockGuard<'_>> {
        self.file
            .lock_exclusive()
            .map_err(|e| self.lock_err("exclusive", e))?;
        Ok(LockGuard { lock: self })
    }

    /// Acquire the lock shared for the scope of the returned guard.
    pub fn shared(&self) -> Result<LockGuard<'_>> {
        self.file
            .lock_shared()
            .map_err(|e| self.lock_err("shared", e))?;
        Ok(LockGuard { lock: self })
    }

    /// Acquire the exclusive lock without a guard. The caller must pair this
    /// with `release` on every exit path; used for the explicit-batch window
    /// where the lock outlives any single call.
    pub fn acquire_exclusive(&self) -> Result<()> {
        self.file
            .lock_exclusive()
            .map_err(|e| self.lock_err("exclusive", e))
    }

    /// Release a lock taken with `acquire_exclusive`.
    pub fn release(&self) -> Result<()> {
        self.file
            .unlock()
            .map_err(|e| self.lock_err("unlock", e))
    }

    fn lock_err(&self, mode: &str, err: std::io::Error) -> StoreError {
        StoreError::Lock(format!("{} lock on {}: {}", mode, self.path.display(), err))
    }
}

/// RAII guard releasing the lock on drop.
pub struct LockGuard<'a> {
    lock: &'a LockFile,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.file.unlock() {
            log::error!("failed to release lock {}: {}", self.lock.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_excludes_other_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");
        let lock = LockFile::open(&path).unwrap();

        let guard = lock.exclusive().unwrap();

        // A second descriptor cannot take the lock while the guard is held.
        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(guard);
        assert!(other.try_lock_exclusive().is_ok());
        other.unlock().unwrap();
    }

    #[test]
    fn test_shared_permits_shared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");
        let lock = LockFile::open(&path).unwrap();

        let _guard = lock.shared().unwrap();

        let other = File::open(&path).unwrap();
        assert!(other.try_lock_shared().is_ok());
        other.unlock().unwrap();
    }

    #[test]
    fn test_manual_acquire_release() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::open(dir.path().join("test.lock")).unwrap();

        lock.acquire_exclusive().unwrap();
        lock.release().unwrap();

        // Reacquirable after release.
        let _guard = lock.exclusive().unwrap();
    }
}
