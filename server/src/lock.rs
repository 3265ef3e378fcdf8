//! Advisory cross-process file locks.
//!
//! Repo mirrors and pack cache entries are shared between worker processes;
//! every mutation is serialized through an OS advisory lock on a well-known
//! path. Acquisition blocks in `flock`, so the async variant runs it on the
//! blocking pool to keep the scheduler responsive.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Acquire without leaving the current thread. For blocking-pool
    /// contexts such as the cache cleaner.
    pub fn acquire_blocking(path: impl Into<PathBuf>, mode: LockMode) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match mode {
            LockMode::Shared => file.lock_shared()?,
            LockMode::Exclusive => file.lock()?,
        }
        Ok(FileLock { file, path, mode })
    }

    /// Acquire from async context; the wait happens on the blocking pool.
    pub async fn acquire(path: impl Into<PathBuf>, mode: LockMode) -> io::Result<Self> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path, mode))
            .await
            .map_err(io::Error::other)?
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn mtime(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the lock file's mtime to now.
    pub fn touch(&self) -> io::Result<()> {
        self.file.set_modified(SystemTime::now())
    }

    /// Unlink the locked file. Only meaningful while holding the exclusive
    /// lock; open shared descriptors elsewhere keep reading the unlinked
    /// inode until they close.
    pub fn delete(self) -> io::Result<()> {
        if self.mode != LockMode::Exclusive {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delete requires the exclusive lock",
            ));
        }
        std::fs::remove_file(&self.path)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.lock");
        let _a = FileLock::acquire(&path, LockMode::Shared).await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            FileLock::acquire(&path, LockMode::Shared),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn exclusive_excludes_shared_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.lock");
        let exclusive = FileLock::acquire(&path, LockMode::Exclusive).await.unwrap();

        let waiter = tokio::spawn({
            let path = path.clone();
            async move { FileLock::acquire(&path, LockMode::Shared).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(exclusive);
        let acquired = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn delete_requires_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        let shared = FileLock::acquire(&path, LockMode::Shared).await.unwrap();
        assert!(shared.delete().is_err());
        assert!(path.exists());

        let exclusive = FileLock::acquire(&path, LockMode::Exclusive).await.unwrap();
        exclusive.delete().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn touch_advances_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.lock");
        let lock = FileLock::acquire(&path, LockMode::Exclusive).await.unwrap();
        lock.file
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        let before = FileLock::mtime(&path).unwrap();
        lock.touch().unwrap();
        assert!(FileLock::mtime(&path).unwrap() > before);
    }
}
