//! Per-chain cross-process locks.
//!
//! Each key maps to a lock file under the store's `locks/` directory held
//! with an exclusive `flock`. The lock is tied to the open file description,
//! so it contends between processes and between independent openers inside
//! one process alike, and the kernel drops it if the holder dies.

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::path::PathBuf;

use async_trait::async_trait;
use kiln_common::{KilnError, KilnResult};
use rustix::fs::{FlockOperation, flock};

/// Hands out exclusive locks by key.
#[async_trait]
pub trait Locksmith: Send + Sync {
    /// Block until the lock for `key` is held.
    async fn lock(&self, key: &str) -> KilnResult<LockGuard>;

    /// Take the lock for `key` if nobody holds it.
    fn try_lock(&self, key: &str) -> KilnResult<Option<LockGuard>>;
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    file: Option<File>,
}

impl LockGuard {
    /// Guard that holds nothing, for locksmiths without a backing file.
    #[must_use]
    pub fn detached(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            file: None,
        }
    }

    /// Key this guard was taken for.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock now.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock call fails. The lock is still dropped
    /// with the file.
    pub fn unlock(mut self) -> KilnResult<()> {
        if let Some(file) = self.file.take() {
            flock(file.as_fd(), FlockOperation::Unlock).map_err(|e| KilnError::Lock {
                key: self.key.clone(),
                message: e.to_string(),
            })?;
        }
        tracing::trace!(key = %self.key, "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = flock(file.as_fd(), FlockOperation::Unlock);
            tracing::trace!(key = %self.key, "Lock released on drop");
        }
    }
}

/// Lock files in a directory.
#[derive(Debug, Clone)]
pub struct FileLocksmith {
    dir: PathBuf,
}

impl FileLocksmith {
    /// Create a locksmith keeping its lock files in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> KilnResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn open(&self, key: &str) -> KilnResult<File> {
        validate_key(key)?;
        let path = self.dir.join(format!("{key}.lock"));
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }
}

#[async_trait]
impl Locksmith for FileLocksmith {
    async fn lock(&self, key: &str) -> KilnResult<LockGuard> {
        let file = self.open(key)?;
        let owned_key = key.to_string();

        let file = tokio::task::spawn_blocking(move || {
            flock(file.as_fd(), FlockOperation::LockExclusive)
                .map(|()| file)
                .map_err(|e| KilnError::Lock {
                    key: owned_key,
                    message: e.to_string(),
                })
        })
        .await
        .map_err(|e| KilnError::Internal {
            message: format!("lock task failed: {e}"),
        })??;

        tracing::trace!(key, "Lock acquired");
        Ok(LockGuard {
            key: key.to_string(),
            file: Some(file),
        })
    }

    fn try_lock(&self, key: &str) -> KilnResult<Option<LockGuard>> {
        let file = self.open(key)?;

        match flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(LockGuard {
                key: key.to_string(),
                file: Some(file),
            })),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(KilnError::Lock {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn validate_key(key: &str) -> KilnResult<()> {
    if key.is_empty()
        || key.starts_with('.')
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(KilnError::Lock {
            key: key.to_string(),
            message: "invalid lock key".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_is_exclusive_between_openers() {
        let temp = tempfile::tempdir().unwrap();
        let smith = FileLocksmith::new(temp.path()).unwrap();

        let guard = smith.lock("abc").await.unwrap();
        assert!(smith.try_lock("abc").unwrap().is_none());
        assert!(smith.try_lock("other").unwrap().is_some());

        guard.unlock().unwrap();
        assert!(smith.try_lock("abc").unwrap().is_some());
    }

    #[tokio::test]
    async fn drop_releases_lock() {
        let temp = tempfile::tempdir().unwrap();
        let smith = FileLocksmith::new(temp.path()).unwrap();

        {
            let _guard = smith.lock("abc").await.unwrap();
        }
        assert!(smith.try_lock("abc").unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_proceeds_after_release() {
        let temp = tempfile::tempdir().unwrap();
        let smith = FileLocksmith::new(temp.path()).unwrap();

        let guard = smith.lock("abc").await.unwrap();
        let waiter = {
            let smith = smith.clone();
            tokio::spawn(async move { smith.lock("abc").await.map(|g| g.key().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap().unwrap(), "abc");
    }

    #[test]
    fn rejects_path_like_keys() {
        let temp = tempfile::tempdir().unwrap();
        let smith = FileLocksmith::new(temp.path()).unwrap();
        assert!(smith.try_lock("../escape").is_err());
        assert!(smith.try_lock("").is_err());
    }
}
