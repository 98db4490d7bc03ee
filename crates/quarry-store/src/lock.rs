//! Directory locks
//!
//! A shard directory is written by one owner at a time. Ownership is a
//! named lock file inside the directory, obtained through a `LockFactory`:
//! - `NativeFsLockFactory`: OS advisory lock (flock / LockFileEx) on the file
//! - `SimpleFsLockFactory`: the file's existence is the lock
//! - `SleepingLockFactory`: wraps another factory and keeps retrying with a
//!   fixed sleep until a timeout, for shared filesystems where a previous
//!   owner on another host may still be letting go
//!
//! Locks are released when the returned guard is dropped.

use parking_lot::Mutex;
use quarry_common::{Error, LockFailure, Result};
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock held by whoever writes to a shard directory
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// An obtained lock; dropping it releases the lock
pub trait Lock: Send + fmt::Debug {
    /// Lock name within its directory
    fn name(&self) -> &str;

    /// Fail if the lock was lost (file removed, released behind our back)
    fn ensure_valid(&self) -> Result<()>;
}

/// Creates locks for directories
pub trait LockFactory: Send + Sync + fmt::Debug {
    /// Obtain `name` inside `dir`
    fn obtain_lock(&self, dir: &Path, name: &str) -> Result<Box<dyn Lock>>;
}

fn held_elsewhere(name: &str) -> Error {
    Error::LockUnavailable {
        name: name.to_string(),
        reason: LockFailure::HeldElsewhere,
    }
}

/// Lock files held by this process. OS locks are per file description, so
/// two handles in one process must be kept apart here.
static HELD_NATIVE_LOCKS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// OS advisory locks via `fs2`
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFsLockFactory;

impl LockFactory for NativeFsLockFactory {
    fn obtain_lock(&self, dir: &Path, name: &str) -> Result<Box<dyn Lock>> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open lock file {}: {e}", path.display())))?;
        let real_path = path.canonicalize()?;

        if !HELD_NATIVE_LOCKS.lock().insert(real_path.clone()) {
            return Err(held_elsewhere(name));
        }

        if fs2::FileExt::try_lock_exclusive(&file).is_err() {
            HELD_NATIVE_LOCKS.lock().remove(&real_path);
            return Err(held_elsewhere(name));
        }

        debug!("obtained native lock {}", real_path.display());
        Ok(Box::new(NativeFsLock {
            name: name.to_string(),
            file,
            path: real_path,
        }))
    }
}

struct NativeFsLock {
    name: String,
    file: File,
    path: PathBuf,
}

impl fmt::Debug for NativeFsLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFsLock({})", self.path.display())
    }
}

impl Lock for NativeFsLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_valid(&self) -> Result<()> {
        if !HELD_NATIVE_LOCKS.lock().contains(&self.path) {
            return Err(Error::storage(format!(
                "lock {} was released by an external force",
                self.path.display()
            )));
        }
        if !self.path.exists() {
            return Err(Error::storage(format!(
                "lock file {} was deleted",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for NativeFsLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("failed to release lock {}: {}", self.path.display(), e);
        }
        HELD_NATIVE_LOCKS.lock().remove(&self.path);
    }
}

/// Marker-file locks: creating the file exclusively takes the lock
///
/// A crashed owner leaves the file behind; it has to be removed by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFsLockFactory;

impl LockFactory for SimpleFsLockFactory {
    fn obtain_lock(&self, dir: &Path, name: &str) -> Result<Box<dyn Lock>> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Box::new(SimpleFsLock {
                name: name.to_string(),
                path,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(held_elsewhere(name)),
            Err(e) => Err(Error::storage(format!(
                "failed to create lock file {}: {e}",
                path.display()
            ))),
        }
    }
}

struct SimpleFsLock {
    name: String,
    path: PathBuf,
}

impl fmt::Debug for SimpleFsLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimpleFsLock({})", self.path.display())
    }
}

impl Lock for SimpleFsLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(Error::storage(format!(
                "lock file {} was deleted",
                self.path.display()
            )))
        }
    }
}

impl Drop for SimpleFsLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Retries a held lock with a fixed sleep until a timeout
#[derive(Debug, Clone)]
pub struct SleepingLockFactory {
    inner: Arc<dyn LockFactory>,
    timeout: Duration,
    poll_interval: Duration,
}

impl SleepingLockFactory {
    /// Wrap `inner`; `poll_interval` must be non-zero
    pub fn new(inner: Arc<dyn LockFactory>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            inner,
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Attempts made before giving up: one immediate try plus one per interval
    pub fn max_attempts(&self) -> u32 {
        let polls = self.timeout.as_millis() / self.poll_interval.as_millis().max(1);
        u32::try_from(polls).unwrap_or(u32::MAX).saturating_add(1)
    }
}

impl LockFactory for SleepingLockFactory {
    fn obtain_lock(&self, dir: &Path, name: &str) -> Result<Box<dyn Lock>> {
        let started = Instant::now();
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.obtain_lock(dir, name) {
                Ok(lock) => {
                    if attempt > 1 {
                        debug!(
                            "obtained {} in {} after {} attempts",
                            name,
                            dir.display(),
                            attempt
                        );
                    }
                    return Ok(lock);
                }
                Err(Error::LockUnavailable {
                    reason: LockFailure::HeldElsewhere,
                    ..
                }) if attempt < max_attempts => {
                    debug!(
                        "{} in {} is held, retrying in {:?} (attempt {}/{})",
                        name,
                        dir.display(),
                        self.poll_interval,
                        attempt,
                        max_attempts
                    );
                    thread::sleep(self.poll_interval);
                }
                Err(Error::LockUnavailable {
                    reason: LockFailure::HeldElsewhere,
                    ..
                }) => {
                    let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        "giving up on {} in {} after {} attempts ({} ms)",
                        name,
                        dir.display(),
                        attempt,
                        waited_ms
                    );
                    return Err(Error::LockUnavailable {
                        name: name.to_string(),
                        reason: LockFailure::RetriesExhausted {
                            attempts: attempt,
                            waited_ms,
                        },
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_native_lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let factory = NativeFsLockFactory;

        let lock = factory.obtain_lock(dir.path(), WRITE_LOCK_NAME).unwrap();
        lock.ensure_valid().unwrap();

        let err = factory.obtain_lock(dir.path(), WRITE_LOCK_NAME).unwrap_err();
        assert!(matches!(
            err,
            Error::LockUnavailable {
                reason: LockFailure::HeldElsewhere,
                ..
            }
        ));

        drop(lock);
        factory.obtain_lock(dir.path(), WRITE_LOCK_NAME).unwrap();
    }

    #[test]
    fn test_simple_lock_marker_file() {
        let dir = tempdir().unwrap();
        let factory = SimpleFsLockFactory;

        let lock = factory.obtain_lock(dir.path(), "merge.lock").unwrap();
        assert!(dir.path().join("merge.lock").exists());
        assert!(factory.obtain_lock(dir.path(), "merge.lock").is_err());

        drop(lock);
        assert!(!dir.path().join("merge.lock").exists());
    }

    #[test]
    fn test_simple_lock_detects_removed_file() {
        let dir = tempdir().unwrap();
        let lock = SimpleFsLockFactory
            .obtain_lock(dir.path(), WRITE_LOCK_NAME)
            .unwrap();
        std::fs::remove_file(dir.path().join(WRITE_LOCK_NAME)).unwrap();
        assert!(lock.ensure_valid().is_err());
    }

    #[test]
    fn test_sleeping_lock_retries_until_timeout() {
        let dir = tempdir().unwrap();
        let factory = SleepingLockFactory::new(
            Arc::new(NativeFsLockFactory),
            Duration::from_millis(200),
            Duration::from_millis(50),
        );
        assert_eq!(factory.max_attempts(), 5);

        let _held = NativeFsLockFactory
            .obtain_lock(dir.path(), WRITE_LOCK_NAME)
            .unwrap();

        let started = Instant::now();
        let err = factory.obtain_lock(dir.path(), WRITE_LOCK_NAME).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        match err {
            Error::LockUnavailable {
                reason: LockFailure::RetriesExhausted { attempts, waited_ms },
                ..
            } => {
                assert_eq!(attempts, 5);
                assert!(waited_ms >= 200);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_sleeping_lock_succeeds_once_released() {
        let dir = tempdir().unwrap();
        let factory = SleepingLockFactory::new(
            Arc::new(SimpleFsLockFactory),
            Duration::from_secs(5),
            Duration::from_millis(20),
        );

        let held = SimpleFsLockFactory
            .obtain_lock(dir.path(), WRITE_LOCK_NAME)
            .unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            drop(held);
        });

        let lock = factory.obtain_lock(dir.path(), WRITE_LOCK_NAME).unwrap();
        lock.ensure_valid().unwrap();
        releaser.join().unwrap();
    }
}
