//! Directory service
//!
//! Turns a validated `StoreConfig` into per-shard `StoreDirectory` handles.
//!
//! # Backend selection
//! ```text
//! store_type   non-Windows                         Windows
//! auto         mmap(primary ext) + buffered(rest)  mmap
//! simple       simple                              simple
//! buffered     buffered                            buffered
//! mmap         mmap                                mmap
//! direct       direct                              direct
//! ```
//!
//! On a shared filesystem every lock goes through a `SleepingLockFactory`
//! with the configured timeout and poll interval.

use crate::directory::{Directory, IndexInput, IndexOutput};
use crate::file_switch::FileSwitchDirectory;
use crate::fs::{FsAccess, FsDirectory};
use crate::lock::{Lock, LockFactory, NativeFsLockFactory, SimpleFsLockFactory, SleepingLockFactory};
use crate::rate_limit::{RateLimitedOutput, RateLimiter};
use quarry_common::config::{LockType, StoreConfig, StoreType};
use quarry_common::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Creates shard directories according to the store configuration
#[derive(Debug, Clone)]
pub struct DirectoryService {
    config: StoreConfig,
    lock_factory: Arc<dyn LockFactory>,
}

impl DirectoryService {
    /// Validate the configuration and build the lock strategy
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let base: Arc<dyn LockFactory> = match config.lock_type {
            LockType::Native => Arc::new(NativeFsLockFactory),
            LockType::Simple => Arc::new(SimpleFsLockFactory),
        };
        let lock_factory: Arc<dyn LockFactory> = if config.shared_filesystem {
            Arc::new(SleepingLockFactory::new(
                base,
                config.lock_timeout(),
                config.lock_poll_interval(),
            ))
        } else {
            base
        };

        Ok(Self {
            config,
            lock_factory,
        })
    }

    /// Store configuration in use
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open a directory handle for a shard path, creating the path if absent
    pub fn new_directory(&self, path: impl AsRef<Path>) -> Result<StoreDirectory> {
        let path = path.as_ref();
        let store_type = self.config.store_type;

        let inner: Box<dyn Directory> = match store_type {
            StoreType::Auto if cfg!(windows) => Box::new(self.fs(path, FsAccess::Mmap)?),
            StoreType::Auto => Box::new(FileSwitchDirectory::new(
                self.config.primary_extensions.iter().cloned(),
                Box::new(self.fs(path, FsAccess::Mmap)?),
                Box::new(self.fs(path, FsAccess::Buffered)?),
            )?),
            StoreType::Simple => Box::new(self.fs(path, FsAccess::Simple)?),
            StoreType::Buffered => Box::new(self.fs(path, FsAccess::Buffered)?),
            StoreType::Mmap => Box::new(self.fs(path, FsAccess::Mmap)?),
            StoreType::Direct => Box::new(self.fs(path, FsAccess::Direct)?),
        };

        let rate_limiter = self
            .config
            .max_write_bytes_per_sec
            .map(|rate| Arc::new(RateLimiter::new(rate)));

        info!(
            "opened {} store at {} (shared_fs={}, throttle={:?})",
            store_type,
            path.display(),
            self.config.shared_filesystem,
            self.config.max_write_bytes_per_sec
        );

        Ok(StoreDirectory {
            inner,
            store_type,
            rate_limiter,
        })
    }

    fn fs(&self, path: &Path, access: FsAccess) -> Result<FsDirectory> {
        FsDirectory::open(path, access, Arc::clone(&self.lock_factory))
    }
}

/// Directory handle for one shard: a backend plus optional write throttle
#[derive(Debug)]
pub struct StoreDirectory {
    inner: Box<dyn Directory>,
    store_type: StoreType,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl StoreDirectory {
    /// Configured store type
    pub const fn store_type(&self) -> StoreType {
        self.store_type
    }

    /// Write throttle, if configured
    pub const fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Underlying backend
    pub fn inner(&self) -> &dyn Directory {
        self.inner.as_ref()
    }
}

impl Directory for StoreDirectory {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.inner.list_all()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.inner.file_length(name)
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        let output = self.inner.create_output(name)?;
        Ok(match &self.rate_limiter {
            Some(limiter) => Box::new(RateLimitedOutput::new(output, Arc::clone(limiter))),
            None => output,
        })
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.inner.sync(names)
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.inner.sync_meta_data()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        self.inner.obtain_lock(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{read_file, write_file};
    use crate::lock::WRITE_LOCK_NAME;
    use quarry_common::{Error, LockFailure};
    use std::time::Duration;
    use tempfile::tempdir;

    fn service(store_type: StoreType) -> DirectoryService {
        DirectoryService::new(StoreConfig {
            store_type,
            primary_extensions: vec!["nvd".into(), "dvd".into(), "tim".into()],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    #[cfg(not(windows))]
    fn test_auto_splits_by_extension() {
        let dir = tempdir().unwrap();
        let store = service(StoreType::Auto)
            .new_directory(dir.path().join("shard0"))
            .unwrap();
        assert_eq!(store.backend(), "file_switch");

        write_file(&store, "segment.tim", b"t").unwrap();
        write_file(&store, "segment.fdt", b"f").unwrap();
        assert_eq!(store.open_input("segment.tim").unwrap().backend(), "mmap");
        assert_eq!(store.open_input("segment.fdt").unwrap().backend(), "buffered");
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_explicit_store_types() {
        for (store_type, backend) in [
            (StoreType::Simple, "simple"),
            (StoreType::Buffered, "buffered"),
            (StoreType::Mmap, "mmap"),
            (StoreType::Direct, "direct"),
        ] {
            let dir = tempdir().unwrap();
            let store = service(store_type).new_directory(dir.path()).unwrap();
            assert_eq!(store.backend(), backend);
            assert_eq!(store.store_type(), store_type);
            write_file(&store, "_0.tim", b"abc").unwrap();
            assert_eq!(read_file(&store, "_0.tim").unwrap(), b"abc");
        }
    }

    #[test]
    fn test_creates_shard_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("indices").join("books").join("0");
        service(StoreType::Buffered).new_directory(&path).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn test_unknown_store_type_fails_before_io() {
        let err = "hdfs".parse::<StoreType>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = DirectoryService::new(StoreConfig {
            max_write_bytes_per_sec: Some(0),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_shared_filesystem_lock_retries() {
        let dir = tempdir().unwrap();
        let shared = DirectoryService::new(StoreConfig {
            store_type: StoreType::Buffered,
            shared_filesystem: true,
            lock_timeout_ms: 150,
            lock_poll_interval_ms: 50,
            ..Default::default()
        })
        .unwrap();
        let store = shared.new_directory(dir.path()).unwrap();
        let other = shared.new_directory(dir.path()).unwrap();

        let _held = store.obtain_lock(WRITE_LOCK_NAME).unwrap();
        let started = std::time::Instant::now();
        let err = other.obtain_lock(WRITE_LOCK_NAME).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(matches!(
            err,
            Error::LockUnavailable {
                reason: LockFailure::RetriesExhausted { attempts: 4, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_local_lock_fails_fast() {
        let dir = tempdir().unwrap();
        let svc = service(StoreType::Buffered);
        let store = svc.new_directory(dir.path()).unwrap();
        let _held = store.obtain_lock(WRITE_LOCK_NAME).unwrap();
        let err = store.obtain_lock(WRITE_LOCK_NAME).unwrap_err();
        assert!(matches!(
            err,
            Error::LockUnavailable {
                reason: LockFailure::HeldElsewhere,
                ..
            }
        ));
    }

    #[test]
    fn test_throttled_outputs() {
        let dir = tempdir().unwrap();
        let svc = DirectoryService::new(StoreConfig {
            store_type: StoreType::Buffered,
            max_write_bytes_per_sec: Some(1_000_000),
            ..Default::default()
        })
        .unwrap();
        let store = svc.new_directory(dir.path()).unwrap();
        assert_eq!(store.rate_limiter().unwrap().bytes_per_sec(), 1_000_000);
        write_file(&store, "_0.fdt", &[7u8; 4096]).unwrap();
        assert_eq!(store.file_length("_0.fdt").unwrap(), 4096);
    }
}
