//! Quarry Store - shard directories on the local filesystem
//!
//! This crate implements the storage side of a shard:
//! - A `Directory` abstraction over flat per-shard file namespaces
//! - Filesystem backends: simple, buffered, memory-mapped and direct I/O
//! - Extension based composition of two backends (`FileSwitchDirectory`)
//! - Lock factories: native OS locks, marker files, and a retrying wrapper
//!   for shared filesystems
//! - A token bucket that throttles directory writes
//! - `DirectoryService`, which turns a `StoreConfig` into shard handles

pub mod directory;
pub mod file_switch;
pub mod fs;
pub mod lock;
pub mod rate_limit;
pub mod raw_io;
pub mod service;

// Re-exports
pub use directory::{Directory, IndexInput, IndexOutput, read_file, write_file};
pub use file_switch::FileSwitchDirectory;
pub use fs::{FsAccess, FsDirectory};
pub use lock::{
    Lock, LockFactory, NativeFsLockFactory, SimpleFsLockFactory, SleepingLockFactory,
    WRITE_LOCK_NAME,
};
pub use rate_limit::{RateLimitedOutput, RateLimiter};
pub use service::{DirectoryService, StoreDirectory};
