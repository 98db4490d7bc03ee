//! Directory abstraction
//!
//! A directory is a flat namespace of immutable files belonging to one shard.
//! Files are written once through an `IndexOutput`, made durable with
//! `finish`, and read back through an `IndexInput`.

use crate::lock::Lock;
use quarry_common::{Error, Result};
use std::fmt;
use std::io::Write;
use std::path::Path;

/// A flat, per-shard file namespace
pub trait Directory: Send + Sync + fmt::Debug {
    /// Filesystem path backing this directory
    fn path(&self) -> &Path;

    /// Backend serving this directory ("simple", "buffered", "mmap", "direct", ...)
    fn backend(&self) -> &'static str;

    /// Names of all files, sorted
    fn list_all(&self) -> Result<Vec<String>>;

    /// Length of a file in bytes
    fn file_length(&self, name: &str) -> Result<u64>;

    /// Check whether a file exists
    fn file_exists(&self, name: &str) -> Result<bool> {
        match self.file_length(name) {
            Ok(_) => Ok(true),
            Err(Error::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a file for reading
    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>>;

    /// Create a new file; fails if the file already exists
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>>;

    /// Delete a file
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Atomically rename a file within this directory
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Fsync the given files
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Fsync the directory entry itself so renames and creates are durable
    fn sync_meta_data(&self) -> Result<()>;

    /// Obtain a named lock for this directory
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>>;
}

/// Random access reader over one file
pub trait IndexInput: Send + Sync {
    /// File name
    fn name(&self) -> &str;

    /// Backend that opened this input
    fn backend(&self) -> &'static str;

    /// File length in bytes
    fn len(&self) -> u64;

    /// Check if the file is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`; fails on reads past the end
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read the whole file
    fn read_all(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len())
            .map_err(|_| Error::storage(format!("{} is too large to read whole", self.name())))?;
        let mut buf = vec![0u8; len];
        self.read_at(0, &mut buf)?;
        Ok(buf)
    }
}

/// Sequential writer for a new file
pub trait IndexOutput: Write + Send {
    /// File name
    fn name(&self) -> &str;

    /// Bytes accepted so far
    fn bytes_written(&self) -> u64;

    /// Flush buffered bytes and fsync the file
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Check bounds for a positional read
pub(crate) fn check_read_bounds(name: &str, len: u64, offset: u64, size: usize) -> Result<()> {
    let end = offset
        .checked_add(size as u64)
        .ok_or_else(|| Error::storage(format!("read offset overflow on {name}")))?;
    if end > len {
        return Err(Error::storage(format!(
            "read past EOF on {name}: offset {offset} + {size} > length {len}"
        )));
    }
    Ok(())
}

/// Reject names that would escape the directory
pub(crate) fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".."
    {
        return Err(Error::storage(format!("invalid file name [{name}]")));
    }
    Ok(())
}

/// Read a whole file from a directory
pub fn read_file(dir: &dyn Directory, name: &str) -> Result<Vec<u8>> {
    dir.open_input(name)?.read_all()
}

/// Write `data` as a new durable file
pub fn write_file(dir: &dyn Directory, name: &str, data: &[u8]) -> Result<()> {
    let mut out = dir.create_output(name)?;
    out.write_all(data)?;
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_validation() {
        assert!(check_file_name("_0.nrm").is_ok());
        assert!(check_file_name("../etc/passwd").is_err());
        assert!(check_file_name("").is_err());
        assert!(check_file_name("..").is_err());
    }

    #[test]
    fn test_read_bounds() {
        assert!(check_read_bounds("a", 10, 0, 10).is_ok());
        assert!(check_read_bounds("a", 10, 5, 6).is_err());
        assert!(check_read_bounds("a", 10, u64::MAX, 2).is_err());
    }
}
