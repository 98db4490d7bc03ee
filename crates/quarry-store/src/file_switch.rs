//! Extension based composition of two directories
//!
//! Files whose extension is in the primary set are served by the primary
//! directory, everything else by the secondary one. Both directories must
//! point at the same filesystem path, so listing the primary is enough:
//! `list_all` never asks the secondary.

use crate::directory::{Directory, IndexInput, IndexOutput};
use crate::lock::Lock;
use quarry_common::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// Routes files to one of two directories by extension
#[derive(Debug)]
pub struct FileSwitchDirectory {
    primary_extensions: HashSet<String>,
    primary: Box<dyn Directory>,
    secondary: Box<dyn Directory>,
}

impl FileSwitchDirectory {
    /// Combine two directories over the same path
    pub fn new(
        primary_extensions: impl IntoIterator<Item = impl Into<String>>,
        primary: Box<dyn Directory>,
        secondary: Box<dyn Directory>,
    ) -> Result<Self> {
        if primary.path() != secondary.path() {
            return Err(Error::configuration(format!(
                "file switch directories must share a path: {} vs {}",
                primary.path().display(),
                secondary.path().display()
            )));
        }
        Ok(Self {
            primary_extensions: primary_extensions.into_iter().map(Into::into).collect(),
            primary,
            secondary,
        })
    }

    /// Extension of a file name, without the dot
    pub fn extension(name: &str) -> Option<&str> {
        name.rsplit_once('.').map(|(_, ext)| ext)
    }

    /// Check whether `name` is served by the primary directory
    pub fn is_primary(&self, name: &str) -> bool {
        Self::extension(name).is_some_and(|ext| self.primary_extensions.contains(ext))
    }

    fn directory_for(&self, name: &str) -> &dyn Directory {
        if self.is_primary(name) {
            self.primary.as_ref()
        } else {
            self.secondary.as_ref()
        }
    }

    /// Primary directory
    pub fn primary(&self) -> &dyn Directory {
        self.primary.as_ref()
    }

    /// Secondary directory
    pub fn secondary(&self) -> &dyn Directory {
        self.secondary.as_ref()
    }
}

impl Directory for FileSwitchDirectory {
    fn path(&self) -> &Path {
        self.primary.path()
    }

    fn backend(&self) -> &'static str {
        "file_switch"
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.primary.list_all()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.directory_for(name).file_length(name)
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        self.directory_for(name).open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.directory_for(name).create_output(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.directory_for(name).delete_file(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        // Same path underneath, so either side can move the file
        self.directory_for(to).rename(from, to)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        let (primary, secondary): (Vec<String>, Vec<String>) =
            names.iter().cloned().partition(|n| self.is_primary(n));
        if !primary.is_empty() {
            self.primary.sync(&primary)?;
        }
        if !secondary.is_empty() {
            self.secondary.sync(&secondary)?;
        }
        Ok(())
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.primary.sync_meta_data()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        self.primary.obtain_lock(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::write_file;
    use crate::fs::{FsAccess, FsDirectory};
    use crate::lock::NativeFsLockFactory;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Counts `list_all` calls on the wrapped directory
    #[derive(Debug)]
    struct CountingDirectory {
        inner: FsDirectory,
        list_calls: Arc<AtomicUsize>,
    }

    impl Directory for CountingDirectory {
        fn path(&self) -> &Path {
            self.inner.path()
        }
        fn backend(&self) -> &'static str {
            self.inner.backend()
        }
        fn list_all(&self) -> Result<Vec<String>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.list_all()
        }
        fn file_length(&self, name: &str) -> Result<u64> {
            self.inner.file_length(name)
        }
        fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
            self.inner.open_input(name)
        }
        fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
            self.inner.create_output(name)
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

    fn counting(path: &Path, access: FsAccess, calls: &Arc<AtomicUsize>) -> Box<dyn Directory> {
        Box::new(CountingDirectory {
            inner: FsDirectory::open(path, access, Arc::new(NativeFsLockFactory)).unwrap(),
            list_calls: Arc::clone(calls),
        })
    }

    #[test]
    fn test_routes_by_extension_and_lists_once() {
        let dir = tempdir().unwrap();
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let secondary_calls = Arc::new(AtomicUsize::new(0));

        let switch = FileSwitchDirectory::new(
            ["nvd", "dvd", "tim"],
            counting(dir.path(), FsAccess::Mmap, &primary_calls),
            counting(dir.path(), FsAccess::Buffered, &secondary_calls),
        )
        .unwrap();

        write_file(&switch, "segment.tim", b"terms").unwrap();
        write_file(&switch, "segment.fdt", b"stored").unwrap();

        assert_eq!(switch.open_input("segment.tim").unwrap().backend(), "mmap");
        assert_eq!(
            switch.open_input("segment.fdt").unwrap().backend(),
            "buffered"
        );

        let names = switch.list_all().unwrap();
        assert_eq!(names, vec!["segment.fdt", "segment.tim"]);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_extension_parsing() {
        assert_eq!(FileSwitchDirectory::extension("_0.nvd"), Some("nvd"));
        assert_eq!(FileSwitchDirectory::extension("a.b.tim"), Some("tim"));
        assert_eq!(FileSwitchDirectory::extension("write.lock"), Some("lock"));
        assert_eq!(FileSwitchDirectory::extension("segments"), None);
    }

    #[test]
    fn test_rejects_different_paths() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let err = FileSwitchDirectory::new(
            ["tim"],
            counting(a.path(), FsAccess::Mmap, &calls),
            counting(b.path(), FsAccess::Buffered, &calls),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
