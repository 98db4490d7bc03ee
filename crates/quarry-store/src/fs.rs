//! Filesystem directory backends
//!
//! One `FsDirectory` per shard path. Writes always go through a buffered
//! file; the `FsAccess` mode only decides how files are read:
//!
//! | access     | reads                                              |
//! |------------|----------------------------------------------------|
//! | `Simple`   | unbuffered seek + read under a per-input mutex     |
//! | `Buffered` | `BufReader`, sequential reads reuse the buffer     |
//! | `Mmap`     | whole file memory-mapped, reads are slice copies   |
//! | `Direct`   | aligned O_DIRECT / F_NOCACHE reads (see `raw_io`)  |

use crate::directory::{Directory, IndexInput, IndexOutput, check_file_name, check_read_bounds};
use crate::lock::{Lock, LockFactory};
use crate::raw_io::DirectFile;
use parking_lot::Mutex;
use quarry_common::{Error, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Read buffer size for buffered inputs
const BUFFER_SIZE: usize = 16 * 1024;

/// How an `FsDirectory` reads its files
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsAccess {
    Simple,
    Buffered,
    Mmap,
    Direct,
}

impl FsAccess {
    /// Backend name reported by directories and inputs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Buffered => "buffered",
            Self::Mmap => "mmap",
            Self::Direct => "direct",
        }
    }
}

/// Directory over a local filesystem path
pub struct FsDirectory {
    path: PathBuf,
    access: FsAccess,
    lock_factory: Arc<dyn LockFactory>,
}

impl FsDirectory {
    /// Open (and create if absent) a directory at `path`
    pub fn open(
        path: impl AsRef<Path>,
        access: FsAccess,
        lock_factory: Arc<dyn LockFactory>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| {
            Error::storage(format!("failed to create directory {}: {e}", path.display()))
        })?;
        debug!("opened {} directory at {}", access.name(), path.display());
        Ok(Self {
            path,
            access,
            lock_factory,
        })
    }

    /// Read access mode
    pub const fn access(&self) -> FsAccess {
        self.access
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        check_file_name(name)?;
        Ok(self.path.join(name))
    }

    fn open_file(&self, name: &str) -> Result<(File, u64)> {
        let path = self.file_path(name)?;
        let file = File::open(&path).map_err(|e| not_found_or(e, name))?;
        let len = file.metadata()?.len();
        Ok((file, len))
    }
}

impl fmt::Debug for FsDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsDirectory")
            .field("path", &self.path)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

fn not_found_or(e: io::Error, name: &str) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::FileNotFound(name.to_string())
    } else {
        Error::Io(e)
    }
}

impl Directory for FsDirectory {
    fn path(&self) -> &Path {
        &self.path
    }

    fn backend(&self) -> &'static str {
        self.access.name()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        let path = self.file_path(name)?;
        let meta = std::fs::metadata(&path).map_err(|e| not_found_or(e, name))?;
        Ok(meta.len())
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        match self.access {
            FsAccess::Simple => {
                let (file, len) = self.open_file(name)?;
                Ok(Box::new(SimpleInput {
                    name: name.to_string(),
                    file: Mutex::new(file),
                    len,
                }))
            }
            FsAccess::Buffered => {
                let (file, len) = self.open_file(name)?;
                Ok(Box::new(BufferedInput {
                    name: name.to_string(),
                    reader: Mutex::new(BufferedReader {
                        inner: BufReader::with_capacity(BUFFER_SIZE, file),
                        position: Some(0),
                    }),
                    len,
                }))
            }
            FsAccess::Mmap => {
                let (file, len) = self.open_file(name)?;
                let map = if len == 0 {
                    None
                } else {
                    // SAFETY: index files are write-once; nothing truncates a
                    // file while readers have it open.
                    #[allow(unsafe_code)]
                    let map = unsafe { memmap2::Mmap::map(&file)? };
                    Some(map)
                };
                Ok(Box::new(MmapInput {
                    name: name.to_string(),
                    map,
                }))
            }
            FsAccess::Direct => {
                let path = self.file_path(name)?;
                let file = DirectFile::open(&path).map_err(|e| match e {
                    Error::FileNotFound(_) => Error::FileNotFound(name.to_string()),
                    other => other,
                })?;
                Ok(Box::new(DirectInput {
                    name: name.to_string(),
                    file,
                }))
            }
        }
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        let path = self.file_path(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::storage(format!("file already exists: {name}"))
                } else {
                    Error::Io(e)
                }
            })?;
        Ok(Box::new(FsOutput {
            name: name.to_string(),
            writer: BufWriter::with_capacity(BUFFER_SIZE, file),
            written: 0,
        }))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name)?;
        std::fs::remove_file(&path).map_err(|e| not_found_or(e, name))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.file_path(from)?;
        let to_path = self.file_path(to)?;
        std::fs::rename(&from_path, &to_path).map_err(|e| not_found_or(e, from))
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let path = self.file_path(name)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| not_found_or(e, name))?;
            file.sync_all()?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_meta_data(&self) -> Result<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_meta_data(&self) -> Result<()> {
        // Directory handles cannot be fsynced on this platform
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        check_file_name(name)?;
        self.lock_factory.obtain_lock(&self.path, name)
    }
}

struct SimpleInput {
    name: String,
    file: Mutex<File>,
    len: u64,
}

impl IndexInput for SimpleInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        FsAccess::Simple.name()
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_bounds(&self.name, self.len, offset, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

struct BufferedReader {
    inner: BufReader<File>,
    /// Logical file position; unknown after a failed seek or read
    position: Option<u64>,
}

struct BufferedInput {
    name: String,
    reader: Mutex<BufferedReader>,
    len: u64,
}

impl IndexInput for BufferedInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        FsAccess::Buffered.name()
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_bounds(&self.name, self.len, offset, buf.len())?;
        let mut reader = self.reader.lock();
        match reader.position.take() {
            Some(position) if position == offset => {}
            // Short hops stay inside the current buffer
            Some(position) => {
                reader
                    .inner
                    .seek_relative(offset.cast_signed() - position.cast_signed())?;
            }
            None => {
                reader.inner.seek(SeekFrom::Start(offset))?;
            }
        }
        reader.inner.read_exact(buf)?;
        reader.position = Some(offset + buf.len() as u64);
        Ok(())
    }
}

struct MmapInput {
    name: String,
    map: Option<memmap2::Mmap>,
}

impl MmapInput {
    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or_default()
    }
}

impl IndexInput for MmapInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        FsAccess::Mmap.name()
    }

    fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_bounds(&self.name, self.len(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes()[start..start + buf.len()]);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(self.bytes().to_vec())
    }
}

struct DirectInput {
    name: String,
    file: DirectFile,
}

impl IndexInput for DirectInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        FsAccess::Direct.name()
    }

    fn len(&self) -> u64 {
        self.file.size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_bounds(&self.name, self.len(), offset, buf.len())?;
        self.file.read_at(offset, buf)
    }
}

struct FsOutput {
    name: String,
    writer: BufWriter<File>,
    written: u64,
}

impl Write for FsOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl IndexOutput for FsOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let name = self.name;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| Error::storage(format!("failed to flush {name}: {}", e.error())))?;
        file.sync_all()?;
        Ok(())
    }
}
