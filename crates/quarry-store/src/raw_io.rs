//! Platform-specific direct reads
//!
//! Opens files bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! Direct reads must use aligned offsets, lengths and buffers, so every
//! positional read is widened to the surrounding aligned span and the
//! requested bytes are copied out of an `AlignedBuffer`.

use quarry_common::{Error, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::ptr::NonNull;
use tracing::warn;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O (typically 4KB or 512 bytes)
pub const ALIGNMENT: usize = 4096;

/// Read-only file handle with direct I/O when the filesystem supports it
pub struct DirectFile {
    file: parking_lot::Mutex<File>,
    path: String,
    size: u64,
    direct: bool,
}

impl DirectFile {
    /// Open a file for direct reads
    ///
    /// Filesystems without O_DIRECT support (tmpfs, some network mounts)
    /// reject the flag with EINVAL; those files fall back to cached reads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let (file, direct) = match Self::open_direct(path) {
            Ok(file) => (file, true),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                warn!("direct I/O not supported for {}, using cached reads", path_str);
                (File::open(path)?, false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path_str));
            }
            Err(e) => {
                return Err(Error::storage(format!("failed to open {path_str}: {e}")));
            }
        };

        let size = file
            .metadata()
            .map_err(|e| Error::storage(format!("failed to get metadata for {path_str}: {e}")))?
            .len();

        Ok(Self {
            file: parking_lot::Mutex::new(file),
            path: path_str,
            size,
            direct,
        })
    }

    #[cfg(target_os = "linux")]
    fn open_direct(path: &Path) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
    }

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn open_direct(path: &Path) -> std::io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new().read(true).open(path)?;
        // SAFETY: the descriptor is owned by `file` and valid for the call.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(file)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn open_direct(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().read(true).open(path)
    }

    /// Get the file size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the page cache is actually bypassed
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let align = ALIGNMENT as u64;
        let start = offset / align * align;
        let end = (offset + buf.len() as u64).div_ceil(align) * align;
        let span = usize::try_from(end - start)
            .map_err(|_| Error::storage(format!("read span too large on {}", self.path)))?;

        let mut aligned = AlignedBuffer::new(span);
        let filled = {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(start))
                .map_err(|e| Error::storage(format!("seek failed on {}: {e}", self.path)))?;
            Self::read_span(&mut file, aligned.as_mut_slice())
                .map_err(|e| Error::storage(format!("read failed on {}: {e}", self.path)))?
        };

        // Short reads are expected at EOF; the caller already checked bounds.
        let skip = (offset - start) as usize;
        if filled < skip + buf.len() {
            return Err(Error::storage(format!(
                "short read on {}: wanted {} bytes at {offset}, got {}",
                self.path,
                buf.len(),
                filled.saturating_sub(skip)
            )));
        }
        buf.copy_from_slice(&aligned.as_slice()[skip..skip + buf.len()]);
        Ok(())
    }

    fn read_span(file: &mut File, out: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < out.len() {
            match file.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// Zeroed heap buffer aligned for direct I/O
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation.
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a zeroed buffer of at least `size` bytes, rounded up to `ALIGNMENT`
    pub fn new(size: usize) -> Self {
        let rounded = size.max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        let layout = Layout::from_size_align(rounded, ALIGNMENT)
            .unwrap_or_else(|_| std::alloc::handle_alloc_error(Layout::new::<u8>()));
        // SAFETY: layout has a non-zero size.
        #[allow(unsafe_code)]
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    /// Get the buffer size
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; buffers hold at least one aligned block
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Get the buffer as a slice
    #[allow(unsafe_code)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Get the buffer as a mutable slice
    #[allow(unsafe_code)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Address alignment of the allocation
    pub fn alignment(&self) -> usize {
        self.ptr.as_ptr() as usize % ALIGNMENT
    }
}

impl Drop for AlignedBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
