//! Platform-specific raw file I/O
//!
//! Provides direct file access bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! This is the storage substrate under the block cache: positioned reads
//! and writes in block-aligned units, a size query, and a durable flush.

use blockio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Minimum offset/length alignment for direct I/O (logical sector size)
pub const DIRECT_IO_ALIGNMENT: usize = 512;

/// Raw file handle with optional direct I/O
///
/// The descriptor is closed when the last reference is dropped; cache
/// slots hold their own reference so write-back stays valid after the
/// owning handle is closed.
pub struct RawFile {
    file: File,
    path: PathBuf,
    direct_io: bool,
}

impl RawFile {
    /// Open a file read-write for raw I/O
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true);

        // O_DIRECT bypasses the page cache on Linux
        #[cfg(target_os = "linux")]
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::open(&path, e))?;

        // On macOS, use F_NOCACHE after opening
        #[cfg(target_os = "macos")]
        if direct_io {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fcntl on an fd we own; F_NOCACHE takes an int arg.
            let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
            if ret == -1 {
                return Err(Error::open(&path, std::io::Error::last_os_error()));
            }
        }

        Ok(Self {
            file,
            path,
            direct_io,
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was opened with direct I/O
    pub fn is_direct(&self) -> bool {
        self.direct_io
    }

    /// Query the current file size (the seek-to-end primitive)
    ///
    /// Queried from the filesystem on every call: the file may have been
    /// extended by another handle's flush since open.
    pub fn len(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| Error::io(format!("stat {}", self.path.display()), e))?;
        Ok(meta.len())
    }

    /// Check if the file is currently empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Positioned read at the given offset
    ///
    /// Reads until `buf` is full or end-of-data; returns the number of
    /// bytes read, which is short only at end-of-file. Offset and length
    /// must be aligned when the file is open for direct I/O.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_alignment(offset, buf.len())?;

        let mut total = 0;
        while total < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[total..], offset + total as u64)
                .map_err(|e| {
                    Error::io(
                        format!("read {} bytes at {} from {}", buf.len(), offset, self.path.display()),
                        e,
                    )
                })?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Positioned write at the given offset
    ///
    /// Writes the whole buffer or fails. Offset and length must be
    /// aligned when the file is open for direct I/O.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;

        self.file.write_all_at(buf, offset).map_err(|e| {
            Error::io(
                format!("write {} bytes at {} to {}", buf.len(), offset, self.path.display()),
                e,
            )
        })
    }

    /// Durably flush outstanding writes (fsync)
    ///
    /// Completion implies all prior `write_at` calls on this descriptor
    /// are on stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::io(format!("fsync {}", self.path.display()), e))
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        if !self.direct_io {
            return Ok(());
        }
        if offset as usize % DIRECT_IO_ALIGNMENT != 0 {
            return Err(Error::invalid_argument(format!(
                "offset {offset} is not aligned to {DIRECT_IO_ALIGNMENT}"
            )));
        }
        if len % DIRECT_IO_ALIGNMENT != 0 {
            return Err(Error::invalid_argument(format!(
                "length {len} is not aligned to {DIRECT_IO_ALIGNMENT}"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RawFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFile")
            .field("path", &self.path)
            .field("direct_io", &self.direct_io)
            .finish()
    }
}

/// Heap buffer aligned for direct I/O
///
/// O_DIRECT requires the user buffer itself to be aligned, not just the
/// file offset, so plain `Vec<u8>` allocations are not usable for block
/// transfers. The buffer is zero-initialized and never grows.
pub struct AlignedBuffer {
    ptr: std::ptr::NonNull<u8>,
    layout: std::alloc::Layout,
}

// SAFETY: the buffer is plain owned bytes; the raw pointer is only a
// consequence of manual aligned allocation.
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuffer {}

#[allow(unsafe_code)]
impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to
    /// [`DIRECT_IO_ALIGNMENT`], rounding the size up if needed.
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, DIRECT_IO_ALIGNMENT)
    }

    /// Allocate a zeroed buffer with a custom power-of-two alignment.
    ///
    /// The allocated length is `size` rounded up to a multiple of
    /// `alignment`, so callers that need an exact length must pass a
    /// size that is already a multiple.
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        let aligned_size = size.div_ceil(alignment) * alignment;
        let layout = std::alloc::Layout::from_size_align(aligned_size.max(alignment), alignment)
            .expect("invalid layout for aligned buffer");

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = std::ptr::NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };

        Self { ptr, layout }
    }

    /// Get the buffer length
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Get the buffer as a slice
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the lifetime
        // of self, and the bytes are always initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Copy data into the buffer, zero-filling any tail
    pub fn copy_from(&mut self, src: &[u8]) {
        let len = self.len();
        let copy_len = src.len().min(len);
        let slice = self.as_mut_slice();
        slice[..copy_len].copy_from_slice(&src[..copy_len]);
        if copy_len < len {
            slice[copy_len..].fill(0);
        }
    }
}

#[allow(unsafe_code)]
impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len())
            .field("align", &self.layout.align())
            .finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer_zeroed_and_sized() {
        let buf = AlignedBuffer::new(4096);
        assert_eq!(buf.len(), 4096);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);
    }

    #[test]
    fn test_aligned_buffer_rounds_up() {
        let buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), DIRECT_IO_ALIGNMENT);

        let buf = AlignedBuffer::with_alignment(1024, 1024);
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn test_aligned_buffer_copy_from_pads() {
        let mut buf = AlignedBuffer::with_alignment(512, 512);
        buf.as_mut_slice().fill(0xAA);
        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert!(buf.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_raw_file_write_read_roundtrip() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::open(temp.path(), false).unwrap();

        let mut buf = AlignedBuffer::with_alignment(512, 512);
        buf.copy_from(b"raw io block");
        file.write_at(512, buf.as_slice()).unwrap();
        file.sync().unwrap();

        let mut out = AlignedBuffer::with_alignment(512, 512);
        let n = file.read_at(512, out.as_mut_slice()).unwrap();
        assert_eq!(n, 512);
        assert!(out.as_slice().starts_with(b"raw io block"));
        assert_eq!(file.len().unwrap(), 1024);
    }

    #[test]
    fn test_raw_file_short_read_at_eof() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::open(temp.path(), false).unwrap();

        let mut buf = AlignedBuffer::with_alignment(512, 512);
        buf.copy_from(&[7u8; 512]);
        file.write_at(0, buf.as_slice()).unwrap();

        // Read a full block past the data: nothing there.
        let mut out = AlignedBuffer::with_alignment(512, 512);
        let n = file.read_at(512, out.as_mut_slice()).unwrap();
        assert_eq!(n, 0);

        // Read at the start: full block available.
        let n = file.read_at(0, out.as_mut_slice()).unwrap();
        assert_eq!(n, 512);
        assert_eq!(out.as_slice(), &[7u8; 512]);
    }

    #[test]
    fn test_open_missing_path_fails() {
        let err = RawFile::open("/nonexistent/dir/file", false).unwrap_err();
        assert!(matches!(err, blockio_common::Error::Open { .. }));
    }
}
