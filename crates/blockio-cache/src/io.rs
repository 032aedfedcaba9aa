//! Cached file I/O facade
//!
//! Implements open/close/read/write/seek/flush on top of the open-file
//! table and the block cache. Read and write share the same splitting
//! of a byte range into block-aligned sub-ranges; each sub-range is
//! served from the cache, populated from storage on a miss.
//!
//! One [`CachedFileIo`] instance owns one cache and one open-file table.
//! Instances are independent: nothing is process-global, and dropping an
//! instance tears its state down deterministically (with a best-effort
//! flush of anything still open).

use crate::cache::{CacheStats, SlotCache, SlotGuard};
use crate::file_table::{FileRef, OpenFileTable};
use crate::raw_io::{AlignedBuffer, RawFile};
use blockio_common::{CacheConfig, Error, Handle, Result, Whence};
use std::path::Path;
use tracing::{debug, warn};

/// Block-cached file I/O over a direct-I/O substrate
pub struct CachedFileIo {
    config: CacheConfig,
    cache: SlotCache,
    files: OpenFileTable,
}

impl CachedFileIo {
    /// Create an instance with the given configuration.
    ///
    /// Fails with `Configuration` on an invalid config (zero cache
    /// capacity, zero handle table, unaligned block size).
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: SlotCache::new(config.cache_capacity, config.block_size)?,
            files: OpenFileTable::new(config.max_open_files),
            config,
        })
    }

    /// The configuration this instance was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Number of currently open handles
    pub fn open_count(&self) -> usize {
        self.files.open_count()
    }

    /// Open `path` for cached read-write access.
    ///
    /// The file is opened with direct I/O when the configuration asks
    /// for it. If the handle table is full the freshly opened descriptor
    /// is closed again and the call fails with `TooManyOpenFiles`.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Handle> {
        let file = RawFile::open(path, self.config.direct_io)?;
        // On a full table `register` drops `file`, closing the fd.
        self.files.register(file)
    }

    /// Close `handle`, flushing its dirty blocks first.
    ///
    /// The flush is best-effort: a failure is logged and the handle is
    /// freed regardless. Callers that need a durability guarantee call
    /// [`CachedFileIo::flush`] first and check its result.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let fref = self.files.remove(handle)?;
        if let Err(e) = self.flush_ref(&fref) {
            warn!(%handle, error = %e, "flush on close failed, handle freed anyway");
        }
        Ok(())
    }

    /// Read from the handle's cursor into `buf`.
    ///
    /// Returns the number of bytes read, which is short only when the
    /// file ends before `buf` is full. The cursor advances by exactly
    /// the returned count.
    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let fref = self.files.resolve(handle)?;
        let block_size = self.config.block_size as u64;

        let mut pos = fref.cursor;
        let mut produced = 0;
        while produced < buf.len() {
            let block_index = pos / block_size;
            let block_offset = (pos % block_size) as usize;
            let want = (block_size as usize - block_offset).min(buf.len() - produced);

            let slot = self.load_block(&fref, block_index)?;
            let avail = want.min(slot.valid().saturating_sub(block_offset));
            if avail > 0 {
                buf[produced..produced + avail]
                    .copy_from_slice(&slot.data()[block_offset..block_offset + avail]);
            }
            drop(slot);

            produced += avail;
            pos += avail as u64;
            if avail < want {
                // End of data inside this block.
                break;
            }
        }

        self.files.update_cursor(handle, pos)?;
        Ok(produced)
    }

    /// Write `data` at the handle's cursor.
    ///
    /// Blocks are updated in the cache and marked dirty; nothing reaches
    /// storage until a flush, close, or eviction write-back. A partial
    /// block update first populates the slot from storage
    /// (read-modify-write), so bytes around the written range survive.
    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        let fref = self.files.resolve(handle)?;
        let block_size = self.config.block_size as u64;

        let mut pos = fref.cursor;
        let mut written = 0;
        while written < data.len() {
            let block_index = pos / block_size;
            let block_offset = (pos % block_size) as usize;
            let want = (block_size as usize - block_offset).min(data.len() - written);

            let mut slot = self.load_block(&fref, block_index)?;
            slot.data_mut()[block_offset..block_offset + want]
                .copy_from_slice(&data[written..written + want]);
            slot.extend_valid(block_offset + want);
            slot.mark_dirty();
            drop(slot);

            written += want;
            pos += want as u64;
        }

        self.files.update_cursor(handle, pos)?;
        Ok(written)
    }

    /// Move the handle's cursor and return the new position.
    ///
    /// `Whence::End` queries the file's current size on storage. A
    /// negative resulting position fails with `InvalidArgument` and
    /// leaves the cursor unchanged.
    pub fn seek(&self, handle: Handle, offset: i64, whence: Whence) -> Result<u64> {
        let fref = self.files.resolve(handle)?;

        let base = match whence {
            Whence::Start => 0,
            Whence::Current => i64::try_from(fref.cursor)
                .map_err(|_| Error::invalid_argument("cursor exceeds i64 range"))?,
            Whence::End => {
                let size = fref.file.len()?;
                i64::try_from(size)
                    .map_err(|_| Error::invalid_argument("file size exceeds i64 range"))?
            }
        };
        let new_pos = base
            .checked_add(offset)
            .ok_or_else(|| Error::invalid_argument("seek position overflows"))?;
        if new_pos < 0 {
            return Err(Error::invalid_argument(format!(
                "seek to negative position {new_pos}"
            )));
        }

        let new_pos = new_pos as u64;
        self.files.update_cursor(handle, new_pos)?;
        Ok(new_pos)
    }

    /// Write back every dirty block of this handle's file and durably
    /// flush the descriptor.
    ///
    /// Unlike eviction's best-effort write-back, any failure here is
    /// surfaced: flush is the caller-visible durability checkpoint. A
    /// flush with no dirty blocks performs no writes and still succeeds.
    pub fn flush(&self, handle: Handle) -> Result<()> {
        let fref = self.files.resolve(handle)?;
        self.flush_ref(&fref)
    }

    fn flush_ref(&self, fref: &FileRef) -> Result<()> {
        let written = self.cache.flush_file(fref.file_id)?;
        if written > 0 {
            debug!(file = %fref.file_id, blocks = written, "flushed dirty blocks");
        }
        fref.file.sync()
    }

    /// Get the cached slot for a block, populating it from storage on a
    /// miss. The slot comes back locked.
    fn load_block(&self, fref: &FileRef, block_index: u64) -> Result<SlotGuard<'_>> {
        if let Some(slot) = self.cache.lookup(fref.file_id, block_index) {
            return Ok(slot);
        }

        // Miss: whole-block aligned read into a scratch buffer, then
        // publish it. A concurrent loader of the same block may win the
        // insert; in that case its copy is returned and ours dropped.
        let block_size = self.config.block_size;
        let mut block = AlignedBuffer::with_alignment(block_size, block_size);
        let offset = block_index * block_size as u64;
        let n = fref.file.read_at(offset, block.as_mut_slice())?;
        debug!(file = %fref.file_id, block = block_index, bytes = n, "cache miss, loaded block");

        Ok(self
            .cache
            .insert(fref.file_id, &fref.file, block_index, block.as_slice(), n))
    }
}

impl Drop for CachedFileIo {
    fn drop(&mut self) {
        // Deterministic teardown: best-effort flush of everything still
        // open, mirroring close semantics.
        for handle in self.files.handles() {
            if let Ok(fref) = self.files.resolve(handle) {
                if let Err(e) = self.flush_ref(&fref) {
                    warn!(%handle, error = %e, "flush during teardown failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for CachedFileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFileIo")
            .field("config", &self.config)
            .field("open", &self.files.open_count())
            .finish()
    }
}
