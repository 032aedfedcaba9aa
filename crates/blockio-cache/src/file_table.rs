//! Open-file table
//!
//! A fixed-capacity table mapping opaque handles to the underlying raw
//! file and a per-handle cursor, guarded by one table-wide lock. The
//! lock is held only for table metadata; never across a storage call or
//! a cache operation.
//!
//! Handles and file identities are both monotonic and never reused, so
//! a stale handle reliably fails with `BadHandle` and a stale cache slot
//! can never alias a newer file.

use crate::raw_io::RawFile;
use blockio_common::{Error, FileId, Handle, Result};
use parking_lot::Mutex;
use std::sync::Arc;

struct OpenEntry {
    handle: Handle,
    file_id: FileId,
    file: Arc<RawFile>,
    cursor: u64,
}

/// Snapshot of an open entry, taken under the table lock.
///
/// The cursor is a copy: concurrent read/write/seek on the same handle
/// are not ordered against each other, and the last writer through
/// [`OpenFileTable::update_cursor`] wins.
#[derive(Debug)]
pub struct FileRef {
    pub file_id: FileId,
    pub file: Arc<RawFile>,
    pub cursor: u64,
}

/// Fixed-capacity open-file table
pub struct OpenFileTable {
    inner: Mutex<TableInner>,
    capacity: usize,
}

struct TableInner {
    entries: Vec<Option<OpenEntry>>,
    next_handle: u64,
    next_file_id: u64,
}

impl OpenFileTable {
    /// Create a table with room for `capacity` simultaneously open files
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(TableInner {
                entries,
                next_handle: 1,
                next_file_id: 1,
            }),
            capacity,
        }
    }

    /// Maximum number of simultaneously open files
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently open entries
    pub fn open_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.is_some())
            .count()
    }

    /// Register an already-opened file, cursor at 0.
    ///
    /// Fails with `TooManyOpenFiles` when the table is full; the caller
    /// drops the file, which closes the freshly opened descriptor.
    pub fn register(&self, file: RawFile) -> Result<Handle> {
        let mut inner = self.inner.lock();

        let Some(slot) = inner.entries.iter().position(Option::is_none) else {
            return Err(Error::TooManyOpenFiles { max: self.capacity });
        };

        let handle = Handle::from_raw(inner.next_handle);
        inner.next_handle += 1;
        let file_id = FileId::from_raw(inner.next_file_id);
        inner.next_file_id += 1;

        inner.entries[slot] = Some(OpenEntry {
            handle,
            file_id,
            file: Arc::new(file),
            cursor: 0,
        });
        Ok(handle)
    }

    /// Snapshot the entry for `handle`
    pub fn resolve(&self, handle: Handle) -> Result<FileRef> {
        let inner = self.inner.lock();
        let entry = Self::find(&inner, handle)?;
        Ok(FileRef {
            file_id: entry.file_id,
            file: Arc::clone(&entry.file),
            cursor: entry.cursor,
        })
    }

    /// Persist a new cursor position for `handle`
    pub fn update_cursor(&self, handle: Handle, cursor: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = Self::find_mut(&mut inner, handle)?;
        entry.cursor = cursor;
        Ok(())
    }

    /// Free the entry for `handle`, returning its final snapshot so the
    /// caller can flush before the descriptor drops.
    pub fn remove(&self, handle: Handle) -> Result<FileRef> {
        let mut inner = self.inner.lock();
        let slot = inner
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.handle == handle))
            .ok_or(Error::BadHandle(handle))?;
        let entry = inner.entries[slot].take().expect("slot checked above");
        Ok(FileRef {
            file_id: entry.file_id,
            file: entry.file,
            cursor: entry.cursor,
        })
    }

    /// Handles of all currently open entries (teardown helper)
    pub fn handles(&self) -> Vec<Handle> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter_map(|e| e.as_ref().map(|e| e.handle))
            .collect()
    }

    fn find(inner: &TableInner, handle: Handle) -> Result<&OpenEntry> {
        inner
            .entries
            .iter()
            .filter_map(Option::as_ref)
            .find(|e| e.handle == handle)
            .ok_or(Error::BadHandle(handle))
    }

    fn find_mut(inner: &mut TableInner, handle: Handle) -> Result<&mut OpenEntry> {
        inner
            .entries
            .iter_mut()
            .filter_map(Option::as_mut)
            .find(|e| e.handle == handle)
            .ok_or(Error::BadHandle(handle))
    }
}

impl std::fmt::Debug for OpenFileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFileTable")
            .field("capacity", &self.capacity)
            .field("open", &self.open_count())
            .finish()
    }
}
