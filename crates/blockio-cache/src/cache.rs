//! Fixed-capacity block cache with per-slot locking
//!
//! The cache is a flat table of slots, each holding one block's data and
//! identity behind its own mutex. Structural changes (insert, evict) are
//! serialized by a table-wide lock; lookups take only per-slot locks, so
//! they run concurrently with an in-flight insert scan.
//!
//! Lock order is always table lock before slot lock, never the reverse.
//! Both [`SlotCache::lookup`] and [`SlotCache::insert`] hand the slot
//! back with its lock still held, so the identity a caller observed
//! cannot be evicted out from under it; the caller releases the slot by
//! dropping the guard.
//!
//! Eviction is uniform random replacement: O(1) victim choice with no
//! recency bookkeeping. A dirty victim is written back first; a failed
//! eviction write-back is logged and swallowed, and the slot is freed
//! regardless. Flush (`flush_file`) is the durability checkpoint and
//! surfaces every write failure.

use crate::raw_io::{AlignedBuffer, RawFile};
use blockio_common::{Error, FileId, Result};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A locked reference to a cache slot.
///
/// The slot stays pinned to its identity for as long as the guard lives.
pub type SlotGuard<'a> = MutexGuard<'a, SlotState>;

/// Identity of the block a slot currently holds.
struct SlotOwner {
    file_id: FileId,
    /// Keeps the descriptor alive for write-back even after the opening
    /// handle was closed.
    file: Arc<RawFile>,
    block_index: u64,
}

/// One cache slot: a block-sized buffer, its identity, and a dirty flag.
///
/// `valid` counts the bytes of the buffer that carry real data: a block
/// loaded by a short read near end-of-file is only partially valid, and
/// writes extend it. The remainder of the buffer is zero.
pub struct SlotState {
    owner: Option<SlotOwner>,
    data: AlignedBuffer,
    valid: usize,
    dirty: bool,
}

impl SlotState {
    fn empty(block_size: usize) -> Self {
        Self {
            owner: None,
            data: AlignedBuffer::with_alignment(block_size, block_size),
            valid: 0,
            dirty: false,
        }
    }

    fn matches(&self, file_id: FileId, block_index: u64) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.file_id == file_id && o.block_index == block_index)
    }

    fn owned_by(&self, file_id: FileId) -> bool {
        self.owner.as_ref().is_some_and(|o| o.file_id == file_id)
    }

    fn assign(
        &mut self,
        file_id: FileId,
        file: Arc<RawFile>,
        block_index: u64,
        data: &[u8],
        valid: usize,
    ) {
        self.owner = Some(SlotOwner {
            file_id,
            file,
            block_index,
        });
        self.data.copy_from(data);
        self.valid = valid.min(self.data.len());
        self.dirty = false;
    }

    fn clear(&mut self) {
        self.owner = None;
        self.valid = 0;
        self.dirty = false;
    }

    /// Write the block back to its owner's storage at
    /// `block_index * block_size`.
    fn write_back(&self) -> Result<()> {
        let owner = self
            .owner
            .as_ref()
            .expect("write_back on an empty slot");
        let offset = owner.block_index * self.data.len() as u64;
        owner.file.write_at(offset, self.data.as_slice())
    }

    /// The cached block data
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Mutable access to the cached block data; the caller must mark the
    /// slot dirty after modifying it.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    /// Number of bytes of the buffer holding real data
    pub fn valid(&self) -> usize {
        self.valid
    }

    /// Record that bytes up to `upto` now hold real data
    pub fn extend_valid(&mut self, upto: usize) {
        self.valid = self.valid.max(upto.min(self.data.len()));
    }

    /// Mark the slot's data as not yet written back
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether the slot holds data not yet written back
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of slots evicted
    pub evictions: AtomicU64,
    /// Number of dirty blocks written back (eviction and flush)
    pub writebacks: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Fixed-capacity block cache
pub struct SlotCache {
    slots: Vec<Mutex<SlotState>>,
    /// Serializes insert/evict; identity changes happen only under this
    /// lock, then under the affected slot's own lock.
    table_lock: Mutex<()>,
    block_size: usize,
    stats: CacheStats,
}

impl SlotCache {
    /// Create a cache with `capacity` slots of `block_size` bytes each.
    ///
    /// A zero-capacity cache could never make progress on insert, so it
    /// is rejected here rather than looping later.
    pub fn new(capacity: usize, block_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::configuration("cache capacity must be at least 1"));
        }
        let slots = (0..capacity)
            .map(|_| Mutex::new(SlotState::empty(block_size)))
            .collect();
        Ok(Self {
            slots,
            table_lock: Mutex::new(()),
            block_size,
            stats: CacheStats::default(),
        })
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of slots currently holding a block
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().owner.is_some())
            .count()
    }

    /// Find the slot holding `(file_id, block_index)` and return it
    /// locked, or `None` on a miss.
    ///
    /// Scans one slot lock at a time without the table lock, so it never
    /// blocks behind a concurrent insert's full scan.
    pub fn lookup(&self, file_id: FileId, block_index: u64) -> Option<SlotGuard<'_>> {
        for slot in &self.slots {
            let state = slot.lock();
            if state.matches(file_id, block_index) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(state);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a block, evicting if the table is full, and return the
    /// populated slot locked.
    ///
    /// If another thread inserted the same block first, that slot is
    /// returned untouched — `data` is not copied over it, since the
    /// resident copy may already carry newer dirty bytes. This is what
    /// keeps a block's identity unique across the table.
    ///
    /// The caller must not hold any slot guard from this cache while
    /// calling, or the insert scan can deadlock against it.
    pub fn insert(
        &self,
        file_id: FileId,
        file: &Arc<RawFile>,
        block_index: u64,
        data: &[u8],
        valid: usize,
    ) -> SlotGuard<'_> {
        // Explicit retry loop: each pass either finds a slot or frees
        // one by eviction. With capacity >= 1 a pass after eviction can
        // only fail if a concurrent insert won the freed slot.
        loop {
            let table = self.table_lock.lock();

            let mut free_idx = None;
            for (idx, slot) in self.slots.iter().enumerate() {
                let state = slot.lock();
                if state.matches(file_id, block_index) {
                    drop(table);
                    return state;
                }
                if free_idx.is_none() && state.owner.is_none() {
                    free_idx = Some(idx);
                }
            }

            if let Some(idx) = free_idx {
                // Identity only changes under the table lock, which we
                // still hold, so the slot is still free.
                let mut state = self.slots[idx].lock();
                state.assign(file_id, Arc::clone(file), block_index, data, valid);
                drop(table);
                return state;
            }

            self.evict_locked();
            drop(table);
        }
    }

    /// Evict one slot chosen uniformly at random. Caller holds the
    /// table lock.
    ///
    /// A dirty victim is written back first; a write failure is logged
    /// and the slot is freed anyway, dropping the dirty data. Callers
    /// needing guaranteed durability must use `flush_file`, which
    /// surfaces write errors.
    fn evict_locked(&self) {
        let victim = rand::thread_rng().gen_range(0..self.slots.len());
        let mut state = self.slots[victim].lock();

        if let Some(owner) = &state.owner {
            if state.dirty {
                match state.write_back() {
                    Ok(()) => {
                        self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(
                            slot = victim,
                            file = %owner.file_id,
                            block = owner.block_index,
                            error = %e,
                            "eviction write-back failed, dropping dirty block"
                        );
                    }
                }
            }
            debug!(
                slot = victim,
                file = %owner.file_id,
                block = owner.block_index,
                "evicted block"
            );
        }

        state.clear();
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Write back every dirty block owned by `file_id` and mark it
    /// clean. Returns the number of blocks written.
    ///
    /// Unlike eviction this surfaces the first write failure; blocks
    /// already written stay clean, the failing one stays dirty.
    pub fn flush_file(&self, file_id: FileId) -> Result<usize> {
        let mut written = 0;
        for slot in &self.slots {
            let mut state = slot.lock();
            if state.dirty && state.owned_by(file_id) {
                state.write_back()?;
                state.dirty = false;
                written += 1;
                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(written)
    }

    /// Drop every slot owned by `file_id` without writing anything back.
    /// Test and teardown helper; normal close goes through `flush_file`.
    pub fn discard_file(&self, file_id: FileId) -> usize {
        let mut dropped = 0;
        for slot in &self.slots {
            let mut state = slot.lock();
            if state.owned_by(file_id) {
                state.clear();
                dropped += 1;
            }
        }
        dropped
    }
}

impl std::fmt::Debug for SlotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotCache")
            .field("capacity", &self.slots.len())
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const BLOCK: usize = 512;

    fn temp_file() -> (NamedTempFile, Arc<RawFile>) {
        let temp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::open(temp.path(), false).unwrap());
        (temp, file)
    }

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK]
    }

    #[test]
    fn test_insert_then_lookup_hits() {
        let cache = SlotCache::new(4, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        let slot = cache.insert(id, &file, 3, &block_of(0xAB), BLOCK);
        assert_eq!(slot.data(), &block_of(0xAB)[..]);
        assert!(!slot.is_dirty());
        drop(slot);

        let slot = cache.lookup(id, 3).expect("block should be cached");
        assert_eq!(slot.data(), &block_of(0xAB)[..]);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            SlotCache::new(0, BLOCK),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_lookup_miss() {
        let cache = SlotCache::new(4, BLOCK).unwrap();
        let id = FileId::from_raw(1);

        assert!(cache.lookup(id, 0).is_none());
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_lookup_distinguishes_files() {
        let cache = SlotCache::new(4, BLOCK).unwrap();
        let (_temp, file) = temp_file();

        let a = FileId::from_raw(1);
        let b = FileId::from_raw(2);
        drop(cache.insert(a, &file, 0, &block_of(1), BLOCK));

        assert!(cache.lookup(a, 0).is_some());
        assert!(cache.lookup(b, 0).is_none());
    }

    #[test]
    fn test_duplicate_insert_keeps_resident_copy() {
        let cache = SlotCache::new(4, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        let mut slot = cache.insert(id, &file, 0, &block_of(1), BLOCK);
        slot.data_mut()[0] = 99;
        slot.mark_dirty();
        drop(slot);

        // A second insert of the same block must not clobber the newer
        // dirty data, and must not create a second slot.
        let slot = cache.insert(id, &file, 0, &block_of(2), BLOCK);
        assert_eq!(slot.data()[0], 99);
        assert!(slot.is_dirty());
        drop(slot);
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn test_insert_evicts_when_full() {
        let cache = SlotCache::new(2, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        for block in 0..5 {
            drop(cache.insert(id, &file, block, &block_of(block as u8), BLOCK));
        }

        assert_eq!(cache.occupied(), 2);
        assert!(cache.stats().evictions.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn test_eviction_writes_back_dirty_victim() {
        let cache = SlotCache::new(1, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        let mut slot = cache.insert(id, &file, 0, &block_of(0x5A), BLOCK);
        slot.mark_dirty();
        drop(slot);

        // Capacity 1: inserting any other block must evict block 0 and
        // write it back first.
        drop(cache.insert(id, &file, 1, &block_of(0), BLOCK));

        let mut out = vec![0u8; BLOCK];
        let n = file.read_at(0, &mut out).unwrap();
        assert_eq!(n, BLOCK);
        assert_eq!(out, block_of(0x5A));
        assert_eq!(cache.stats().writebacks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_eviction_skips_clean_write_back() {
        let cache = SlotCache::new(1, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        drop(cache.insert(id, &file, 0, &block_of(1), BLOCK));
        drop(cache.insert(id, &file, 1, &block_of(2), BLOCK));

        // The clean victim was dropped without touching storage.
        assert_eq!(cache.stats().writebacks.load(Ordering::Relaxed), 0);
        assert_eq!(file.len().unwrap(), 0);
    }

    #[test]
    fn test_flush_file_writes_and_cleans() {
        let cache = SlotCache::new(8, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        for block in 0..3u64 {
            let mut slot = cache.insert(id, &file, block, &block_of(block as u8 + 1), BLOCK);
            slot.mark_dirty();
            drop(slot);
        }

        assert_eq!(cache.flush_file(id).unwrap(), 3);
        assert_eq!(file.len().unwrap(), 3 * BLOCK as u64);
        for block in 0..3u64 {
            let mut out = vec![0u8; BLOCK];
            file.read_at(block * BLOCK as u64, &mut out).unwrap();
            assert_eq!(out, block_of(block as u8 + 1));
        }

        // Idempotent: nothing dirty is left.
        assert_eq!(cache.flush_file(id).unwrap(), 0);
    }

    #[test]
    fn test_flush_file_ignores_other_files() {
        let cache = SlotCache::new(8, BLOCK).unwrap();
        let (_temp_a, file_a) = temp_file();
        let (_temp_b, file_b) = temp_file();
        let a = FileId::from_raw(1);
        let b = FileId::from_raw(2);

        let mut slot = cache.insert(a, &file_a, 0, &block_of(1), BLOCK);
        slot.mark_dirty();
        drop(slot);
        let mut slot = cache.insert(b, &file_b, 0, &block_of(2), BLOCK);
        slot.mark_dirty();
        drop(slot);

        assert_eq!(cache.flush_file(a).unwrap(), 1);
        assert_eq!(file_b.len().unwrap(), 0);

        let slot = cache.lookup(b, 0).unwrap();
        assert!(slot.is_dirty());
    }

    #[test]
    fn test_discard_file() {
        let cache = SlotCache::new(8, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        let mut slot = cache.insert(id, &file, 0, &block_of(1), BLOCK);
        slot.mark_dirty();
        drop(slot);

        assert_eq!(cache.discard_file(id), 1);
        assert!(cache.lookup(id, 0).is_none());
        // Dirty data was dropped, not written.
        assert_eq!(file.len().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_inserts_of_one_block_share_a_slot() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;

        let cache = SlotCache::new(4, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let cache = &cache;
                let file = &file;
                s.spawn(move || {
                    let pattern: Vec<u8> =
                        (0..BLOCK).map(|i| (t as u8).wrapping_add(i as u8)).collect();
                    for _ in 0..ROUNDS {
                        // Every thread races insert on the same block;
                        // losers must land on the winner's slot.
                        let mut slot = cache.insert(id, file, 0, &block_of(0), BLOCK);
                        slot.data_mut().copy_from_slice(&pattern);
                        slot.mark_dirty();
                    }
                });
            }
        });

        // All racing inserts converged on a single slot.
        assert_eq!(cache.occupied(), 1);
        assert_eq!(cache.flush_file(id).unwrap(), 1);

        // Each update ran under the slot lock, so the surviving block is
        // one thread's whole pattern, never a torn mix.
        let mut out = vec![0u8; BLOCK];
        assert_eq!(file.read_at(0, &mut out).unwrap(), BLOCK);
        let winner = out[0] as usize;
        assert!(winner < THREADS);
        let expected: Vec<u8> = (0..BLOCK)
            .map(|i| (winner as u8).wrapping_add(i as u8))
            .collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_hit_ratio() {
        let cache = SlotCache::new(4, BLOCK).unwrap();
        let (_temp, file) = temp_file();
        let id = FileId::from_raw(1);

        drop(cache.insert(id, &file, 0, &block_of(1), BLOCK));
        drop(cache.lookup(id, 0));
        drop(cache.lookup(id, 1));

        let ratio = cache.stats().hit_ratio();
        assert!((ratio - 0.5).abs() < f64::EPSILON);
    }
}
