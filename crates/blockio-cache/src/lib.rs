//! BlockIO Cache - user-space block caching over direct file I/O
//!
//! Direct I/O (O_DIRECT / F_NOCACHE) bypasses the OS page cache, so this
//! crate supplies its own:
//! - Raw file access with aligned buffers
//! - A fixed-capacity block cache with per-slot locking, dirty tracking,
//!   random-replacement eviction, and write-back
//! - An open-file table mapping opaque handles to descriptors and cursors
//! - A byte-oriented read/write/seek/flush facade on top of both
//!
//! Everything hangs off an explicitly constructed [`CachedFileIo`]
//! instance; there is no process-global state, and independent instances
//! do not share cache capacity.

pub mod cache;
pub mod file_table;
pub mod io;
pub mod raw_io;

// Re-exports
pub use cache::{CacheStats, SlotCache, SlotGuard};
pub use file_table::OpenFileTable;
pub use io::CachedFileIo;
pub use raw_io::{AlignedBuffer, RawFile, DIRECT_IO_ALIGNMENT};
