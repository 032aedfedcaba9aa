//! Core type definitions for BlockIO
//!
//! This module defines the identifier types used throughout the system.
//! Handles and file identities are deliberately separate spaces: a
//! `Handle` names an open-file table entry, a `FileId` names the
//! underlying storage descriptor a cache slot belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque caller-visible identifier for an open file.
///
/// Handles are unique while open and carry no relationship to the
/// underlying descriptor numbering. A closed handle's value is never
/// reused by the same instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value (for logging and diagnostics only).
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal identity of an underlying storage descriptor.
///
/// Assigned monotonically at open time and never reused, so a cache
/// slot tagged with a stale `FileId` can never alias a newer file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(u64);

impl FileId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin for a seek operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    /// Offset is relative to the start of the file.
    Start,
    /// Offset is relative to the handle's current cursor.
    Current,
    /// Offset is relative to the current end of the file on storage.
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let h = Handle::from_raw(42);
        assert_eq!(h.as_raw(), 42);
        assert_eq!(format!("{h}"), "42");
        assert_eq!(format!("{h:?}"), "Handle(42)");
    }

    #[test]
    fn test_file_id_distinct_from_handle() {
        // Same raw value, different identifier spaces.
        let h = Handle::from_raw(7);
        let f = FileId::from_raw(7);
        assert_eq!(h.as_raw(), f.as_raw());
        assert_eq!(format!("{f:?}"), "FileId(7)");
    }
}
