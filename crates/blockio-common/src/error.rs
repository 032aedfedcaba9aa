//! Error types for BlockIO
//!
//! This module defines the common error type used throughout the system.

use crate::types::Handle;
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for BlockIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlockIO
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("too many open files (max {max})")]
    TooManyOpenFiles { max: usize },

    #[error("bad handle: {0}")]
    BadHandle(Handle),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an open error for the given path
    pub fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Open {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a handle validation error
    #[must_use]
    pub fn is_bad_handle(&self) -> bool {
        matches!(self, Self::BadHandle(_))
    }

    /// Check if this error came from the storage substrate
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Open { .. })
    }
}
