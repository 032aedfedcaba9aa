//! BlockIO Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, and configuration
//! structures shared by the BlockIO crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::CacheConfig;
pub use error::{Error, Result};
pub use types::{FileId, Handle, Whence};
