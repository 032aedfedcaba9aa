//! Configuration types for BlockIO
//!
//! All values are fixed at cache construction; nothing here is mutable
//! at runtime.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a cached-I/O instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of block slots in the cache
    pub cache_capacity: usize,
    /// Bytes per block; must satisfy the direct-I/O alignment of the
    /// storage substrate (power of two, at least 512)
    pub block_size: usize,
    /// Maximum number of simultaneously open handles
    pub max_open_files: usize,
    /// Open files with direct I/O (O_DIRECT on Linux, F_NOCACHE on
    /// macOS). Disable for filesystems without direct-I/O support.
    pub direct_io: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 128,
            block_size: 4096,
            max_open_files: 128,
            direct_io: true,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    ///
    /// A zero-capacity cache would make insertion loop forever on
    /// eviction, so it is rejected here rather than handled later.
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(Error::configuration("cache_capacity must be at least 1"));
        }
        if self.max_open_files == 0 {
            return Err(Error::configuration("max_open_files must be at least 1"));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "block_size must be a power of two >= 512, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CacheConfig {
            cache_capacity: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_block_size_rejected() {
        for block_size in [0, 100, 1000, 4095] {
            let config = CacheConfig {
                block_size,
                ..CacheConfig::default()
            };
            assert!(config.validate().is_err(), "block_size {block_size}");
        }
    }

    #[test]
    fn test_zero_handle_table_rejected() {
        let config = CacheConfig {
            max_open_files: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
