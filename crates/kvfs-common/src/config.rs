//! Configuration types for kvfs
//!
//! Block size and partition count only matter at format time; once a
//! filesystem exists the values recorded in its superblock win.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default block size (4 KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024;

/// Default number of data partitions
pub const DEFAULT_PARTITIONS: u32 = 4;

/// Default maximum number of open handles
pub const DEFAULT_MAX_HANDLES: usize = 1_000_000;

/// Root configuration for a kvfs instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Directory holding one store file per shard
    pub data_dir: PathBuf,
    /// Block size used when formatting
    pub block_size: u32,
    /// Number of data partitions used when formatting (shard 0 is extra)
    pub partitions: u32,
    /// Interval of the background flush (milliseconds)
    pub flush_interval_ms: u64,
    /// Maximum number of simultaneously open handles
    pub max_handles: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/kvfs"),
            block_size: DEFAULT_BLOCK_SIZE,
            partitions: DEFAULT_PARTITIONS,
            flush_interval_ms: 1000,
            max_handles: DEFAULT_MAX_HANDLES,
        }
    }
}

impl FsConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Background flush interval
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Check the values a format would record
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Configuration("block_size must be positive".into()));
        }
        if self.partitions == 0 {
            return Err(Error::Configuration("partitions must be positive".into()));
        }
        if self.max_handles == 0 {
            return Err(Error::Configuration("max_handles must be positive".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Configuration(
                "flush_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
