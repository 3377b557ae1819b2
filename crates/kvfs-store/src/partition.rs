//! Key to shard routing
//!
//! Shard 0 holds every record without a block index: entry metadata and the
//! superblock. File data is spread over shards `1..=partitions` by hashing the
//! inode, so all blocks of one file land in the same shard.

use crate::key::BlockKey;
use kvfs_common::InodeId;

/// Shard holding metadata and the superblock
pub const METADATA_SHARD: usize = 0;

/// Deterministic BlockKey to shard mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partitioner {
    partitions: u32,
}

impl Partitioner {
    /// Create a partitioner over `partitions` data shards (minimum 1)
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    /// Number of data shards
    #[must_use]
    pub const fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Total shards including the metadata shard
    #[must_use]
    pub const fn shard_count(&self) -> usize {
        self.partitions as usize + 1
    }

    /// Shard a key is stored in
    #[must_use]
    pub fn partition(&self, key: &BlockKey) -> usize {
        if key.is_metadata() {
            METADATA_SHARD
        } else {
            self.data_shard(key.inode())
        }
    }

    /// Shard holding the data blocks of an inode
    #[must_use]
    pub fn data_shard(&self, inode: InodeId) -> usize {
        let hash = xxhash_rust::xxh64::xxh64(inode.as_bytes(), 0);
        1 + (hash % u64::from(self.partitions)) as usize
    }
}
