//! kvfs store layer - keys, write-back buckets and shard stores
//!
//! This crate maps filesystem records onto an ordered key-value store split
//! into independent shards, each fronted by a write-back [`Bucket`].

pub mod bucket;
pub mod key;
pub mod op;
pub mod partition;
pub mod store;
pub mod superblock;
pub mod tables;

// Re-exports
pub use bucket::{Bucket, BucketStats};
pub use key::{BlockKey, KeyType};
pub use op::{Action, Batch, Operation};
pub use partition::{METADATA_SHARD, Partitioner};
pub use store::{KvStore, MemoryOpener, MemoryStore, RedbOpener, RedbStore, StoreError, StoreOpener};
pub use superblock::Superblock;
