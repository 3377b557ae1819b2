//! Storage engine
//!
//! Owns the root of the entry tree, one [`Bucket`] per shard and the handle
//! table. Every mutation reaches the buckets as a [`Batch`] through
//! [`StorageEngine::write`]:
//!
//! ```text
//!   Batch ──► Partitioner ──► Bucket[0]  (metadata, superblock) ──► shard-000
//!                        ├──► Bucket[1]  (file data)            ──► shard-001
//!                        └──► Bucket[N]                         ──► shard-00N
//! ```
//!
//! A batch touching several shards is committed shard by shard; there is no
//! cross-shard atomicity.

use crate::entry::Entry;
use crate::file::BlockSource;
use crate::handle::HandleTable;
use crate::record::EntryRecord;
use bytes::Bytes;
use kvfs_common::{EntryKind, Error, FsConfig, Result, now_nanos};
use kvfs_store::{
    Batch, BlockKey, Bucket, BucketStats, KvStore, METADATA_SHARD, Operation, Partitioner,
    RedbOpener, StoreOpener, Superblock,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Aggregate engine counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Per-shard counters, indexed by shard
    pub buckets: Vec<BucketStats>,
    pub pending_ops: usize,
    pub bytes_written: u64,
    pub flushes: u64,
    pub open_handles: usize,
}

/// Top-level filesystem state
pub struct StorageEngine {
    root: Arc<Entry>,
    buckets: Vec<Bucket>,
    partitioner: Partitioner,
    superblock: Superblock,
    handles: HandleTable,
    /// Serializes renames so no two can race into a cycle
    rename_lock: Mutex<()>,
}

impl StorageEngine {
    /// Mount the redb stores under `config.data_dir`
    pub fn open_redb(config: &FsConfig) -> Result<Self> {
        Self::mount(&RedbOpener::new(&config.data_dir), config)
    }

    /// Format the redb stores under `config.data_dir` and mount them
    pub fn format_redb(config: &FsConfig) -> Result<Self> {
        Self::format(&RedbOpener::new(&config.data_dir), config)
    }

    fn read_superblock(store: &dyn KvStore) -> Result<Option<Superblock>> {
        store
            .get(&BlockKey::superblock())?
            .map(|data| Superblock::from_bytes(&data))
            .transpose()
    }

    fn open_buckets(
        opener: &dyn StoreOpener,
        shard0: Arc<dyn KvStore>,
        partitioner: Partitioner,
    ) -> Result<Vec<Bucket>> {
        let mut buckets = Vec::with_capacity(partitioner.shard_count());
        buckets.push(Bucket::new(METADATA_SHARD, shard0));
        for shard in 1..partitioner.shard_count() {
            buckets.push(Bucket::new(shard, opener.open(shard)?));
        }
        Ok(buckets)
    }

    /// Mount a formatted filesystem
    ///
    /// Fails if the superblock is missing or invalid, or if any record of
    /// the tree cannot be loaded.
    pub fn mount(opener: &dyn StoreOpener, config: &FsConfig) -> Result<Self> {
        config.validate()?;
        let shard0 = opener.open(METADATA_SHARD)?;
        let superblock = Self::read_superblock(shard0.as_ref())?
            .ok_or_else(|| Error::not_found("superblock (store is not formatted)"))?;
        let partitioner = Partitioner::new(superblock.partitions);
        let buckets = Self::open_buckets(opener, shard0, partitioner)?;

        let engine = Self {
            root: Entry::root(),
            buckets,
            partitioner,
            superblock,
            handles: HandleTable::new(config.max_handles),
            rename_lock: Mutex::new(()),
        };
        engine.root.read(&engine)?;

        info!(
            "Mounted kvfs: block_size={}, partitions={}, shards={}",
            superblock.block_size,
            superblock.partitions,
            partitioner.shard_count()
        );
        Ok(engine)
    }

    /// Format a store with the geometry in `config`, then mount it
    ///
    /// Reformatting with the same geometry keeps existing content; a
    /// different geometry fails with `AlreadyExists`.
    pub fn format(opener: &dyn StoreOpener, config: &FsConfig) -> Result<Self> {
        config.validate()?;
        let shard0 = opener.open(METADATA_SHARD)?;
        let requested = Superblock::new(config.block_size, config.partitions);

        match Self::read_superblock(shard0.as_ref())? {
            Some(existing) if !existing.same_geometry(&requested) => {
                return Err(Error::AlreadyExists(format!(
                    "store formatted with block_size={} partitions={}",
                    existing.block_size, existing.partitions
                )));
            }
            Some(_) => info!("Store already formatted, keeping existing superblock"),
            None => {
                shard0.write(
                    &[Operation::put(BlockKey::superblock(), requested.to_bytes())],
                    true,
                )?;
                info!(
                    "Formatted kvfs: block_size={}, partitions={}",
                    requested.block_size, requested.partitions
                );
            }
        }

        let root = Entry::root();
        if shard0.get(&root.key())?.is_none() {
            let now = now_nanos();
            let record = EntryRecord {
                mode: root.mode(),
                atime: now,
                mtime: now,
                ctime: now,
                ..EntryRecord::default()
            };
            shard0.write(&[Operation::put(root.key(), record.to_bytes()?)], true)?;
            debug!("Wrote empty root directory");
        }
        drop(shard0);

        Self::mount(opener, config)
    }

    /// Root of the entry tree
    #[must_use]
    pub const fn root(&self) -> &Arc<Entry> {
        &self.root
    }

    #[must_use]
    pub const fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub const fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Bucket of a shard
    #[must_use]
    pub fn bucket(&self, shard: usize) -> Option<&Bucket> {
        self.buckets.get(shard)
    }

    /// Queue a batch into its buckets, returning the touched shards
    pub(crate) fn enqueue(&self, batch: Batch) -> Vec<usize> {
        let mut touched = vec![false; self.buckets.len()];
        for op in batch {
            let shard = self.partitioner.partition(&op.key);
            touched[shard] = true;
            self.buckets[shard].add_op(op);
        }
        touched
            .iter()
            .enumerate()
            .filter_map(|(shard, t)| t.then_some(shard))
            .collect()
    }

    /// Fully flush the given shards
    pub(crate) fn flush_shards(&self, shards: &[usize]) -> Result<()> {
        for shard in shards {
            self.buckets[*shard].flush_all()?;
        }
        Ok(())
    }

    /// Route a batch to its buckets; with `sync` every touched shard is
    /// flushed before returning
    pub fn write(&self, batch: Batch, sync: bool) -> Result<()> {
        let touched = self.enqueue(batch);
        if sync {
            self.flush_shards(&touched)?;
        }
        Ok(())
    }

    /// Current value of a key, buffered writes included
    pub fn read(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        self.buckets[self.partitioner.partition(key)].read(key)
    }

    /// Durably commit the buffered operations of one entry
    pub fn sync(&self, entry: &Entry) -> Result<()> {
        let inode = entry.inode();
        self.buckets[METADATA_SHARD].flush(Some(inode))?;
        if entry.kind() == EntryKind::File {
            self.buckets[self.partitioner.data_shard(inode)].flush(Some(inode))?;
        }
        Ok(())
    }

    /// Hold the engine-wide rename lock
    pub(crate) fn lock_renames(&self) -> MutexGuard<'_, ()> {
        self.rename_lock.lock()
    }

    /// Allocate a handle for an entry
    pub fn allocate_handle(&self, entry: &Arc<Entry>) -> Result<u64> {
        self.handles.allocate(entry)
    }

    /// Entry behind a handle
    pub fn find_handle(&self, fh: u64) -> Result<Arc<Entry>> {
        self.handles.get(fh)
    }

    /// Free a handle, syncing its entry first if it still exists
    pub fn release_handle(&self, fh: u64) -> Result<()> {
        if let Some(entry) = self.handles.release(fh)? {
            self.sync(&entry)?;
        }
        Ok(())
    }

    /// Flush every bucket fully
    ///
    /// All buckets are attempted; the first failure is returned.
    pub fn flush_buckets(&self) -> Result<()> {
        let mut first_err = None;
        for bucket in &self.buckets {
            if let Err(e) = bucket.flush_all() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Final flush before the engine goes away
    pub fn umount(&self) -> Result<()> {
        self.flush_buckets()?;
        info!("Unmounted kvfs ({} handles open)", self.handles.len());
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let buckets: Vec<BucketStats> = self.buckets.iter().map(Bucket::stats).collect();
        EngineStats {
            pending_ops: buckets.iter().map(|b| b.pending_ops).sum(),
            bytes_written: buckets.iter().map(|b| b.bytes_written).sum(),
            flushes: buckets.iter().map(|b| b.flushes).sum(),
            open_handles: self.handles.len(),
            buckets,
        }
    }
}

impl BlockSource for StorageEngine {
    fn fetch(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        self.read(key)
    }

    fn block_size(&self) -> u32 {
        self.superblock.block_size
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("superblock", &self.superblock)
            .field("buckets", &self.buckets)
            .finish_non_exhaustive()
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if self.buckets.iter().any(Bucket::is_dirty) {
            warn!("Engine dropped with buffered writes, flushing");
            if let Err(e) = self.flush_buckets() {
                error!("Flush on drop failed: {}", e);
            }
        }
    }
}
