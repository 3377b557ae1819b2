//! Persistent shard stores.
//!
//! A [`KvStore`] is the ordered key-value contract every shard is bound to:
//! point reads plus atomic batched writes. [`RedbStore`] keeps one redb
//! database per shard; [`MemoryStore`] is the in-process variant used by
//! tests and tooling. Neither offers transactions across instances.

use crate::key::BlockKey;
use crate::op::{Action, Operation};
use crate::tables;
use bytes::Bytes;
use kvfs_common::{Error, Result};
use parking_lot::Mutex;
use redb::{Database, Durability};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Error type for redb-backed store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Ordered persistent key-value store bound to one shard
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &BlockKey) -> Result<Option<Bytes>>;

    /// Apply all operations atomically; with `sync` the call returns only
    /// once the write is durable
    fn write(&self, ops: &[Operation], sync: bool) -> Result<()>;
}

/// Opens the store of a given shard index
pub trait StoreOpener: Send + Sync {
    fn open(&self, shard: usize) -> Result<Arc<dyn KvStore>>;
}

/// Shard store backed by a redb database file
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::open_inner(path.as_ref())?)
    }

    fn open_inner(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::BLOCKS)?;
        }
        write_txn.commit()?;

        debug!("Opened shard store {:?}", path);
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_inner(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::BLOCKS)?;
        Ok(table.get(key)?.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn write_inner(&self, ops: &[Operation], sync: bool) -> StoreResult<()> {
        let mut write_txn = self.db.begin_write()?;
        if !sync {
            write_txn.set_durability(Durability::None);
        }
        {
            let mut table = write_txn.open_table(tables::BLOCKS)?;
            for op in ops {
                let key = op.key.encode();
                match &op.action {
                    Action::Put(value) => {
                        table.insert(key.as_slice(), value.as_ref())?;
                    }
                    Action::Delete => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        Ok(self.get_inner(&key.encode())?)
    }

    fn write(&self, ops: &[Operation], sync: bool) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        Ok(self.write_inner(ops, sync)?)
    }
}

/// Opens one redb file per shard inside a data directory
#[derive(Clone, Debug)]
pub struct RedbOpener {
    dir: PathBuf,
}

impl RedbOpener {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the database file of a shard
    #[must_use]
    pub fn shard_path(&self, shard: usize) -> PathBuf {
        self.dir.join(format!("shard-{shard:03}.redb"))
    }
}

impl StoreOpener for RedbOpener {
    fn open(&self, shard: usize) -> Result<Arc<dyn KvStore>> {
        let path = self.shard_path(shard);
        let store = RedbStore::open(&path)?;
        info!("Shard {} bound to {:?}", shard, path);
        Ok(Arc::new(store))
    }
}

/// In-memory ordered store
///
/// Counts committed writes and can be told to fail them, for exercising
/// durability and error paths.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    writes: AtomicU64,
    synced_writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed write calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of committed write calls that asked for durability
    pub fn synced_write_count(&self) -> u64 {
        self.synced_writes.load(Ordering::Relaxed)
    }

    /// Make subsequent writes fail without applying anything
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// All stored keys in store order
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.data.lock().keys().cloned().collect()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        Ok(self.data.lock().get(&key.encode()).cloned())
    }

    fn write(&self, ops: &[Operation], sync: bool) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::store("injected write failure"));
        }
        let mut data = self.data.lock();
        for op in ops {
            match &op.action {
                Action::Put(value) => {
                    data.insert(op.key.encode(), value.clone());
                }
                Action::Delete => {
                    data.remove(&op.key.encode());
                }
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        if sync {
            self.synced_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Hands out one [`MemoryStore`] per shard, returning the same instance when
/// a shard is reopened
#[derive(Default)]
pub struct MemoryOpener {
    stores: Mutex<HashMap<usize, Arc<MemoryStore>>>,
}

impl MemoryOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store of a shard, if it has been opened
    pub fn store(&self, shard: usize) -> Option<Arc<MemoryStore>> {
        self.stores.lock().get(&shard).cloned()
    }
}

impl StoreOpener for MemoryOpener {
    fn open(&self, shard: usize) -> Result<Arc<dyn KvStore>> {
        let store = Arc::clone(self.stores.lock().entry(shard).or_default());
        Ok(store)
    }
}
