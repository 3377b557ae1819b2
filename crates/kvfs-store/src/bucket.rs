//! Write-back bucket
//!
//! A bucket is one shard: an in-memory map of pending operations in front of
//! a persistent [`KvStore`].
//!
//! ```text
//!   add_op ──► pending (last write wins per key) ──flush──► KvStore
//!                 ▲                                            │
//!   read ─────────┴──── miss ─────────────────────────────────┘
//! ```
//!
//! A flush snapshots the pending operations it covers, commits them in one
//! durable write without holding the pending-map lock, and then retires only
//! the entries that were not replaced while the commit was running.

use crate::key::BlockKey;
use crate::op::{Action, Operation};
use crate::store::KvStore;
use bytes::Bytes;
use kvfs_common::{InodeId, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// A pending operation and the sequence number it was queued under
#[derive(Debug)]
struct PendingOp {
    seq: u64,
    op: Operation,
}

#[derive(Debug, Default)]
struct BucketState {
    pending: BTreeMap<BlockKey, PendingOp>,
    next_seq: u64,
    /// Set by add_op, cleared once a full flush leaves nothing pending
    dirty: bool,
}

/// Counters of a single bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Operations currently buffered
    pub pending_ops: usize,
    /// Value bytes committed by flushes
    pub bytes_written: u64,
    /// Completed non-empty flushes
    pub flushes: u64,
}

/// Write-back cache bound to one shard store
pub struct Bucket {
    index: usize,
    store: Arc<dyn KvStore>,
    state: Mutex<BucketState>,
    /// Serializes flushes of this bucket
    flush_lock: Mutex<()>,
    bytes_written: AtomicU64,
    flushes: AtomicU64,
}

impl Bucket {
    pub fn new(index: usize, store: Arc<dyn KvStore>) -> Self {
        Self {
            index,
            store,
            state: Mutex::new(BucketState::default()),
            flush_lock: Mutex::new(()),
            bytes_written: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Shard index of this bucket
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Read a key, preferring the pending operation over the store
    pub fn read(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        {
            let state = self.state.lock();
            if let Some(pending) = state.pending.get(key) {
                return Ok(match &pending.op.action {
                    Action::Put(value) => Some(value.clone()),
                    Action::Delete => None,
                });
            }
        }
        self.store.get(key)
    }

    /// Queue an operation, replacing any pending one for the same key
    pub fn add_op(&self, op: Operation) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.dirty = true;
        state.pending.insert(op.key, PendingOp { seq, op });
    }

    /// True while operations are buffered
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Number of buffered operations
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of buffered operations belonging to one inode
    pub fn pending_for(&self, inode: InodeId) -> usize {
        self.state
            .lock()
            .pending
            .keys()
            .filter(|k| k.inode() == inode)
            .count()
    }

    /// Commit pending operations durably
    ///
    /// With `Some(inode)` only that inode's operations are committed and the
    /// rest stay buffered. Returns the number of operations committed. If the
    /// store write fails nothing is retired.
    pub fn flush(&self, inode: Option<InodeId>) -> Result<usize> {
        let _flushing = self.flush_lock.lock();

        let snapshot: Vec<(u64, Operation)> = {
            let state = self.state.lock();
            state
                .pending
                .values()
                .filter(|p| inode.is_none_or(|i| p.op.key.inode() == i))
                .map(|p| (p.seq, p.op.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        let ops: Vec<Operation> = snapshot.iter().map(|(_, op)| op.clone()).collect();
        let bytes: u64 = ops.iter().map(|op| op.value_len() as u64).sum();
        if let Err(e) = self.store.write(&ops, true) {
            warn!("Bucket {} flush of {} ops failed: {}", self.index, ops.len(), e);
            return Err(e);
        }

        let mut state = self.state.lock();
        for (seq, op) in &snapshot {
            // Keep entries that were replaced while the commit was running
            if state.pending.get(&op.key).is_some_and(|p| p.seq == *seq) {
                state.pending.remove(&op.key);
            }
        }
        if state.pending.is_empty() {
            state.dirty = false;
        }
        drop(state);

        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Bucket {} flushed {} ops ({} bytes)",
            self.index,
            snapshot.len(),
            bytes
        );
        Ok(snapshot.len())
    }

    /// Commit everything that is pending
    pub fn flush_all(&self) -> Result<usize> {
        self.flush(None)
    }

    #[must_use]
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            pending_ops: self.pending_len(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("index", &self.index)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use kvfs_common::{EntryKind, Error};

    fn bucket() -> (Arc<MemoryStore>, Bucket) {
        let store = Arc::new(MemoryStore::new());
        let bucket = Bucket::new(1, store.clone());
        (store, bucket)
    }

    #[test]
    fn test_write_back_visibility() {
        let (store, bucket) = bucket();
        let inode = InodeId::new();
        let key = BlockKey::block(inode, 0);

        bucket.add_op(Operation::put(key, Bytes::from_static(b"X")));
        assert_eq!(bucket.read(&key).unwrap(), Some(Bytes::from_static(b"X")));
        assert!(store.get(&key).unwrap().is_none());

        bucket.flush_all().unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(Bytes::from_static(b"X")));
        assert!(!bucket.is_dirty());
        assert_eq!(store.synced_write_count(), 1);
    }

    #[test]
    fn test_pending_delete_hides_stored_value() {
        let (store, bucket) = bucket();
        let key = BlockKey::block(InodeId::new(), 3);
        store
            .write(&[Operation::put(key, Bytes::from_static(b"old"))], true)
            .unwrap();

        bucket.add_op(Operation::delete(key));
        assert!(bucket.read(&key).unwrap().is_none());
        assert!(store.get(&key).unwrap().is_some());

        bucket.flush_all().unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let (store, bucket) = bucket();
        let key = BlockKey::block(InodeId::new(), 0);
        bucket.add_op(Operation::put(key, Bytes::from_static(b"a")));
        bucket.add_op(Operation::put(key, Bytes::from_static(b"b")));
        assert_eq!(bucket.pending_len(), 1);
        assert_eq!(bucket.flush_all().unwrap(), 1);
        assert_eq!(store.get(&key).unwrap(), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn test_targeted_flush_keeps_other_inodes_pending() {
        let (store, bucket) = bucket();
        let a = InodeId::new();
        let b = InodeId::new();
        bucket.add_op(Operation::put(BlockKey::metadata(EntryKind::File, a), &b"ma"[..]));
        bucket.add_op(Operation::put(BlockKey::block(a, 0), &b"a0"[..]));
        bucket.add_op(Operation::put(BlockKey::block(b, 0), &b"b0"[..]));

        assert_eq!(bucket.flush(Some(a)).unwrap(), 2);
        assert_eq!(bucket.pending_for(a), 0);
        assert_eq!(bucket.pending_for(b), 1);
        assert!(bucket.is_dirty());
        assert!(store.get(&BlockKey::block(a, 0)).unwrap().is_some());
        assert!(store.get(&BlockKey::block(b, 0)).unwrap().is_none());
    }

    #[test]
    fn test_failed_flush_keeps_everything_pending() {
        let (store, bucket) = bucket();
        let key = BlockKey::block(InodeId::new(), 0);
        bucket.add_op(Operation::put(key, Bytes::from_static(b"v")));

        store.set_fail_writes(true);
        assert!(matches!(bucket.flush_all(), Err(Error::Store(_))));
        assert_eq!(bucket.pending_len(), 1);
        assert_eq!(bucket.stats().flushes, 0);

        store.set_fail_writes(false);
        assert_eq!(bucket.flush_all().unwrap(), 1);
        assert_eq!(bucket.stats().bytes_written, 1);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let (store, bucket) = bucket();
        assert_eq!(bucket.flush_all().unwrap(), 0);
        assert_eq!(store.write_count(), 0);
        assert_eq!(bucket.stats(), BucketStats::default());
    }

    #[test]
    fn test_concurrent_add_and_flush() {
        let (store, bucket) = bucket();
        let bucket = Arc::new(bucket);
        let inode = InodeId::new();

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let bucket = bucket.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let key = BlockKey::block(inode, t * 100 + i);
                        bucket.add_op(Operation::put(key, vec![t as u8; 8]));
                    }
                })
            })
            .collect();
        let flusher = {
            let bucket = bucket.clone();
            std::thread::spawn(move || {
                for _ in 0..20 {
                    bucket.flush_all().unwrap();
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        flusher.join().unwrap();
        bucket.flush_all().unwrap();

        assert_eq!(bucket.pending_len(), 0);
        assert_eq!(store.len(), 400);
    }
}
