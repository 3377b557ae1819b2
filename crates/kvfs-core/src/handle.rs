//! Open handle table
//!
//! Handle ids are small integers handed out smallest-unused-first. A handle
//! only holds a weak reference, so once its entry is unlinked from the tree
//! the handle is stale.

use crate::entry::Entry;
use kvfs_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

pub struct HandleTable {
    max_handles: usize,
    slots: Mutex<BTreeMap<u64, Weak<Entry>>>,
}

impl HandleTable {
    #[must_use]
    pub fn new(max_handles: usize) -> Self {
        Self {
            max_handles,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocate the smallest unused id for `entry`
    pub fn allocate(&self, entry: &Arc<Entry>) -> Result<u64> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.max_handles {
            return Err(Error::HandleLimit {
                max: self.max_handles,
            });
        }
        let mut id = 0u64;
        for used in slots.keys() {
            if *used != id {
                break;
            }
            id += 1;
        }
        slots.insert(id, Arc::downgrade(entry));
        Ok(id)
    }

    /// Entry behind a handle
    pub fn get(&self, id: u64) -> Result<Arc<Entry>> {
        self.slots
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(Error::StaleHandle(id))
    }

    /// Free a handle, returning its entry if it is still alive
    pub fn release(&self, id: u64) -> Result<Option<Arc<Entry>>> {
        self.slots
            .lock()
            .remove(&id)
            .map(|weak| weak.upgrade())
            .ok_or(Error::StaleHandle(id))
    }

    /// Number of allocated handles
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
