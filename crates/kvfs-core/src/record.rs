//! Stored metadata records
//!
//! One bincode-encoded [`EntryRecord`] per entry, under the entry's metadata
//! key. A directory record lists its children with the immutable facts needed
//! to rebuild them (mode, inode, symlink target); names come from the
//! parent's child map.

use kvfs_common::{Error, InodeId, Result};
use kvfs_store::BlockKey;
use serde::{Deserialize, Serialize};

/// Mutable attributes of an entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub size: u64,
    /// Access time (unix nanoseconds)
    pub atime: u64,
    /// Modification time (unix nanoseconds)
    pub mtime: u64,
    /// Change time (unix nanoseconds)
    pub ctime: u64,
    pub uid: u32,
    pub gid: u32,
}

impl Stat {
    /// Attributes of a freshly created entry
    #[must_use]
    pub fn created(now: u64) -> Self {
        Self {
            atime: now,
            mtime: now,
            ctime: now,
            ..Self::default()
        }
    }
}

/// One child listed in a directory record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub mode: u32,
    pub inode: [u8; 16],
    pub name: String,
    pub target: Option<String>,
}

impl ChildRecord {
    #[must_use]
    pub fn inode(&self) -> InodeId {
        InodeId::from_bytes(self.inode)
    }
}

/// Serialized form of one entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub mode: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub uid: u32,
    pub gid: u32,
    pub target: Option<String>,
    pub children: Vec<ChildRecord>,
}

impl EntryRecord {
    /// Attributes carried by this record
    #[must_use]
    pub const fn stat(&self) -> Stat {
        Stat {
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            uid: self.uid,
            gid: self.gid,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::invalid_argument(format!("encode record: {e}")))
    }

    /// Decode a record read from `key`
    pub fn from_bytes(key: &BlockKey, data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::corrupt(key.to_string(), e.to_string()))
    }
}
