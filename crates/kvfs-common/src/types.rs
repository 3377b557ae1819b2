//! Core type definitions for kvfs
//!
//! This module defines the identifiers and mode helpers shared by the
//! store layer and the entry tree.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// File type bits of a mode word (POSIX `S_IF*` layout)
pub mod mode {
    /// Mask selecting the file type bits
    pub const S_IFMT: u32 = 0o170_000;
    /// Directory
    pub const S_IFDIR: u32 = 0o040_000;
    /// Regular file
    pub const S_IFREG: u32 = 0o100_000;
    /// Symbolic link
    pub const S_IFLNK: u32 = 0o120_000;
    /// Mask selecting the permission bits
    pub const PERM_MASK: u32 = 0o7777;
}

/// 128-bit identifier naming one filesystem object's stored records
///
/// Assigned once at creation and never reused. The root directory and the
/// superblock both use the all-zero identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct InodeId(Uuid);

impl InodeId {
    /// The all-zero inode of the root directory
    pub const ROOT: Self = Self(Uuid::nil());

    /// Generate a new random inode
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes (as stored in keys and records)
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Check whether this is the all-zero root inode
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }

    /// 64-bit inode number reported through `stat`
    #[must_use]
    pub fn ino(&self) -> u64 {
        let b = self.as_bytes();
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl Default for InodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeId({})", hex::encode(self.as_bytes()))
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

/// Kind of a filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

impl EntryKind {
    /// Decode the kind from the type bits of a mode word
    #[must_use]
    pub const fn from_mode(mode: u32) -> Option<Self> {
        match mode & mode::S_IFMT {
            mode::S_IFDIR => Some(Self::Directory),
            mode::S_IFREG => Some(Self::File),
            mode::S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    /// Type bits for this kind
    #[must_use]
    pub const fn type_bits(self) -> u32 {
        match self {
            Self::Directory => mode::S_IFDIR,
            Self::File => mode::S_IFREG,
            Self::Symlink => mode::S_IFLNK,
        }
    }

    /// Combine this kind with permission bits into a full mode word
    #[must_use]
    pub const fn with_perm(self, perm: u32) -> u32 {
        self.type_bits() | (perm & mode::PERM_MASK)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::File => write!(f, "file"),
            Self::Symlink => write!(f, "symlink"),
        }
    }
}

/// Current wall-clock time as unix nanoseconds
#[must_use]
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_generation() {
        let a = InodeId::new();
        let b = InodeId::new();
        assert_ne!(a, b);
        assert!(!a.is_root());
        assert!(InodeId::ROOT.is_root());
        assert_eq!(InodeId::ROOT.ino(), 0);
    }

    #[test]
    fn test_inode_bytes_roundtrip() {
        let inode = InodeId::new();
        let copy = InodeId::from_bytes(*inode.as_bytes());
        assert_eq!(inode, copy);
        assert_eq!(inode.to_string().len(), 32);
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(EntryKind::from_mode(0o040_755), Some(EntryKind::Directory));
        assert_eq!(EntryKind::from_mode(0o100_644), Some(EntryKind::File));
        assert_eq!(EntryKind::from_mode(0o120_777), Some(EntryKind::Symlink));
        assert_eq!(EntryKind::from_mode(0o010_644), None);
        assert_eq!(EntryKind::File.with_perm(0o644), 0o100_644);
        assert_eq!(EntryKind::Directory.with_perm(0o170_755), 0o040_755);
    }
}
