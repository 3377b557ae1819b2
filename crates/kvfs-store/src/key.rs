//! Store key encoding
//!
//! Every record lives under a binary key:
//!
//! ```text
//! +-----+------------------+-------------------+
//! | tag |  inode (16 B)    | block index (4 B) |
//! +-----+------------------+-------------------+
//!                            ^ absent on metadata keys
//! ```
//!
//! Tags are `d` (directory), `f` (file), `s` (symlink) and `m` (superblock).
//! The block index is big-endian so byte order equals numeric order. A
//! metadata key is a strict prefix of the keys of its own data blocks and
//! therefore sorts right before block 0.

use kvfs_common::{EntryKind, Error, InodeId, Result};
use std::cmp::Ordering;
use std::fmt;

/// Length of a metadata key (tag + inode)
pub const METADATA_KEY_LEN: usize = 17;

/// Length of a data block key (tag + inode + block index)
pub const BLOCK_KEY_LEN: usize = 21;

/// Record type encoded in the first key byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    Directory,
    File,
    Symlink,
    Superblock,
}

impl KeyType {
    /// Tag byte
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Directory => b'd',
            Self::File => b'f',
            Self::Symlink => b's',
            Self::Superblock => b'm',
        }
    }

    /// Parse a tag byte
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'd' => Some(Self::Directory),
            b'f' => Some(Self::File),
            b's' => Some(Self::Symlink),
            b'm' => Some(Self::Superblock),
            _ => None,
        }
    }
}

impl From<EntryKind> for KeyType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Directory => Self::Directory,
            EntryKind::File => Self::File,
            EntryKind::Symlink => Self::Symlink,
        }
    }
}

/// Key of one stored record: an entry's metadata, one file block, or the
/// superblock
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    key_type: KeyType,
    inode: InodeId,
    block: Option<u32>,
}

impl BlockKey {
    /// Metadata key of an entry of the given kind
    #[must_use]
    pub fn metadata(kind: EntryKind, inode: InodeId) -> Self {
        Self {
            key_type: kind.into(),
            inode,
            block: None,
        }
    }

    /// Key of data block `index` of a file
    #[must_use]
    pub const fn block(inode: InodeId, index: u32) -> Self {
        Self {
            key_type: KeyType::File,
            inode,
            block: Some(index),
        }
    }

    /// Key of the singleton superblock record
    #[must_use]
    pub const fn superblock() -> Self {
        Self {
            key_type: KeyType::Superblock,
            inode: InodeId::ROOT,
            block: None,
        }
    }

    /// Record type
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Inode this key belongs to
    #[must_use]
    pub const fn inode(&self) -> InodeId {
        self.inode
    }

    /// Block index, `None` for metadata and superblock keys
    #[must_use]
    pub const fn block_index(&self) -> Option<u32> {
        self.block
    }

    /// True for keys without a block index
    #[must_use]
    pub const fn is_metadata(&self) -> bool {
        self.block.is_none()
    }

    /// Encode to the on-store byte form
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(BLOCK_KEY_LEN);
        key.push(self.key_type.tag());
        key.extend_from_slice(self.inode.as_bytes());
        if let Some(index) = self.block {
            key.extend_from_slice(&index.to_be_bytes()); // Big-endian for sorting
        }
        key
    }

    /// Decode from the on-store byte form
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != METADATA_KEY_LEN && bytes.len() != BLOCK_KEY_LEN {
            return Err(Error::corrupt(
                hex::encode(bytes),
                format!("key length {}", bytes.len()),
            ));
        }
        let key_type = KeyType::from_tag(bytes[0])
            .ok_or_else(|| Error::corrupt(hex::encode(bytes), "unknown key tag"))?;
        let mut inode = [0u8; 16];
        inode.copy_from_slice(&bytes[1..METADATA_KEY_LEN]);
        let block = if bytes.len() == BLOCK_KEY_LEN {
            let mut index = [0u8; 4];
            index.copy_from_slice(&bytes[METADATA_KEY_LEN..]);
            Some(u32::from_be_bytes(index))
        } else {
            None
        };
        if block.is_some() && key_type != KeyType::File {
            return Err(Error::corrupt(
                hex::encode(bytes),
                "block index on a non-file key",
            ));
        }
        Ok(Self {
            key_type,
            inode: InodeId::from_bytes(inode),
            block,
        })
    }
}

impl Ord for BlockKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type
            .tag()
            .cmp(&other.key_type.tag())
            .then_with(|| self.inode.as_bytes().cmp(other.inode.as_bytes()))
            .then_with(|| self.block.cmp(&other.block))
    }
}

impl PartialOrd for BlockKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKey({self})")
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.key_type.tag() as char, self.inode)?;
        if let Some(index) = self.block {
            write!(f, ":{index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let inode = InodeId::from_bytes([7u8; 16]);
        let meta = BlockKey::metadata(EntryKind::File, inode).encode();
        assert_eq!(meta.len(), METADATA_KEY_LEN);
        assert_eq!(meta[0], b'f');
        assert_eq!(&meta[1..], &[7u8; 16]);

        let block = BlockKey::block(inode, 0x0102_0304).encode();
        assert_eq!(block.len(), BLOCK_KEY_LEN);
        assert_eq!(&block[17..], &[1, 2, 3, 4]);

        let sb = BlockKey::superblock().encode();
        assert_eq!(sb[0], b'm');
        assert_eq!(&sb[1..], &[0u8; 16]);
    }

    #[test]
    fn test_metadata_key_precedes_block_zero() {
        let inode = InodeId::new();
        let meta = BlockKey::metadata(EntryKind::File, inode);
        let first = BlockKey::block(inode, 0);
        assert_ne!(meta, first);
        assert!(meta < first);
        assert!(meta.encode() < first.encode());
        assert!(first.encode().starts_with(&meta.encode()));
    }

    #[test]
    fn test_order_matches_encoding() {
        let a = InodeId::from_bytes([1u8; 16]);
        let b = InodeId::from_bytes([2u8; 16]);
        let mut keys = vec![
            BlockKey::block(b, 3),
            BlockKey::metadata(EntryKind::Symlink, a),
            BlockKey::block(a, 256),
            BlockKey::superblock(),
            BlockKey::metadata(EntryKind::Directory, b),
            BlockKey::block(a, 1),
            BlockKey::metadata(EntryKind::File, a),
            BlockKey::block(b, 0),
            BlockKey::metadata(EntryKind::File, b),
        ];
        let mut encoded: Vec<Vec<u8>> = keys.iter().map(BlockKey::encode).collect();
        keys.sort();
        encoded.sort();
        let resorted: Vec<Vec<u8>> = keys.iter().map(BlockKey::encode).collect();
        assert_eq!(resorted, encoded);
    }

    #[test]
    fn test_blocks_of_one_inode_are_contiguous() {
        let a = InodeId::from_bytes([1u8; 16]);
        let b = InodeId::from_bytes([2u8; 16]);
        let mut keys: Vec<BlockKey> = (0..4)
            .flat_map(|i| [BlockKey::block(a, i * 300), BlockKey::block(b, i * 300)])
            .collect();
        keys.push(BlockKey::metadata(EntryKind::File, a));
        keys.sort();
        let inodes: Vec<InodeId> = keys.iter().map(BlockKey::inode).collect();
        assert!(inodes[..5].iter().all(|i| *i == a));
        assert!(inodes[5..].iter().all(|i| *i == b));
    }

    #[test]
    fn test_decode_roundtrip_and_rejects() {
        let key = BlockKey::block(InodeId::new(), 42);
        assert_eq!(BlockKey::decode(&key.encode()).unwrap(), key);

        let meta = BlockKey::metadata(EntryKind::Directory, InodeId::new());
        assert_eq!(BlockKey::decode(&meta.encode()).unwrap(), meta);

        assert!(BlockKey::decode(&[b'd'; 5]).is_err());

        let mut bad_tag = meta.encode();
        bad_tag[0] = b'x';
        assert!(BlockKey::decode(&bad_tag).is_err());

        let mut dir_block = meta.encode();
        dir_block.extend_from_slice(&[0, 0, 0, 1]);
        assert!(BlockKey::decode(&dir_block).is_err());
    }
}
