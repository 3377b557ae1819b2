//! Superblock record
//!
//! Layout (little-endian):
//! ```text
//! +----------+---------+------------+------------+------------+--------+
//! | magic 8B | ver 4B  | block 4B   | parts 4B   | created 8B | crc 4B |
//! +----------+---------+------------+------------+------------+--------+
//! ```
//! The CRC32C covers every byte before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kvfs_common::{Error, Result, now_nanos};

/// Magic number for the kvfs format
pub const MAGIC: [u8; 8] = *b"KVFSSUPR";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Encoded superblock size
pub const SUPERBLOCK_SIZE: usize = 32;

const SUPERBLOCK_KEY: &str = "superblock";

/// Filesystem geometry recorded at format time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    /// Size of every file data block in bytes
    pub block_size: u32,
    /// Number of data partitions
    pub partitions: u32,
    /// Format time (unix nanoseconds)
    pub created_at: u64,
}

impl Superblock {
    #[must_use]
    pub fn new(block_size: u32, partitions: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_size,
            partitions,
            created_at: now_nanos(),
        }
    }

    /// True when both records describe the same geometry
    #[must_use]
    pub const fn same_geometry(&self, other: &Self) -> bool {
        self.block_size == other.block_size && self.partitions == other.partitions
    }

    /// Serialize superblock to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.partitions);
        buf.put_u64_le(self.created_at);
        let checksum = crc32c::crc32c(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Parse and validate a superblock
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != SUPERBLOCK_SIZE {
            return Err(Error::corrupt(
                SUPERBLOCK_KEY,
                format!("superblock is {} bytes", data.len()),
            ));
        }

        let (body, mut tail) = data.split_at(SUPERBLOCK_SIZE - 4);
        let stored = tail.get_u32_le();
        let computed = crc32c::crc32c(body);
        if stored != computed {
            return Err(Error::corrupt(
                SUPERBLOCK_KEY,
                format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            ));
        }

        let mut buf = body;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corrupt(SUPERBLOCK_KEY, "invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(
                SUPERBLOCK_KEY,
                format!("unsupported format version: {version}"),
            ));
        }

        let block_size = buf.get_u32_le();
        let partitions = buf.get_u32_le();
        let created_at = buf.get_u64_le();
        if block_size == 0 {
            return Err(Error::corrupt(SUPERBLOCK_KEY, "block size is zero"));
        }
        if partitions == 0 {
            return Err(Error::corrupt(SUPERBLOCK_KEY, "partition count is zero"));
        }

        Ok(Self {
            version,
            block_size,
            partitions,
            created_at,
        })
    }
}
