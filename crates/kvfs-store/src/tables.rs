//! Redb table definitions for shard stores.

use redb::TableDefinition;

// Key: encoded BlockKey, Value: record or block bytes
pub const BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");
