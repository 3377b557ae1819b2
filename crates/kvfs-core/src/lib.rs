//! kvfs core - entry tree and storage engine
//!
//! This crate implements the filesystem proper on top of `kvfs-store`:
//! - The in-memory entry tree (directories, files, symlinks)
//! - Block-addressed file I/O
//! - The storage engine (mount/format, write-back routing, sync, handles)
//! - Background flush scheduling
//! - Path-level namespace operations

pub mod engine;
pub mod entry;
pub mod file;
pub mod flush;
pub mod handle;
pub mod namespace;
pub mod record;

// Re-exports
pub use engine::{EngineStats, StorageEngine};
pub use entry::{Entry, EntryState, FileStat, LockSet};
pub use file::BlockSource;
pub use flush::{FlushTask, flush_loop};
pub use handle::HandleTable;
pub use namespace::{DirEntry, filename, find_parent};
pub use record::{ChildRecord, EntryRecord, Stat};
