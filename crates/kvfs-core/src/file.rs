//! File block I/O
//!
//! File content is cut into fixed-size blocks stored under
//! `f<inode><block index>`. The last block of a file may be short; blocks
//! are never padded past the bytes that were written into them.
//!
//! ```text
//! offset:   0          bs         2bs        3bs
//!           |  block 0  |  block 1  |  block 2  |
//! write:          [=====|===========|==]
//!                 ^ patched          ^ patched, tail kept
//! ```

use crate::entry::{Entry, EntryState};
use bytes::Bytes;
use kvfs_common::{EntryKind, Error, Result};
use kvfs_store::{Batch, BlockKey};

/// Read access to stored records and blocks, including buffered writes
pub trait BlockSource {
    /// Current value of a key
    fn fetch(&self, key: &BlockKey) -> Result<Option<Bytes>>;

    /// Block size of the filesystem
    fn block_size(&self) -> u32;
}

fn block_index(offset: u64, block_size: u64) -> Result<u32> {
    u32::try_from(offset / block_size)
        .map_err(|_| Error::invalid_argument(format!("offset {offset} beyond maximum file size")))
}

impl Entry {
    fn ensure_file(&self) -> Result<()> {
        match self.kind() {
            EntryKind::File => Ok(()),
            EntryKind::Directory => Err(Error::IsADirectory(self.inode().to_string())),
            EntryKind::Symlink => Err(Error::invalid_argument(format!(
                "{} is a symlink",
                self.inode()
            ))),
        }
    }

    /// Write `data` at `offset`, queueing block Puts into `batch`
    ///
    /// Partial blocks are merged with their current content. The record is
    /// queued as well when the file grows. Returns the number of bytes
    /// written.
    pub fn write_buf(
        &self,
        state: &mut EntryState,
        source: &dyn BlockSource,
        batch: &mut Batch,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        self.ensure_file()?;
        if data.is_empty() {
            return Ok(0);
        }
        let bs = u64::from(source.block_size());
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::invalid_argument("write range overflows"))?;
        block_index(end - 1, bs)?;

        let mut pos = offset;
        while pos < end {
            let index = block_index(pos, bs)?;
            let within = (pos % bs) as usize;
            let chunk = (bs - pos % bs).min(end - pos) as usize;
            let src = &data[(pos - offset) as usize..(pos - offset) as usize + chunk];
            let key = BlockKey::block(self.inode(), index);

            if within == 0 && chunk as u64 == bs {
                batch.put(key, Bytes::copy_from_slice(src));
            } else {
                // Keep existing bytes before and after the patched range
                let existing = if within > 0 || pos + (chunk as u64) < state.stat.size {
                    source.fetch(&key)?
                } else {
                    None
                };
                let mut block = existing.map(|b| b.to_vec()).unwrap_or_default();
                if block.len() < within + chunk {
                    block.resize(within + chunk, 0);
                }
                block[within..within + chunk].copy_from_slice(src);
                batch.put(key, block);
            }
            pos += chunk as u64;
        }

        if end > state.stat.size {
            state.stat.size = end;
            self.write_locked(state, batch)?;
        } else {
            state.touch();
        }
        Ok(data.len())
    }

    /// Read into `buf` from `offset`
    ///
    /// Stops at the end of the file, at the end of `buf`, or at the first
    /// block that is missing or too short. Returns the number of bytes read.
    pub fn read_buf(
        &self,
        state: &EntryState,
        source: &dyn BlockSource,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        self.ensure_file()?;
        let size = state.stat.size;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let bs = u64::from(source.block_size());
        let end = size.min(offset.saturating_add(buf.len() as u64));

        let mut pos = offset;
        let mut read = 0usize;
        while pos < end {
            let within = (pos % bs) as usize;
            let want = (bs - pos % bs).min(end - pos) as usize;
            let key = BlockKey::block(self.inode(), block_index(pos, bs)?);
            let Some(block) = source.fetch(&key)? else {
                break;
            };
            let available = block.len().saturating_sub(within).min(want);
            if available > 0 {
                buf[read..read + available].copy_from_slice(&block[within..within + available]);
                read += available;
            }
            if available < want {
                break;
            }
            pos += want as u64;
        }
        Ok(read)
    }

    /// Shrink the file to `new_size`; growing is a no-op
    pub fn truncate(
        &self,
        state: &mut EntryState,
        source: &dyn BlockSource,
        batch: &mut Batch,
        new_size: u64,
    ) -> Result<()> {
        self.ensure_file()?;
        let size = state.stat.size;
        if new_size >= size {
            return Ok(());
        }
        let bs = u64::from(source.block_size());

        let cut = (new_size % bs) as usize;
        if cut != 0 {
            let key = BlockKey::block(self.inode(), block_index(new_size, bs)?);
            if let Some(block) = source.fetch(&key)? {
                if block.len() > cut {
                    batch.put(key, block.slice(..cut));
                }
            }
        }

        let first_dropped = new_size.div_ceil(bs);
        let last = (size - 1) / bs;
        for index in first_dropped..=last {
            batch.delete(BlockKey::block(self.inode(), block_index(index * bs, bs)?));
        }

        state.stat.size = new_size;
        self.write_locked(state, batch)
    }

    /// Queue deletion of every data block covering the file size
    pub fn remove_blocks(&self, state: &EntryState, block_size: u32, batch: &mut Batch) {
        let size = state.stat.size;
        if size == 0 {
            return;
        }
        let last = (size - 1) / u64::from(block_size);
        for index in 0..=last {
            // Sizes are bounded by block_index() on every write
            if let Ok(index) = u32::try_from(index) {
                batch.delete(BlockKey::block(self.inode(), index));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvfs_store::Action;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    struct MapSource {
        block_size: u32,
        data: HashMap<BlockKey, Bytes>,
    }

    impl MapSource {
        fn new(block_size: u32) -> Self {
            Self {
                block_size,
                data: HashMap::new(),
            }
        }

        fn apply(&mut self, batch: Batch) {
            for op in batch {
                match op.action {
                    Action::Put(v) => {
                        self.data.insert(op.key, v);
                    }
                    Action::Delete => {
                        self.data.remove(&op.key);
                    }
                }
            }
        }
    }

    impl BlockSource for MapSource {
        fn fetch(&self, key: &BlockKey) -> Result<Option<Bytes>> {
            Ok(self.data.get(key).cloned())
        }

        fn block_size(&self) -> u32 {
            self.block_size
        }
    }

    fn write(file: &Entry, source: &mut MapSource, data: &[u8], offset: u64) -> usize {
        let mut batch = Batch::new();
        let n = file
            .write_buf(&mut file.lock(), &*source, &mut batch, data, offset)
            .unwrap();
        source.apply(batch);
        n
    }

    fn read_all(file: &Entry, source: &MapSource) -> Vec<u8> {
        let mut buf = vec![0u8; file.size() as usize];
        let n = file.read_buf(&file.lock(), source, &mut buf, 0).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_write_spanning_blocks() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        assert_eq!(write(&file, &mut source, b"abcdefghij", 0), 10);
        assert_eq!(file.size(), 10);

        let block = |i| source.data[&BlockKey::block(file.inode(), i)].clone();
        assert_eq!(&block(0)[..], b"abcd");
        assert_eq!(&block(1)[..], b"efgh");
        assert_eq!(&block(2)[..], b"ij");
        assert!(source.data.contains_key(&file.key()));
    }

    #[test]
    fn test_unaligned_write_keeps_surrounding_bytes() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        write(&file, &mut source, b"0123456789", 0);
        write(&file, &mut source, b"XYZ", 3);
        assert_eq!(read_all(&file, &source), b"012XYZ6789");

        // Trailing partial block inside the file keeps its tail
        write(&file, &mut source, b"ab", 8);
        assert_eq!(read_all(&file, &source), b"012XYZ67ab");
        assert_eq!(file.size(), 10);
    }

    #[test]
    fn test_overwrite_does_not_rewrite_record() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        write(&file, &mut source, b"01234567", 0);
        let mut batch = Batch::new();
        file.write_buf(&mut file.lock(), &source, &mut batch, b"zz", 2)
            .unwrap();
        assert!(batch.iter().all(|op| !op.key.is_metadata()));
    }

    #[test]
    fn test_write_past_end_zero_fills_block() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(8);
        write(&file, &mut source, b"ab", 0);
        write(&file, &mut source, b"cd", 5);
        assert_eq!(read_all(&file, &source), b"ab\0\0\0cd");
    }

    #[test]
    fn test_read_from_offset_and_bounded_by_buffer() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        write(&file, &mut source, b"abcdefghij", 0);

        let mut buf = [0u8; 5];
        let n = file.read_buf(&file.lock(), &source, &mut buf, 3).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"defgh");

        let mut buf = [0u8; 16];
        let n = file.read_buf(&file.lock(), &source, &mut buf, 7).unwrap();
        assert_eq!(&buf[..n], b"hij");

        assert_eq!(file.read_buf(&file.lock(), &source, &mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn test_read_stops_at_missing_block() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        write(&file, &mut source, b"abcdefghijkl", 0);
        source.data.remove(&BlockKey::block(file.inode(), 1));
        assert_eq!(read_all(&file, &source), b"abcd");
    }

    #[test]
    fn test_truncate_mid_block() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4096);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        write(&file, &mut source, &data, 0);
        assert_eq!(source.data.len(), 4);

        let mut batch = Batch::new();
        file.truncate(&mut file.lock(), &source, &mut batch, 5000)
            .unwrap();
        source.apply(batch);

        assert_eq!(file.size(), 5000);
        assert_eq!(source.data[&BlockKey::block(file.inode(), 0)].len(), 4096);
        assert_eq!(source.data[&BlockKey::block(file.inode(), 1)].len(), 904);
        assert!(!source.data.contains_key(&BlockKey::block(file.inode(), 2)));
        assert_eq!(read_all(&file, &source), &data[..5000]);
    }

    #[test]
    fn test_truncate_on_boundary_and_grow() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        write(&file, &mut source, b"abcdefghij", 0);

        let mut batch = Batch::new();
        file.truncate(&mut file.lock(), &source, &mut batch, 20)
            .unwrap();
        assert!(batch.is_empty());

        file.truncate(&mut file.lock(), &source, &mut batch, 4)
            .unwrap();
        source.apply(batch);
        assert_eq!(read_all(&file, &source), b"abcd");
        assert!(!source.data.contains_key(&BlockKey::block(file.inode(), 1)));
        assert!(!source.data.contains_key(&BlockKey::block(file.inode(), 2)));
    }

    #[test]
    fn test_remove_blocks() {
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(4);
        write(&file, &mut source, b"abcdefghi", 0);
        let mut batch = Batch::new();
        file.remove_blocks(&file.lock(), 4, &mut batch);
        assert_eq!(batch.len(), 3);
        source.apply(batch);
        assert_eq!(source.data.len(), 1);
    }

    #[test]
    fn test_directory_rejects_block_io() {
        let dir = Entry::new_directory("d", 0o755);
        let source = MapSource::new(4);
        let mut batch = Batch::new();
        let err = dir
            .write_buf(&mut dir.lock(), &source, &mut batch, b"x", 0)
            .unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)));
    }

    #[test]
    fn test_random_writes_match_model() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let file = Entry::new_file("f", 0o644);
        let mut source = MapSource::new(64);
        let mut model: Vec<u8> = Vec::new();

        for _ in 0..200 {
            // Writes start inside or at the end of the file so no holes appear
            let offset = rng.gen_range(0..=model.len());
            let len = rng.gen_range(1..300);
            let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            write(&file, &mut source, &data, offset as u64);
            if model.len() < offset + len {
                model.resize(offset + len, 0);
            }
            model[offset..offset + len].copy_from_slice(&data);
        }
        assert_eq!(file.size() as usize, model.len());
        assert_eq!(read_all(&file, &source), model);
    }
}
