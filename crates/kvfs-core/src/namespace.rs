//! Path-level filesystem operations
//!
//! These are the calls an OS adapter makes. Paths are relative to the root;
//! a leading `/` is optional. Each mutating call builds one [`Batch`] while
//! holding the locks of the entries it changes, queues it before releasing
//! them, and flushes the touched shards afterwards when the call is
//! metadata-changing.

use crate::engine::StorageEngine;
use crate::entry::{Entry, EntryState, FileStat, LockSet};
use crate::file::BlockSource;
use kvfs_common::{EntryKind, Error, Result, now_nanos};
use kvfs_store::Batch;
use std::sync::Arc;
use tracing::debug;

/// One line of a directory listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Last segment of a path, empty for the root
#[must_use]
pub fn filename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map_or(trimmed, |pos| &trimmed[pos + 1..])
}

/// Path of the directory containing `path`
#[must_use]
pub fn find_parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map_or("", |pos| &trimmed[..pos])
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn same_entry(a: Option<&Arc<Entry>>, b: Option<&Arc<Entry>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl StorageEngine {
    /// Directory and final name of a path that must not be the root
    fn lookup_parent<'p>(&self, path: &'p str) -> Result<(Arc<Entry>, &'p str)> {
        let name = filename(path);
        if name.is_empty() {
            return Err(Error::invalid_argument(format!("{path:?} names the root")));
        }
        if name == "." || name == ".." {
            return Err(Error::invalid_argument(format!("invalid name {name:?}")));
        }
        let parent_path = find_parent(path);
        let parent = self.root().find(parent_path)?;
        if !parent.is_dir() {
            return Err(Error::NotADirectory(parent_path.to_string()));
        }
        Ok((parent, name))
    }

    /// Attach a new entry at `path` and persist it with its parent
    fn link_new(&self, path: &str, make: impl FnOnce(&str) -> Arc<Entry>) -> Result<Arc<Entry>> {
        let (parent, name) = self.lookup_parent(path)?;
        let child = make(name);
        let mut batch = Batch::new();
        child.write(&mut batch)?;

        let touched = {
            let mut state = parent.lock();
            if state.removed {
                return Err(Error::not_found(find_parent(path)));
            }
            if state.children.contains_key(name) {
                return Err(Error::AlreadyExists(path.to_string()));
            }
            state.insert_child(name, Arc::clone(&child))?;
            parent.write_locked(&mut state, &mut batch)?;
            self.enqueue(batch)
        };
        self.flush_shards(&touched)?;
        debug!("Created {} {:?} ({})", child.kind(), path, child.inode());
        Ok(child)
    }

    /// Attributes of the entry at `path`
    pub fn getattr(&self, path: &str) -> Result<FileStat> {
        Ok(self.root().find(path)?.fillstat(self.block_size()))
    }

    /// Create a directory
    pub fn mkdir(&self, path: &str, perm: u32) -> Result<FileStat> {
        let dir = self.link_new(path, |name| Entry::new_directory(name, perm))?;
        Ok(dir.fillstat(self.block_size()))
    }

    /// Create an empty file and open it
    pub fn create(&self, path: &str, perm: u32) -> Result<u64> {
        let file = self.link_new(path, |name| Entry::new_file(name, perm))?;
        self.allocate_handle(&file)
    }

    /// Create a symlink at `path` pointing to `target`; the target need not
    /// exist
    pub fn symlink(&self, target: &str, path: &str) -> Result<FileStat> {
        if target.is_empty() {
            return Err(Error::invalid_argument("empty symlink target"));
        }
        let link = self.link_new(path, |name| Entry::new_symlink(name, target))?;
        Ok(link.fillstat(self.block_size()))
    }

    /// Target of the symlink at `path`
    pub fn readlink(&self, path: &str) -> Result<String> {
        let entry = self.root().find(path)?;
        entry
            .target()
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_argument(format!("{path:?} is not a symlink")))
    }

    /// Open any entry
    pub fn open(&self, path: &str) -> Result<u64> {
        let entry = self.root().find(path)?;
        self.allocate_handle(&entry)
    }

    /// Open a directory
    pub fn opendir(&self, path: &str) -> Result<u64> {
        let entry = self.root().find(path)?;
        if !entry.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        self.allocate_handle(&entry)
    }

    /// Close a handle, syncing its entry
    pub fn release(&self, fh: u64) -> Result<()> {
        self.release_handle(fh)
    }

    /// List a directory: `.`, `..`, then children by name
    pub fn readdir(&self, fh: u64) -> Result<Vec<DirEntry>> {
        let dir = self.find_handle(fh)?;
        if !dir.is_dir() {
            return Err(Error::NotADirectory(dir.name()));
        }
        let state = dir.lock();
        let mut entries = Vec::with_capacity(state.children.len() + 2);
        for dot in [".", ".."] {
            entries.push(DirEntry {
                name: dot.to_string(),
                kind: EntryKind::Directory,
            });
        }
        entries.extend(state.children.iter().map(|(name, child)| DirEntry {
            name: name.clone(),
            kind: child.kind(),
        }));
        Ok(entries)
    }

    /// Read up to `size` bytes at `offset`
    pub fn read_at(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let file = self.find_handle(fh)?;
        let state = file.lock();
        let remaining = state.stat.size.saturating_sub(offset);
        let mut buf = vec![0u8; size.min(usize::try_from(remaining).unwrap_or(usize::MAX))];
        let n = file.read_buf(&state, self, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` at `offset`; buffered until the next flush or sync
    pub fn write_at(&self, fh: u64, data: &[u8], offset: u64) -> Result<usize> {
        let file = self.find_handle(fh)?;
        let mut state = file.lock();
        if state.removed {
            return Err(Error::StaleHandle(fh));
        }
        let mut batch = Batch::new();
        let n = file.write_buf(&mut state, self, &mut batch, data, offset)?;
        self.enqueue(batch);
        Ok(n)
    }

    /// Shrink the file at `path`
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let file = self.root().find(path)?;
        let touched = {
            let mut state = file.lock();
            if state.removed {
                return Err(Error::not_found(path));
            }
            let mut batch = Batch::new();
            file.truncate(&mut state, self, &mut batch, size)?;
            self.enqueue(batch)
        };
        self.flush_shards(&touched)
    }

    /// Durably commit everything buffered for a handle's entry
    pub fn fsync(&self, fh: u64) -> Result<()> {
        let entry = self.find_handle(fh)?;
        self.sync(&entry)
    }

    /// Remove a file or symlink
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.remove_path(path, |entry, _| {
            if entry.is_dir() {
                Err(Error::IsADirectory(path.to_string()))
            } else {
                Ok(())
            }
        })
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.remove_path(path, |entry, state| {
            if !entry.is_dir() {
                Err(Error::NotADirectory(path.to_string()))
            } else if !state.children.is_empty() {
                Err(Error::NotEmpty(path.to_string()))
            } else {
                Ok(())
            }
        })
    }

    fn remove_path(
        &self,
        path: &str,
        check: impl Fn(&Entry, &EntryState) -> Result<()>,
    ) -> Result<()> {
        let (parent, name) = self.lookup_parent(path)?;
        let block_size = self.block_size();
        loop {
            let child = parent.child(name).ok_or_else(|| Error::not_found(path))?;
            let touched = {
                let mut locks = LockSet::lock(&[&parent, &child]);
                if !same_entry(locks.get(&parent).children.get(name), Some(&child)) {
                    // Replaced while unlocked
                    continue;
                }
                let state = locks.get(&child);
                check(&child, state)?;
                state.removed = true;
                let mut batch = Batch::new();
                child.remove(state, block_size, &mut batch);

                let parent_state = locks.get(&parent);
                parent_state.children.remove(name);
                parent.write_locked(parent_state, &mut batch)?;
                self.enqueue(batch)
            };
            self.flush_shards(&touched)?;
            debug!("Removed {:?} ({})", path, child.inode());
            return Ok(());
        }
    }

    /// Move `from` to `to`, replacing a file or empty directory at `to`
    ///
    /// Renames are serialized on the engine rename lock so the ancestry of
    /// every directory is stable while one is checked and applied.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _renaming = self.lock_renames();
        let (src_parent, src_name) = self.lookup_parent(from)?;
        let (dst_parent, dst_name) = self.lookup_parent(to)?;
        let from_segments = segments(from);
        let to_segments = segments(to);
        if from_segments == to_segments {
            self.root().find(from)?;
            return Ok(());
        }
        if to_segments.starts_with(&from_segments) {
            return Err(Error::invalid_argument(format!(
                "cannot move {from:?} into itself"
            )));
        }
        self.move_entry(from, to, (&src_parent, src_name), (&dst_parent, dst_name))
    }

    /// Fail if `entry` is one of the directories leading to `path`
    fn ensure_not_on_path(&self, entry: &Arc<Entry>, path: &str) -> Result<()> {
        let mut current = Arc::clone(self.root());
        for segment in segments(path) {
            let Some(next) = current.child(segment) else {
                return Ok(());
            };
            if Arc::ptr_eq(&next, entry) {
                return Err(Error::invalid_argument(format!(
                    "{path:?} is inside the entry being moved"
                )));
            }
            current = next;
        }
        Ok(())
    }

    /// Relink a child between two resolved directories; the caller holds
    /// the rename lock
    fn move_entry(
        &self,
        from: &str,
        to: &str,
        (src_parent, src_name): (&Arc<Entry>, &str),
        (dst_parent, dst_name): (&Arc<Entry>, &str),
    ) -> Result<()> {
        let block_size = self.block_size();
        loop {
            let src = src_parent
                .child(src_name)
                .ok_or_else(|| Error::not_found(from))?;
            if src.is_dir() {
                self.ensure_not_on_path(&src, find_parent(to))?;
            }
            let dst = dst_parent.child(dst_name);
            if let Some(dst) = &dst {
                match (src.is_dir(), dst.is_dir()) {
                    (true, false) => return Err(Error::NotADirectory(to.to_string())),
                    (false, true) => return Err(Error::IsADirectory(to.to_string())),
                    _ => {}
                }
            }

            let mut involved = vec![src_parent, dst_parent, &src];
            involved.extend(dst.as_ref());
            let touched = {
                let mut locks = LockSet::lock(&involved);
                if locks.get(dst_parent).removed {
                    return Err(Error::not_found(find_parent(to)));
                }
                if !same_entry(locks.get(src_parent).children.get(src_name), Some(&src))
                    || !same_entry(locks.get(dst_parent).children.get(dst_name), dst.as_ref())
                {
                    continue;
                }

                let mut batch = Batch::new();
                if let Some(dst) = &dst {
                    let state = locks.get(dst);
                    if !state.children.is_empty() {
                        return Err(Error::NotEmpty(to.to_string()));
                    }
                    state.removed = true;
                    dst.remove(state, block_size, &mut batch);
                }

                locks.get(src_parent).children.remove(src_name);
                locks
                    .get(dst_parent)
                    .children
                    .insert(dst_name.to_string(), Arc::clone(&src));

                let state = locks.get(&src);
                state.name = dst_name.to_string();
                state.stat.ctime = now_nanos();
                src.write_locked(state, &mut batch)?;
                src_parent.write_locked(locks.get(src_parent), &mut batch)?;
                if !Arc::ptr_eq(src_parent, dst_parent) {
                    dst_parent.write_locked(locks.get(dst_parent), &mut batch)?;
                }
                self.enqueue(batch)
            };
            self.flush_shards(&touched)?;
            debug!("Renamed {:?} -> {:?}", from, to);
            return Ok(());
        }
    }

    /// Change owner ids; `None` leaves an id unchanged
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let entry = self.root().find(path)?;
        self.chown_entry(&entry, path, uid, gid)
    }

    fn chown_entry(
        &self,
        entry: &Entry,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        let mut state = entry.lock();
        if state.removed {
            return Err(Error::not_found(path));
        }
        if let Some(uid) = uid {
            state.stat.uid = uid;
        }
        if let Some(gid) = gid {
            state.stat.gid = gid;
        }
        state.stat.ctime = now_nanos();
        let mut batch = Batch::new();
        entry.write_locked(&mut state, &mut batch)?;
        self.enqueue(batch);
        Ok(())
    }
}
