//! In-memory entry tree
//!
//! Every directory owns its children through `Arc<Entry>`; nothing else holds
//! a strong reference for longer than one call. Each entry has its own lock
//! over its mutable state. Identity, kind, mode and symlink target never
//! change after creation and are readable without the lock, so a directory
//! can serialize its child list without touching any child lock.
//!
//! ```text
//!   "" (root, inode 0)
//!    ├── docs/        Directory
//!    │    └── a.txt   File      -> blocks f<inode>:0, :1, ...
//!    └── link         Symlink   -> "docs/a.txt"
//! ```

use crate::file::BlockSource;
use crate::record::{ChildRecord, EntryRecord, Stat};
use kvfs_common::{EntryKind, Error, InodeId, Result, mode, now_nanos};
use kvfs_store::{Batch, BlockKey};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Mutable state of an entry, guarded by the entry lock
#[derive(Debug, Default)]
pub struct EntryState {
    /// Last path segment
    pub name: String,
    pub stat: Stat,
    /// Children by name (directories only)
    pub children: BTreeMap<String, Arc<Entry>>,
    /// Set once the entry has been detached and its records deleted
    pub removed: bool,
}

impl EntryState {
    /// Insert a child under its own name
    pub fn insert_child(&mut self, name: &str, child: Arc<Entry>) -> Result<()> {
        if self.children.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.children.insert(name.to_string(), child);
        Ok(())
    }

    /// Refresh access and modification times
    pub fn touch(&mut self) {
        let now = now_nanos();
        self.stat.atime = now;
        self.stat.mtime = now;
    }
}

/// POSIX-stat-shaped attributes of an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    /// Number of 512-byte units
    pub blocks: u64,
    pub blksize: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub uid: u32,
    pub gid: u32,
}

impl FileStat {
    #[must_use]
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_mode(self.mode)
    }
}

/// One node of the tree
#[derive(Debug)]
pub struct Entry {
    inode: InodeId,
    kind: EntryKind,
    mode: u32,
    target: Option<String>,
    state: Mutex<EntryState>,
}

impl Entry {
    fn build(
        inode: InodeId,
        kind: EntryKind,
        perm: u32,
        target: Option<String>,
        name: &str,
        stat: Stat,
    ) -> Arc<Self> {
        Arc::new(Self {
            inode,
            kind,
            mode: kind.with_perm(perm),
            target,
            state: Mutex::new(EntryState {
                name: name.to_string(),
                stat,
                children: BTreeMap::new(),
                removed: false,
            }),
        })
    }

    /// Empty root directory
    #[must_use]
    pub fn root() -> Arc<Self> {
        Self::build(
            InodeId::ROOT,
            EntryKind::Directory,
            0o755,
            None,
            "",
            Stat::created(now_nanos()),
        )
    }

    /// New directory with a fresh inode
    #[must_use]
    pub fn new_directory(name: &str, perm: u32) -> Arc<Self> {
        Self::build(
            InodeId::new(),
            EntryKind::Directory,
            perm,
            None,
            name,
            Stat::created(now_nanos()),
        )
    }

    /// New empty file with a fresh inode
    #[must_use]
    pub fn new_file(name: &str, perm: u32) -> Arc<Self> {
        Self::build(
            InodeId::new(),
            EntryKind::File,
            perm,
            None,
            name,
            Stat::created(now_nanos()),
        )
    }

    /// New symlink; the target is not resolved
    #[must_use]
    pub fn new_symlink(name: &str, target: &str) -> Arc<Self> {
        let mut stat = Stat::created(now_nanos());
        stat.size = target.len() as u64;
        Self::build(
            InodeId::new(),
            EntryKind::Symlink,
            0o777,
            Some(target.to_string()),
            name,
            stat,
        )
    }

    /// Rebuild an entry listed in a directory record
    fn from_child_record(key: &BlockKey, child: &ChildRecord) -> Result<Arc<Self>> {
        let kind = EntryKind::from_mode(child.mode).ok_or_else(|| {
            Error::corrupt(
                key.to_string(),
                format!("child {:?} has unknown mode {:#o}", child.name, child.mode),
            )
        })?;
        if (kind == EntryKind::Symlink) != child.target.is_some() {
            return Err(Error::corrupt(
                key.to_string(),
                format!("child {:?} has inconsistent symlink target", child.name),
            ));
        }
        Ok(Self::build(
            child.inode(),
            kind,
            child.mode & mode::PERM_MASK,
            child.target.clone(),
            &child.name,
            Stat::default(),
        ))
    }

    #[must_use]
    pub const fn inode(&self) -> InodeId {
        self.inode
    }

    #[must_use]
    pub const fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Full mode word (type and permission bits)
    #[must_use]
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    /// Symlink target, `None` for other kinds
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Key of this entry's metadata record
    #[must_use]
    pub fn key(&self) -> BlockKey {
        BlockKey::metadata(self.kind, self.inode)
    }

    /// Lock the mutable state
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.lock().stat.size
    }

    /// Resolve a `/`-separated path relative to this entry
    ///
    /// Empty segments are skipped, so `""` and `"/"` both name this entry.
    /// Only one directory lock is held at a time.
    pub fn find(self: &Arc<Self>, path: &str) -> Result<Arc<Self>> {
        let mut current = Arc::clone(self);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = current.lock().children.get(segment).cloned();
            current = next.ok_or_else(|| Error::not_found(path))?;
        }
        Ok(current)
    }

    /// Look up a direct child
    pub fn child(&self, name: &str) -> Option<Arc<Self>> {
        self.lock().children.get(name).cloned()
    }

    /// Attach a child under its current name; does not persist
    pub fn add_child(&self, child: Arc<Self>) -> Result<()> {
        if !self.is_dir() {
            return Err(Error::NotADirectory(self.name()));
        }
        let name = child.name();
        self.lock().insert_child(&name, child)
    }

    /// Detach a child; does not persist
    pub fn remove_child(&self, name: &str) -> Result<Arc<Self>> {
        self.lock()
            .children
            .remove(name)
            .ok_or_else(|| Error::not_found(name))
    }

    /// Load this entry and its whole subtree from storage
    ///
    /// Any missing or undecodable record below aborts the load; children are
    /// only attached once every record has been read.
    pub fn read(self: &Arc<Self>, source: &dyn BlockSource) -> Result<()> {
        let mut loaded: Vec<(Arc<Self>, EntryRecord, Vec<Arc<Self>>)> = Vec::new();
        let mut seen = HashSet::from([self.inode]);
        let mut pending = vec![Arc::clone(self)];

        while let Some(entry) = pending.pop() {
            let key = entry.key();
            let data = source
                .fetch(&key)?
                .ok_or_else(|| Error::corrupt(key.to_string(), "record missing"))?;
            let record = EntryRecord::from_bytes(&key, &data)?;
            if record.mode != entry.mode {
                return Err(Error::corrupt(
                    key.to_string(),
                    format!("mode {:#o} does not match {:#o}", record.mode, entry.mode),
                ));
            }
            if !entry.is_dir() && !record.children.is_empty() {
                return Err(Error::corrupt(key.to_string(), "children on a non-directory"));
            }

            let mut children = Vec::with_capacity(record.children.len());
            let mut names = HashSet::with_capacity(record.children.len());
            for child_record in &record.children {
                if !names.insert(child_record.name.as_str()) {
                    return Err(Error::corrupt(
                        key.to_string(),
                        format!("name {:?} listed twice", child_record.name),
                    ));
                }
                let child = Self::from_child_record(&key, child_record)?;
                if !seen.insert(child.inode) {
                    return Err(Error::corrupt(
                        key.to_string(),
                        format!("inode {} listed twice", child.inode),
                    ));
                }
                pending.push(Arc::clone(&child));
                children.push(child);
            }
            loaded.push((entry, record, children));
        }

        let count = loaded.len();
        for (entry, record, children) in loaded {
            let mut state = entry.lock();
            state.stat = record.stat();
            state.children.clear();
            for child in children {
                let name = child.name();
                state.insert_child(&name, child)?;
            }
        }
        debug!("Loaded {} entries under {}", count, self.inode);
        Ok(())
    }

    /// Refresh times and queue this entry's record
    pub fn write(&self, batch: &mut Batch) -> Result<()> {
        let mut state = self.lock();
        self.write_locked(&mut state, batch)
    }

    /// [`Entry::write`] for a caller already holding the lock
    pub fn write_locked(&self, state: &mut EntryState, batch: &mut Batch) -> Result<()> {
        state.touch();
        let record = self.record(state);
        batch.put(self.key(), record.to_bytes()?);
        Ok(())
    }

    fn record(&self, state: &EntryState) -> EntryRecord {
        let children = state
            .children
            .iter()
            .map(|(name, child)| ChildRecord {
                mode: child.mode,
                inode: *child.inode.as_bytes(),
                name: name.clone(),
                target: child.target.clone(),
            })
            .collect();
        EntryRecord {
            mode: self.mode,
            size: state.stat.size,
            atime: state.stat.atime,
            mtime: state.stat.mtime,
            ctime: state.stat.ctime,
            uid: state.stat.uid,
            gid: state.stat.gid,
            target: self.target.clone(),
            children,
        }
    }

    /// Attributes in stat form
    #[must_use]
    pub fn fillstat(&self, block_size: u32) -> FileStat {
        let stat = self.lock().stat;
        FileStat {
            ino: self.inode.ino(),
            mode: self.mode,
            nlink: if self.is_dir() { 2 } else { 1 },
            size: stat.size,
            blocks: stat.size.div_ceil(512),
            blksize: block_size,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            uid: stat.uid,
            gid: stat.gid,
        }
    }

    /// Queue deletion of everything stored for this entry
    ///
    /// Files drop their data blocks and record; directories and symlinks
    /// only their record. A directory's children must already be detached.
    pub fn remove(&self, state: &EntryState, block_size: u32, batch: &mut Batch) {
        if self.kind == EntryKind::File {
            self.remove_blocks(state, block_size, batch);
        }
        batch.delete(self.key());
    }
}

/// Locks over several entries, taken in ascending inode order
pub struct LockSet<'a> {
    guards: Vec<(InodeId, MutexGuard<'a, EntryState>)>,
}

impl<'a> LockSet<'a> {
    /// Lock every distinct entry once, lowest inode first
    pub fn lock(entries: &[&'a Arc<Entry>]) -> Self {
        let mut sorted: Vec<&'a Arc<Entry>> = entries.to_vec();
        sorted.sort_by_key(|e| e.inode);
        sorted.dedup_by_key(|e| e.inode);
        Self {
            guards: sorted.into_iter().map(|e| (e.inode, e.lock())).collect(),
        }
    }

    /// State of a locked entry
    ///
    /// # Panics
    ///
    /// Panics if the entry is not part of this set.
    pub fn get(&mut self, entry: &Entry) -> &mut EntryState {
        let pos = self
            .guards
            .iter()
            .position(|(inode, _)| *inode == entry.inode)
            .unwrap_or_else(|| panic!("entry {} not in lock set", entry.inode));
        &mut self.guards[pos].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kvfs_store::Action;
    use std::collections::HashMap;

    /// Record source over a plain map
    #[derive(Default)]
    struct MapSource {
        data: HashMap<BlockKey, Bytes>,
    }

    impl MapSource {
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
            4096
        }
    }

    fn sample_tree() -> Arc<Entry> {
        let root = Entry::root();
        let docs = Entry::new_directory("docs", 0o750);
        docs.add_child(Entry::new_file("a.txt", 0o644)).unwrap();
        docs.add_child(Entry::new_directory("empty", 0o700)).unwrap();
        root.add_child(docs).unwrap();
        root.add_child(Entry::new_symlink("link", "docs/a.txt")).unwrap();
        root
    }

    fn persist(entry: &Arc<Entry>, batch: &mut Batch) {
        entry.write(batch).unwrap();
        let children: Vec<Arc<Entry>> = entry.lock().children.values().cloned().collect();
        for child in children {
            persist(&child, batch);
        }
    }

    #[test]
    fn test_find() {
        let root = sample_tree();
        assert!(Arc::ptr_eq(&root.find("").unwrap(), &root));
        assert!(Arc::ptr_eq(&root.find("/").unwrap(), &root));
        let a = root.find("docs/a.txt").unwrap();
        assert_eq!(a.kind(), EntryKind::File);
        assert!(Arc::ptr_eq(&root.find("//docs///a.txt/").unwrap(), &a));
        assert!(root.find("docs/missing").unwrap_err().is_not_found());
        assert!(root.find("docs/a.txt/deeper").unwrap_err().is_not_found());
        assert!(root.find("link/a.txt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_child_collision() {
        let root = sample_tree();
        let err = root.add_child(Entry::new_file("docs", 0o644)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        let file = root.find("docs/a.txt").unwrap();
        assert!(matches!(
            file.add_child(Entry::new_file("x", 0o644)),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_remove_child() {
        let root = sample_tree();
        let docs = root.find("docs").unwrap();
        let removed = docs.remove_child("empty").unwrap();
        assert_eq!(removed.name(), "empty");
        assert!(docs.remove_child("empty").unwrap_err().is_not_found());
        assert_eq!(docs.lock().children.len(), 1);
    }

    #[test]
    fn test_tree_roundtrip() {
        let root = sample_tree();
        {
            let written = root.find("docs/a.txt").unwrap();
            let mut state = written.lock();
            state.stat.size = 12345;
            state.stat.ctime = 42;
            state.stat.uid = 1000;
            state.stat.gid = 100;
        }
        let mut batch = Batch::new();
        persist(&root, &mut batch);
        let mut source = MapSource::default();
        source.apply(batch);

        let loaded = Entry::root();
        loaded.read(&source).unwrap();

        let a = loaded.find("docs/a.txt").unwrap();
        let written = root.find("docs/a.txt").unwrap();
        assert_eq!(a.inode(), written.inode());
        assert_eq!(a.mode(), 0o100_644);
        let (got, want) = (a.lock().stat, written.lock().stat);
        assert_eq!(got.size, 12345);
        assert_eq!(
            (got.ctime, got.uid, got.gid),
            (want.ctime, want.uid, want.gid)
        );
        assert_eq!((got.uid, got.gid, got.ctime), (1000, 100, 42));

        assert_eq!(loaded.find("docs").unwrap().mode(), 0o040_750);
        assert_eq!(loaded.find("link").unwrap().target(), Some("docs/a.txt"));
        assert!(loaded.find("docs/empty").unwrap().is_dir());

        for dir in ["", "docs"] {
            let expected: Vec<String> = root
                .find(dir)
                .unwrap()
                .lock()
                .children
                .keys()
                .cloned()
                .collect();
            let listed = loaded.find(dir).unwrap();
            let state = listed.lock();
            assert_eq!(state.children.keys().cloned().collect::<Vec<_>>(), expected);
            for (name, child) in &state.children {
                assert_eq!(&child.name(), name);
            }
        }
    }

    #[test]
    fn test_read_duplicate_child_name_is_corrupt() {
        let root = Entry::root();
        root.add_child(Entry::new_file("dup", 0o644)).unwrap();
        root.add_child(Entry::new_file("other", 0o644)).unwrap();
        let mut batch = Batch::new();
        persist(&root, &mut batch);
        let mut source = MapSource::default();
        source.apply(batch);

        // Both children keep valid records; only the listing repeats a name
        let key = root.key();
        let mut record = EntryRecord::from_bytes(&key, &source.data[&key]).unwrap();
        record.children[1].name = "dup".into();
        source
            .data
            .insert(key, Bytes::from(record.to_bytes().unwrap()));

        let loaded = Entry::root();
        assert!(matches!(
            loaded.read(&source),
            Err(Error::CorruptMetadata { .. })
        ));
        assert!(loaded.lock().children.is_empty());
    }

    #[test]
    fn test_read_missing_child_is_corrupt() {
        let root = sample_tree();
        let mut batch = Batch::new();
        persist(&root, &mut batch);
        let mut source = MapSource::default();
        source.apply(batch);
        source.data.remove(&root.find("docs/empty").unwrap().key());

        let loaded = Entry::root();
        let err = loaded.read(&source).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata { .. }));
        // Nothing was attached
        assert!(loaded.lock().children.is_empty());
    }

    #[test]
    fn test_read_unknown_child_mode_is_corrupt() {
        let root = Entry::root();
        let record = EntryRecord {
            mode: root.mode(),
            children: vec![ChildRecord {
                mode: 0o010_644,
                inode: *InodeId::new().as_bytes(),
                name: "fifo".into(),
                target: None,
            }],
            ..EntryRecord::default()
        };
        let mut source = MapSource::default();
        source
            .data
            .insert(root.key(), Bytes::from(record.to_bytes().unwrap()));
        assert!(matches!(
            root.read(&source),
            Err(Error::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn test_write_refreshes_times() {
        let file = Entry::new_file("f", 0o600);
        file.lock().stat.mtime = 1;
        let mut batch = Batch::new();
        file.write(&mut batch).unwrap();
        assert!(file.lock().stat.mtime > 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.as_slice()[0].key, file.key());
    }

    #[test]
    fn test_fillstat() {
        let root = sample_tree();
        let file = root.find("docs/a.txt").unwrap();
        file.lock().stat.size = 1025;
        let st = file.fillstat(4096);
        assert_eq!(st.nlink, 1);
        assert_eq!(st.blocks, 3);
        assert_eq!(st.blksize, 4096);
        assert_eq!(st.kind(), Some(EntryKind::File));
        assert_eq!(st.ino, file.inode().ino());

        let st = root.fillstat(4096);
        assert_eq!(st.nlink, 2);
        assert_eq!(st.ino, 0);
        assert_eq!(st.blocks, 0);
    }

    #[test]
    fn test_remove_dispatch() {
        let dir = Entry::new_directory("d", 0o755);
        let mut batch = Batch::new();
        dir.remove(&dir.lock(), 4096, &mut batch);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.as_slice()[0].key, dir.key());

        let file = Entry::new_file("f", 0o644);
        file.lock().stat.size = 4097;
        let mut batch = Batch::new();
        file.remove(&file.lock(), 4096, &mut batch);
        // Two data blocks plus the record
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_lock_set_orders_and_dedups() {
        let a = Entry::new_file("a", 0o644);
        let b = Entry::new_file("b", 0o644);
        let mut set = LockSet::lock(&[&b, &a, &b]);
        assert_eq!(set.guards.len(), 2);
        assert!(set.guards[0].0 < set.guards[1].0);
        set.get(&a).stat.size = 7;
        drop(set);
        assert_eq!(a.size(), 7);
    }

    #[test]
    fn test_concurrent_add_child() {
        let root = Entry::root();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let root = Arc::clone(&root);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        root.add_child(Entry::new_file(&format!("f-{t}-{i}"), 0o644))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(root.lock().children.len(), 400);
        assert!(root.find("f-7-49").is_ok());
    }

    #[test]
    fn test_concurrent_add_same_name() {
        let root = Entry::root();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let root = Arc::clone(&root);
                std::thread::spawn(move || root.add_child(Entry::new_file("same", 0o644)).is_ok())
            })
            .collect();
        let wins = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }
}
