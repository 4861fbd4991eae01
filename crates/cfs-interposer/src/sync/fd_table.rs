//! Descriptor table: which open descriptors refer to in-tree objects.
//!
//! Sharded by `fd % SHARDS`, each shard behind its own `RwLock`, so threads
//! working on unrelated descriptors rarely meet on the same lock. Entries are
//! reference-counted because dup'ed descriptors share one identity.

use libc::c_int;
use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

const SHARDS: usize = 64;

/// Identity of a tracked descriptor, fixed when it was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEntry {
    /// Canonical path the descriptor was opened with.
    pub path: PathBuf,
    /// `open(2)` flags.
    pub flags: c_int,
    pub dev: u64,
    pub ino: u64,
    pub is_dir: bool,
}

impl FdEntry {
    /// Build an entry from the object behind `fd`.
    pub fn from_fd(fd: c_int, path: PathBuf, flags: c_int) -> Option<Self> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return None;
        }
        Some(Self {
            path,
            flags,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            is_dir: (st.st_mode & libc::S_IFMT) == libc::S_IFDIR,
        })
    }

    /// True if `fd` is open and still refers to the same object.
    pub fn matches_fd(&self, fd: c_int) -> bool {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let open = unsafe { libc::fstat(fd, &mut st) } == 0;
        open && st.st_dev as u64 == self.dev && st.st_ino as u64 == self.ino
    }
}

/// FNV-style hasher for descriptor keys. Avoids `RandomState`, which would
/// pull entropy during early process initialization.
#[derive(Default)]
pub struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    fn write_i32(&mut self, i: i32) {
        self.0 = i as u32 as u64;
    }
}

type FdMap = HashMap<c_int, Arc<FdEntry>, BuildHasherDefault<IdentityHasher>>;
type Shard = RwLock<FdMap>;

/// Write lock on one shard, as returned by [`FdTable::lock_all`].
pub type ShardGuard<'a> = RwLockWriteGuard<'a, FdMap>;

pub struct FdTable {
    shards: Box<[Shard]>,
    len: AtomicUsize,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Shard::default()).collect(),
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, fd: c_int) -> &Shard {
        &self.shards[(fd as u32 as usize) % SHARDS]
    }

    fn write_shard(&self, fd: c_int) -> ShardGuard<'_> {
        self.shard(fd).write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, fd: c_int, entry: Arc<FdEntry>) -> Option<Arc<FdEntry>> {
        let old = self.write_shard(fd).insert(fd, entry);
        if old.is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        old
    }

    // Lookups always take the shard lock: `len` is only a hint and may lag an
    // insert that another thread has already published in its shard.
    pub fn get(&self, fd: c_int) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        self.shard(fd)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fd)
            .cloned()
    }

    pub fn remove(&self, fd: c_int) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let old = self.write_shard(fd).remove(&fd);
        if old.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        old
    }

    /// Make `new_fd` share `old_fd`'s identity, as `dup2(old_fd, new_fd)` does.
    /// If `old_fd` is untracked, any stale entry for `new_fd` is dropped.
    pub fn duplicate(&self, old_fd: c_int, new_fd: c_int) -> bool {
        if old_fd == new_fd {
            return self.get(old_fd).is_some();
        }
        match self.get(old_fd) {
            Some(entry) => {
                self.insert(new_fd, entry);
                true
            }
            None => {
                self.remove(new_fd);
                false
            }
        }
    }

    /// Re-point entries after a successful rename of `from` to `to`.
    ///
    /// Entries at or below `from` move under `to`; when `to` is `None` the
    /// object left the build tree and its entries are dropped.
    pub fn rename_prefix(&self, from: &Path, to: Option<&Path>) {
        for shard in self.shards.iter() {
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            let affected: Vec<c_int> = map
                .iter()
                .filter(|(_, e)| e.path.starts_with(from))
                .map(|(fd, _)| *fd)
                .collect();
            for fd in affected {
                let Some(old) = map.remove(&fd) else { continue };
                match to {
                    Some(to) => {
                        let rest = old.path.strip_prefix(from).unwrap_or(Path::new(""));
                        let mut moved = (*old).clone();
                        moved.path = if rest.as_os_str().is_empty() {
                            to.to_path_buf()
                        } else {
                            to.join(rest)
                        };
                        map.insert(fd, Arc::new(moved));
                    }
                    None => {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
        }
    }

    /// All entries, ordered by descriptor.
    pub fn snapshot(&self) -> Vec<(c_int, Arc<FdEntry>)> {
        let mut out: Vec<(c_int, Arc<FdEntry>)> = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let map = shard.read().unwrap_or_else(PoisonError::into_inner);
            out.extend(map.iter().map(|(fd, e)| (*fd, e.clone())));
        }
        out.sort_by_key(|(fd, _)| *fd);
        out
    }

    /// Take every shard's write lock, in shard order.
    ///
    /// Held across `fork` so the child never inherits a lock owned by a thread
    /// that does not exist there.
    pub fn lock_all(&self) -> Vec<ShardGuard<'_>> {
        self.shards
            .iter()
            .map(|s| s.write().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}
