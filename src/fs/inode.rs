//! Inode table
//!
//! FUSE addresses files by inode number while the vault is addressed by
//! path. The table hands out inode numbers for virtual paths and keeps the
//! kernel's lookup count so entries can be dropped on `forget`. Attributes
//! are not cached here; every `getattr` stats the vault again.

use crate::vault::passthrough::EntryKind;
use crate::vault::VirtualPath;
use fuser::{FileAttr, FileType, FUSE_ROOT_ID};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

impl EntryKind {
    pub fn to_fuser_type(self) -> FileType {
        match self {
            EntryKind::RegularFile => FileType::RegularFile,
            EntryKind::Directory => FileType::Directory,
            EntryKind::Symlink => FileType::Symlink,
            EntryKind::BlockDevice => FileType::BlockDevice,
            EntryKind::CharDevice => FileType::CharDevice,
            EntryKind::Fifo => FileType::NamedPipe,
            EntryKind::Socket => FileType::Socket,
        }
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nsecs as u32)
    }
}

/// Build the attributes reported for `ino`, with `size` as the logical size
pub fn file_attr(ino: u64, meta: &Metadata, size: u64) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: EntryKind::from(meta.file_type()).to_fuser_type(),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

#[derive(Debug, Clone)]
struct InodeEntry {
    path: VirtualPath,
    lookups: u64,
}

/// Maps FUSE inode numbers to virtual paths
pub struct InodeTable {
    /// Next inode number
    next_ino: AtomicU64,
    /// ino -> entry
    inodes: RwLock<HashMap<u64, InodeEntry>>,
    /// path -> ino
    by_path: RwLock<HashMap<VirtualPath, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(FUSE_ROOT_ID + 1),
            inodes: RwLock::new(HashMap::new()),
            by_path: RwLock::new(HashMap::new()),
        };

        let root = VirtualPath::root();
        table.inodes.write().insert(
            FUSE_ROOT_ID,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        table.by_path.write().insert(root, FUSE_ROOT_ID);

        table
    }

    /// Inode already bound to `path`, if any
    ///
    /// Never allocates: entries only come from kernel lookups, which are
    /// balanced by `forget`.
    pub fn find(&self, path: &VirtualPath) -> Option<u64> {
        self.by_path.read().get(path).copied()
    }

    /// Inode for `path`, counting one kernel lookup
    pub fn lookup(&self, path: &VirtualPath) -> u64 {
        let mut by_path = self.by_path.write();
        let mut inodes = self.inodes.write();

        if let Some(&ino) = by_path.get(path) {
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inodes.insert(
            ino,
            InodeEntry {
                path: path.clone(),
                lookups: 1,
            },
        );
        by_path.insert(path.clone(), ino);
        ino
    }

    /// Virtual path currently bound to `ino`
    pub fn path(&self, ino: u64) -> Option<VirtualPath> {
        self.inodes.read().get(&ino).map(|e| e.path.clone())
    }

    pub fn exists(&self, ino: u64) -> bool {
        self.inodes.read().contains_key(&ino)
    }

    /// Drop `nlookup` kernel references; the entry goes away at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut by_path = self.by_path.write();
        let mut inodes = self.inodes.write();

        let remove = match inodes.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = inodes.remove(&ino) {
                if by_path.get(&entry.path) == Some(&ino) {
                    by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Unbind a removed path; the inode stays valid until forgotten
    pub fn unlink(&self, path: &VirtualPath) {
        self.by_path.write().remove(path);
    }

    /// Move `from` and everything below it to `to`
    pub fn rename(&self, from: &VirtualPath, to: &VirtualPath) {
        let mut by_path = self.by_path.write();
        let mut inodes = self.inodes.write();

        // Whatever was at the destination is replaced
        let replaced: Vec<VirtualPath> = by_path
            .keys()
            .filter(|p| p.starts_with(to))
            .cloned()
            .collect();
        for path in replaced {
            by_path.remove(&path);
        }

        let moved: Vec<(VirtualPath, u64)> = by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let Some(new) = old.rebase(from, to) else {
                continue;
            };
            by_path.remove(&old);
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.path = new.clone();
            }
            by_path.insert(new, ino);
        }
    }

    /// Number of live entries, root included
    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vp(p: &str) -> VirtualPath {
        VirtualPath::new(p).unwrap()
    }

    #[test]
    fn test_root_is_reserved() {
        let table = InodeTable::new();
        assert_eq!(table.path(FUSE_ROOT_ID), Some(VirtualPath::root()));
        assert_eq!(table.lookup(&VirtualPath::root()), FUSE_ROOT_ID);

        table.forget(FUSE_ROOT_ID, 100);
        assert!(table.exists(FUSE_ROOT_ID));
    }

    #[test]
    fn test_lookup_is_stable() {
        let table = InodeTable::new();
        let a = table.lookup(&vp("/a"));
        let b = table.lookup(&vp("/b"));

        assert_ne!(a, b);
        assert_ne!(a, FUSE_ROOT_ID);
        assert_eq!(table.lookup(&vp("/a")), a);
        assert_eq!(table.path(a), Some(vp("/a")));
    }

    #[test]
    fn test_find_does_not_allocate() {
        let table = InodeTable::new();
        assert_eq!(table.find(&vp("/a")), None);
        assert_eq!(table.len(), 1);

        let a = table.lookup(&vp("/a"));
        assert_eq!(table.find(&vp("/a")), Some(a));
        assert_eq!(table.find(&VirtualPath::root()), Some(FUSE_ROOT_ID));
    }

    #[test]
    fn test_forget_drops_at_zero() {
        let table = InodeTable::new();
        let a = table.lookup(&vp("/a"));
        table.lookup(&vp("/a"));

        table.forget(a, 1);
        assert!(table.exists(a));
        table.forget(a, 1);
        assert!(!table.exists(a));

        // A fresh lookup gets a fresh inode
        assert_ne!(table.lookup(&vp("/a")), a);
    }

    #[test]
    fn test_rename_moves_descendants() {
        let table = InodeTable::new();
        let dir = table.lookup(&vp("/d"));
        let child = table.lookup(&vp("/d/f"));
        let other = table.lookup(&vp("/dx"));

        table.rename(&vp("/d"), &vp("/e"));

        assert_eq!(table.path(dir), Some(vp("/e")));
        assert_eq!(table.path(child), Some(vp("/e/f")));
        assert_eq!(table.path(other), Some(vp("/dx")));
        assert_eq!(table.lookup(&vp("/e/f")), child);
    }

    #[test]
    fn test_rename_over_existing() {
        let table = InodeTable::new();
        let a = table.lookup(&vp("/a"));
        let b = table.lookup(&vp("/b"));

        table.rename(&vp("/a"), &vp("/b"));
        assert_eq!(table.lookup(&vp("/b")), a);
        // The replaced inode lives on until the kernel forgets it
        assert!(table.exists(b));
    }

    #[test]
    fn test_unlink_unbinds_path() {
        let table = InodeTable::new();
        let a = table.lookup(&vp("/a"));
        table.unlink(&vp("/a"));

        assert!(table.exists(a));
        assert_ne!(table.lookup(&vp("/a")), a);
    }

    #[test]
    fn test_file_attr() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"12345").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();

        let attr = file_attr(42, &meta, 3);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.uid, meta.uid());
        assert_eq!(attr.mtime, meta.modified().unwrap());
    }

    #[test]
    fn test_timestamp_before_epoch() {
        let t = timestamp(-1, 500_000_000);
        assert_eq!(
            UNIX_EPOCH.duration_since(t).unwrap(),
            Duration::from_millis(500)
        );
    }
}
