//! FUSE dispatcher
//!
//! Every request resolves its inode to a virtual path, maps that to the
//! vault, and then either forwards the call unchanged or hands it to
//! [`FileAccess`]. No file handles are kept: `open` only checks that the
//! file can be opened and every `read`/`write` reopens it.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{EINVAL, ENOENT, ERANGE};
use nix::sys::statvfs::Statvfs;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::inode::{file_attr, InodeTable};
use crate::error::{Error, Result};
use crate::vault::passthrough::{self, SetTime};
use crate::vault::{FileAccess, MountContext, PathMapper, VaultPath, VirtualPath};

const RENAME_NOREPLACE: u32 = 1;

/// Transparent-encryption FUSE filesystem over a vault directory
pub struct VaultFs {
    /// Key, root and creation policy
    context: MountContext,
    /// Virtual -> vault path translation
    mapper: PathMapper,
    /// Content transform
    access: FileAccess,
    /// Inode number <-> virtual path
    inodes: InodeTable,
    /// Kernel cache TTL for entries and attributes
    ttl: Duration,
}

fn os_error(code: i32) -> Error {
    Error::Io(io::Error::from_raw_os_error(code))
}

fn offset(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| os_error(EINVAL))
}

fn set_time(time: Option<TimeOrNow>) -> Option<SetTime> {
    time.map(|t| match t {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(at) => SetTime::At(at),
    })
}

/// Log a failed request and turn it into an errno
fn failed(op: &str, e: &Error) -> i32 {
    match e {
        Error::Decryption(_) | Error::Encryption(_) | Error::Store(_) | Error::Internal(_) => {
            error!("{} failed: {}", op, e);
        }
        _ => {
            debug!("{} failed: {}", op, e);
        }
    }
    e.to_errno()
}

/// Answer a getxattr/listxattr size probe or data request
fn reply_xattr(data: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(ERANGE);
    } else {
        reply.data(data);
    }
}

impl VaultFs {
    /// Create the filesystem for a mount context
    pub fn new(context: MountContext, ttl: Duration) -> Result<Self> {
        let mapper = context.mapper();
        let access = context.file_access()?;

        Ok(Self {
            context,
            mapper,
            access,
            inodes: InodeTable::new(),
            ttl,
        })
    }

    pub fn context(&self) -> &MountContext {
        &self.context
    }

    /// Paths bound to `ino`
    fn resolve(&self, ino: u64) -> Result<(VirtualPath, VaultPath)> {
        let virt = self
            .inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?;
        let vault = self.mapper.map(&virt);
        Ok((virt, vault))
    }

    /// Paths of entry `name` in directory `parent`
    fn child(&self, parent: u64, name: &OsStr) -> Result<(VirtualPath, VaultPath)> {
        let (dir, _) = self.resolve(parent)?;
        let virt = dir.join(name)?;
        let vault = self.mapper.map(&virt);
        Ok((virt, vault))
    }

    fn attr(&self, ino: u64, vault: &VaultPath) -> Result<FileAttr> {
        let meta = passthrough::metadata(vault)?;
        let size = self.access.logical_len(vault, &meta)?;
        Ok(file_attr(ino, &meta, size))
    }

    /// Attributes for a new kernel reference to `virt`
    fn entry(&self, virt: &VirtualPath, vault: &VaultPath) -> Result<FileAttr> {
        let meta = passthrough::metadata(vault)?;
        let size = self.access.logical_len(vault, &meta)?;
        let ino = self.inodes.lookup(virt);
        Ok(file_attr(ino, &meta, size))
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let (virt, vault) = self.child(parent, name)?;
        self.entry(&virt, &vault)
    }

    fn do_getattr(&self, ino: u64) -> Result<FileAttr> {
        let (_, vault) = self.resolve(ino)?;
        self.attr(ino, &vault)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr> {
        let (_, vault) = self.resolve(ino)?;

        if let Some(mode) = mode {
            passthrough::chmod(&vault, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            passthrough::chown(&vault, uid, gid)?;
        }
        if let Some(size) = size {
            self.access.truncate(&vault, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            passthrough::utimens(&vault, set_time(atime), set_time(mtime))?;
        }

        self.attr(ino, &vault)
    }

    fn do_readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let (_, vault) = self.resolve(ino)?;
        let target = passthrough::readlink(&vault)?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, FileType, OsString)>> {
        let (virt, vault) = self.resolve(ino)?;
        // Names the kernel has not looked up carry the vault's inode number;
        // readdir must not create table entries, since nothing forgets them
        let parent_ino = match virt.parent() {
            Some(parent) => match self.inodes.find(&parent) {
                Some(parent_ino) => parent_ino,
                None => passthrough::metadata(&self.mapper.map(&parent))?.ino(),
            },
            None => FUSE_ROOT_ID,
        };

        let mut entries = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];

        for entry in passthrough::readdir(&vault)? {
            let child = match virt.join(&entry.name) {
                Ok(child) => child,
                Err(e) => {
                    debug!("skipping {:?}: {}", entry.name, e);
                    continue;
                }
            };
            let child_ino = self.inodes.find(&child).unwrap_or(entry.ino);
            entries.push((child_ino, entry.kind.to_fuser_type(), entry.name));
        }

        Ok(entries)
    }

    fn do_mknod(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<FileAttr> {
        let (virt, vault) = self.child(parent, name)?;
        let kind = mode & libc::S_IFMT as u32;
        let perm = mode & 0o7777 & !umask;

        if kind == 0 || kind == libc::S_IFREG as u32 {
            self.access
                .create(&vault, perm, self.context.encrypt_new_files())?;
        } else {
            passthrough::mknod(&vault, kind | perm, rdev)?;
        }
        self.entry(&virt, &vault)
    }

    fn do_mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> Result<FileAttr> {
        let (virt, vault) = self.child(parent, name)?;
        passthrough::mkdir(&vault, mode & 0o7777 & !umask)?;
        self.entry(&virt, &vault)
    }

    fn do_unlink(&self, parent: u64, name: &OsStr) -> Result<()> {
        let (virt, vault) = self.child(parent, name)?;
        passthrough::unlink(&vault)?;
        self.inodes.unlink(&virt);
        Ok(())
    }

    fn do_rmdir(&self, parent: u64, name: &OsStr) -> Result<()> {
        let (virt, vault) = self.child(parent, name)?;
        passthrough::rmdir(&vault)?;
        self.inodes.unlink(&virt);
        Ok(())
    }

    fn do_symlink(&self, parent: u64, name: &OsStr, target: &Path) -> Result<FileAttr> {
        let (virt, vault) = self.child(parent, name)?;
        passthrough::symlink(target, &vault)?;
        self.entry(&virt, &vault)
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> Result<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(os_error(EINVAL));
        }
        let (from_virt, from) = self.child(parent, name)?;
        let (to_virt, to) = self.child(newparent, newname)?;

        passthrough::rename(&from, &to, flags & RENAME_NOREPLACE != 0)?;
        self.inodes.rename(&from_virt, &to_virt);
        Ok(())
    }

    fn do_link(&self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr> {
        let (_, from) = self.resolve(ino)?;
        let (virt, to) = self.child(newparent, newname)?;
        passthrough::link(&from, &to)?;
        self.entry(&virt, &to)
    }

    fn do_open(&self, ino: u64, flags: i32) -> Result<()> {
        let (_, vault) = self.resolve(ino)?;
        self.access.open(&vault, flags)
    }

    fn do_read(&self, ino: u64, off: i64, size: u32) -> Result<Vec<u8>> {
        let (_, vault) = self.resolve(ino)?;
        self.access.read(&vault, offset(off)?, size)
    }

    fn do_write(&self, ino: u64, off: i64, data: &[u8]) -> Result<u32> {
        let (_, vault) = self.resolve(ino)?;
        let written = self.access.write(&vault, offset(off)?, data)?;
        Ok(written as u32)
    }

    fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<FileAttr> {
        let (virt, vault) = self.child(parent, name)?;
        let perm = mode & 0o7777 & !umask;

        match self
            .access
            .create(&vault, perm, self.context.encrypt_new_files())
        {
            Ok(()) => {}
            // Lost a race with another creator; behave like open(2) with O_CREAT
            Err(e) if e.to_errno() == libc::EEXIST && flags & libc::O_EXCL == 0 => {
                self.access.open(&vault, flags)?;
            }
            Err(e) => return Err(e),
        }
        self.entry(&virt, &vault)
    }

    fn do_fsync(&self, ino: u64, datasync: bool) -> Result<()> {
        let (_, vault) = self.resolve(ino)?;
        self.access.fsync(&vault, datasync)
    }

    fn do_statfs(&self, ino: u64) -> Result<Statvfs> {
        let vault = match self.resolve(ino) {
            Ok((_, vault)) => vault,
            Err(_) => self.mapper.map(&VirtualPath::root()),
        };
        passthrough::statfs(&vault)
    }

    fn do_getxattr(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>> {
        let (_, vault) = self.resolve(ino)?;
        passthrough::getxattr(&vault, name)
    }

    fn do_setxattr(&self, ino: u64, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let (_, vault) = self.resolve(ino)?;
        passthrough::setxattr(&vault, name, value, flags)
    }

    /// NUL-terminated attribute names, as listxattr(2) returns them
    fn do_listxattr(&self, ino: u64) -> Result<Vec<u8>> {
        let (_, vault) = self.resolve(ino)?;
        let mut data = Vec::new();
        for name in passthrough::listxattr(&vault)? {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        Ok(data)
    }

    fn do_removexattr(&self, ino: u64, name: &OsStr) -> Result<()> {
        let (_, vault) = self.resolve(ino)?;
        passthrough::removexattr(&vault, name)
    }

    fn do_access(&self, ino: u64, mask: i32) -> Result<()> {
        let (_, vault) = self.resolve(ino)?;
        passthrough::access(&vault, mask)
    }
}

impl Filesystem for VaultFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        info!(
            "vaultfs serving {:?} (new files {})",
            self.context.root(),
            if self.context.encrypt_new_files() {
                "encrypted"
            } else {
                "plaintext"
            }
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("vaultfs unmounted ({} inodes in use)", self.inodes.len());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) if e.is_not_found() => reply.error(ENOENT),
            Err(e) => reply.error(failed("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(failed("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(failed("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(failed("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_mknod(parent, name, mode, umask, rdev) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(failed("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_mkdir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(failed("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!(
            "symlink(parent={}, name={:?}, target={:?})",
            parent, link_name, target
        );

        match self.do_symlink(parent, link_name, target) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(failed("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("rename", &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        match self.do_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(failed("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        match self.do_open(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(failed("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, offset={}, size={})", ino, offset, size);

        match self.do_read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(failed("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, offset={}, len={})", ino, offset, data.len());

        match self.do_write(ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(failed("write", &e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={})", ino);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, datasync={})", ino, datasync);

        match self.do_fsync(ino, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("fsync", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(failed("readdir", &e));
                return;
            }
        };

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);

        match self.do_statfs(ino) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(failed("statfs", &e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?}, len={})", ino, name, value.len());

        match self.do_setxattr(ino, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("setxattr", &e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        match self.do_getxattr(ino, name) {
            Ok(value) => reply_xattr(&value, size, reply),
            Err(e) => reply.error(failed("getxattr", &e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        match self.do_listxattr(ino) {
            Ok(names) => reply_xattr(&names, size, reply),
            Err(e) => reply.error(failed("listxattr", &e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);

        match self.do_removexattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("removexattr", &e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.do_access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failed("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_create(parent, name, mode, umask, flags) {
            Ok(attr) => reply.created(&self.ttl, &attr, 0, 0, 0),
            Err(e) => reply.error(failed("create", &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AeadCipher, Cipher, MountKey, KEY_SIZE};
    use crate::vault::{xattr, FlagStore, XattrFlagStore, ENCRYPTION_XATTR};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn mount(encrypt_new_files: bool) -> Option<(TempDir, VaultFs)> {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            eprintln!("skipping: no user xattr support");
            return None;
        }
        let key = MountKey::from_bytes([5u8; KEY_SIZE]);
        let ctx = MountContext::new(key, dir.path(), encrypt_new_files).unwrap();
        let vfs = VaultFs::new(ctx, Duration::from_secs(1)).unwrap();
        Some((dir, vfs))
    }

    fn name(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn test_create_write_read_encrypted() {
        let Some((dir, vfs)) = mount(true) else { return };

        let attr = vfs
            .do_create(FUSE_ROOT_ID, name("notes.txt"), 0o100644, 0o022, libc::O_WRONLY)
            .unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.perm, 0o644);

        assert_eq!(vfs.do_write(attr.ino, 0, b"hello world").unwrap(), 11);
        assert_eq!(vfs.do_read(attr.ino, 6, 5).unwrap(), b"world");
        assert_eq!(vfs.do_getattr(attr.ino).unwrap().size, 11);

        let stored = fs::read(dir.path().join("notes.txt")).unwrap();
        assert_ne!(stored, b"hello world");
        let cipher = AeadCipher::new(vfs.context().key()).unwrap();
        assert_eq!(cipher.decrypt(&stored).unwrap(), b"hello world");
    }

    #[test]
    fn test_plaintext_policy() {
        let Some((dir, vfs)) = mount(false) else { return };

        let attr = vfs
            .do_create(FUSE_ROOT_ID, name("plain"), 0o644, 0, libc::O_RDWR)
            .unwrap();
        vfs.do_write(attr.ino, 0, b"visible").unwrap();

        assert_eq!(fs::read(dir.path().join("plain")).unwrap(), b"visible");
    }

    #[test]
    fn test_lookup_existing_and_missing() {
        let Some((dir, vfs)) = mount(true) else { return };
        fs::write(dir.path().join("outside"), b"preexisting").unwrap();

        let attr = vfs.do_lookup(FUSE_ROOT_ID, name("outside")).unwrap();
        assert_eq!(attr.size, 11);
        assert_eq!(vfs.do_read(attr.ino, 0, 100).unwrap(), b"preexisting");

        let err = vfs.do_lookup(FUSE_ROOT_ID, name("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_readdir_lists_entries_with_types() {
        let Some((dir, vfs)) = mount(true) else { return };
        fs::write(dir.path().join("a"), b"").unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("c")).unwrap();

        let mut entries: Vec<(String, FileType)> = vfs
            .do_readdir(FUSE_ROOT_ID)
            .unwrap()
            .into_iter()
            .map(|(_, kind, name)| (name.to_string_lossy().to_string(), kind))
            .collect();
        entries.sort_by(|x, y| x.0.cmp(&y.0));

        assert_eq!(
            entries,
            vec![
                (".".to_string(), FileType::Directory),
                ("..".to_string(), FileType::Directory),
                ("a".to_string(), FileType::RegularFile),
                ("b".to_string(), FileType::Directory),
                ("c".to_string(), FileType::Symlink),
            ]
        );
    }

    #[test]
    fn test_readdir_does_not_grow_inode_table() {
        let Some((dir, vfs)) = mount(true) else { return };
        for i in 0..50 {
            fs::write(dir.path().join(format!("f{}", i)), b"").unwrap();
        }
        let before = vfs.inodes.len();

        let entries = vfs.do_readdir(FUSE_ROOT_ID).unwrap();
        assert_eq!(entries.len(), 52);
        assert_eq!(vfs.inodes.len(), before);

        // Unlooked-up names report the vault inode
        let f0 = dir.path().join("f0");
        let vault_ino = fs::symlink_metadata(&f0).unwrap().ino();
        assert!(entries
            .iter()
            .any(|(ino, _, name)| name == "f0" && *ino == vault_ino));

        // Looked-up names report the table inode
        let looked_up = vfs.do_lookup(FUSE_ROOT_ID, name("f1")).unwrap();
        let entries = vfs.do_readdir(FUSE_ROOT_ID).unwrap();
        assert!(entries
            .iter()
            .any(|(ino, _, name)| name == "f1" && *ino == looked_up.ino));
        assert_eq!(vfs.inodes.len(), before + 1);
    }

    #[test]
    fn test_encrypted_write_and_truncate_too_large() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let f = vfs
            .do_create(FUSE_ROOT_ID, name("big"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_write(f.ino, 0, b"small").unwrap();

        let err = vfs.do_write(f.ino, 1 << 62, b"x").unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);
        let err = vfs
            .do_setattr(f.ino, None, None, None, Some(1 << 62), None, None)
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);

        assert_eq!(vfs.do_getattr(f.ino).unwrap().size, 5);
    }

    #[test]
    fn test_marker_never_listed() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let attr = vfs
            .do_create(FUSE_ROOT_ID, name("f"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_setxattr(attr.ino, name("user.color"), b"red", 0).unwrap();

        let listed = vfs.do_listxattr(attr.ino).unwrap();
        let names: Vec<&[u8]> = listed.split(|&b| b == 0).filter(|n| !n.is_empty()).collect();
        assert!(names.contains(&&b"user.color"[..]));
        assert!(!names.contains(&ENCRYPTION_XATTR.as_bytes()));
        assert!(vfs.do_getxattr(attr.ino, name(ENCRYPTION_XATTR)).is_err());
        assert_eq!(
            vfs.do_setxattr(attr.ino, name(ENCRYPTION_XATTR), b"0", 0)
                .unwrap_err()
                .to_errno(),
            libc::EPERM
        );
        assert_eq!(vfs.do_getxattr(attr.ino, name("user.color")).unwrap(), b"red");
    }

    #[test]
    fn test_setattr_truncates_logical_content() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let attr = vfs
            .do_create(FUSE_ROOT_ID, name("t"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_write(attr.ino, 0, b"0123456789").unwrap();

        let after = vfs
            .do_setattr(attr.ino, Some(0o600), None, None, Some(3), None, None)
            .unwrap();
        assert_eq!(after.size, 3);
        assert_eq!(after.perm, 0o600);
        assert_eq!(vfs.do_read(attr.ino, 0, 100).unwrap(), b"012");
    }

    #[test]
    fn test_mkdir_rename_keeps_inodes() {
        let Some((dir, vfs)) = mount(true) else { return };
        let d = vfs.do_mkdir(FUSE_ROOT_ID, name("d"), 0o755, 0o022).unwrap();
        let f = vfs
            .do_create(d.ino, name("f"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_write(f.ino, 0, b"inside").unwrap();

        vfs.do_rename(FUSE_ROOT_ID, name("d"), FUSE_ROOT_ID, name("e"), 0)
            .unwrap();

        assert!(dir.path().join("e").join("f").exists());
        assert_eq!(vfs.do_read(f.ino, 0, 100).unwrap(), b"inside");
        assert_eq!(vfs.do_lookup(FUSE_ROOT_ID, name("e")).unwrap().ino, d.ino);
    }

    #[test]
    fn test_rename_noreplace() {
        let Some((_dir, vfs)) = mount(false) else { return };
        vfs.do_create(FUSE_ROOT_ID, name("a"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_create(FUSE_ROOT_ID, name("b"), 0o644, 0, libc::O_WRONLY)
            .unwrap();

        let err = vfs
            .do_rename(FUSE_ROOT_ID, name("a"), FUSE_ROOT_ID, name("b"), RENAME_NOREPLACE)
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);

        let err = vfs
            .do_rename(FUSE_ROOT_ID, name("a"), FUSE_ROOT_ID, name("b"), 2)
            .unwrap_err();
        assert_eq!(err.to_errno(), EINVAL);
    }

    #[test]
    fn test_unlink_and_rmdir() {
        let Some((dir, vfs)) = mount(true) else { return };
        let d = vfs.do_mkdir(FUSE_ROOT_ID, name("d"), 0o755, 0).unwrap();
        vfs.do_create(d.ino, name("f"), 0o644, 0, libc::O_WRONLY)
            .unwrap();

        let err = vfs.do_rmdir(FUSE_ROOT_ID, name("d")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);

        vfs.do_unlink(d.ino, name("f")).unwrap();
        vfs.do_rmdir(FUSE_ROOT_ID, name("d")).unwrap();
        assert!(!dir.path().join("d").exists());
    }

    #[test]
    fn test_symlink_and_link() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let f = vfs
            .do_create(FUSE_ROOT_ID, name("f"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_write(f.ino, 0, b"shared").unwrap();

        let s = vfs
            .do_symlink(FUSE_ROOT_ID, name("s"), Path::new("f"))
            .unwrap();
        assert_eq!(s.kind, FileType::Symlink);
        assert_eq!(vfs.do_readlink(s.ino).unwrap(), b"f");

        let l = vfs.do_link(f.ino, FUSE_ROOT_ID, name("l")).unwrap();
        assert_eq!(l.nlink, 2);
        assert_eq!(vfs.do_read(l.ino, 0, 100).unwrap(), b"shared");
    }

    #[test]
    fn test_mknod_regular_follows_policy() {
        let Some((dir, vfs)) = mount(true) else { return };
        let attr = vfs
            .do_mknod(FUSE_ROOT_ID, name("n"), libc::S_IFREG as u32 | 0o644, 0, 0)
            .unwrap();
        assert_eq!(attr.size, 0);

        let mapper = vfs.context().mapper();
        let vault = mapper.map(&VirtualPath::new("/n").unwrap());
        assert!(XattrFlagStore::new().get(&vault).unwrap());
        assert!(!fs::read(dir.path().join("n")).unwrap().is_empty());
    }

    #[test]
    fn test_open_and_access() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let f = vfs
            .do_create(FUSE_ROOT_ID, name("f"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        vfs.do_write(f.ino, 0, b"abc").unwrap();

        vfs.do_open(f.ino, libc::O_RDONLY).unwrap();
        vfs.do_access(f.ino, libc::R_OK).unwrap();
        vfs.do_fsync(f.ino, false).unwrap();

        vfs.do_open(f.ino, libc::O_WRONLY | libc::O_TRUNC).unwrap();
        assert_eq!(vfs.do_getattr(f.ino).unwrap().size, 0);

        assert!(vfs.do_open(9999, libc::O_RDONLY).unwrap_err().is_not_found());
    }

    #[test]
    fn test_negative_offset_rejected() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let f = vfs
            .do_create(FUSE_ROOT_ID, name("f"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        assert_eq!(vfs.do_read(f.ino, -1, 10).unwrap_err().to_errno(), EINVAL);
        assert_eq!(vfs.do_write(f.ino, -1, b"x").unwrap_err().to_errno(), EINVAL);
    }

    #[test]
    fn test_statfs() {
        let Some((_dir, vfs)) = mount(true) else { return };
        let st = vfs.do_statfs(FUSE_ROOT_ID).unwrap();
        assert!(st.block_size() > 0);
    }
}
