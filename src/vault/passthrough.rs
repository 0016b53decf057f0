//! Pass-through operations on the vault
//!
//! Namespace, metadata and attribute calls that need no content transform.
//! Errors keep the errno the host filesystem returned.

use crate::error::{Error, Result};
use crate::vault::flag;
use crate::vault::path::VaultPath;
use crate::vault::xattr;
use nix::sys::stat::{self, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::{self, Statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, AccessFlags};
use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Type of a vault entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<fs::FileType> for EntryKind {
    fn from(ft: fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::RegularFile
        }
    }
}

/// Directory entry from the vault
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
    pub ino: u64,
}

/// Timestamp update request
#[derive(Debug, Clone, Copy)]
pub enum SetTime {
    Now,
    At(SystemTime),
}

impl SetTime {
    fn to_timespec(self) -> TimeSpec {
        match self {
            SetTime::Now => TimeSpec::UTIME_NOW,
            SetTime::At(t) => TimeSpec::from(t.duration_since(UNIX_EPOCH).unwrap_or_default()),
        }
    }
}

fn timespec(time: Option<SetTime>) -> TimeSpec {
    time.map(SetTime::to_timespec).unwrap_or(TimeSpec::UTIME_OMIT)
}

/// lstat
pub fn metadata(path: &VaultPath) -> Result<Metadata> {
    Ok(fs::symlink_metadata(path)?)
}

/// Check access permissions for the calling process
pub fn access(path: &VaultPath, mask: i32) -> Result<()> {
    unistd::access(path.as_path(), AccessFlags::from_bits_truncate(mask))?;
    Ok(())
}

/// Read directory entries, excluding `.` and `..`
pub fn readdir(path: &VaultPath) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;

        entries.push(DirEntry {
            name: entry.file_name(),
            kind: EntryKind::from(file_type),
            ino: entry.ino(),
        });
    }

    Ok(entries)
}

/// Read symlink target
pub fn readlink(path: &VaultPath) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Create a FIFO or device node
///
/// Regular files are created through [`crate::vault::FileAccess::create`]
/// so that they pick up the encryption policy.
pub fn mknod(path: &VaultPath, mode: u32, rdev: u32) -> Result<()> {
    let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t);
    let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);

    if kind == SFlag::S_IFIFO {
        unistd::mkfifo(path.as_path(), perm)?;
    } else {
        stat::mknod(path.as_path(), kind, perm, rdev as libc::dev_t)?;
    }
    Ok(())
}

pub fn mkdir(path: &VaultPath, mode: u32) -> Result<()> {
    fs::DirBuilder::new().mode(mode).create(path)?;
    Ok(())
}

pub fn unlink(path: &VaultPath) -> Result<()> {
    fs::remove_file(path)?;
    Ok(())
}

pub fn rmdir(path: &VaultPath) -> Result<()> {
    fs::remove_dir(path)?;
    Ok(())
}

/// Create `link` pointing at `target`; the target is stored verbatim
pub fn symlink(target: &Path, link: &VaultPath) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Rename; with `no_replace` an existing destination is an error
pub fn rename(from: &VaultPath, to: &VaultPath, no_replace: bool) -> Result<()> {
    if no_replace && fs::symlink_metadata(to).is_ok() {
        return Err(Error::Io(io::Error::from_raw_os_error(libc::EEXIST)));
    }
    fs::rename(from, to)?;
    Ok(())
}

/// Hard link
pub fn link(from: &VaultPath, to: &VaultPath) -> Result<()> {
    fs::hard_link(from, to)?;
    Ok(())
}

pub fn chmod(path: &VaultPath, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

/// Change ownership without following symlinks
pub fn chown(path: &VaultPath, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    std::os::unix::fs::lchown(path, uid, gid)?;
    Ok(())
}

/// Set access/modification times; `None` leaves a timestamp unchanged
pub fn utimens(path: &VaultPath, atime: Option<SetTime>, mtime: Option<SetTime>) -> Result<()> {
    stat::utimensat(
        None,
        path.as_path(),
        &timespec(atime),
        &timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

/// Filesystem statistics of the volume holding the vault
pub fn statfs(path: &VaultPath) -> Result<Statvfs> {
    Ok(statvfs::statvfs(path.as_path())?)
}

fn reserved_error(errno: i32) -> Error {
    Error::Io(io::Error::from_raw_os_error(errno))
}

/// Read a caller-visible attribute; the marker reads as absent
pub fn getxattr(path: &VaultPath, name: &OsStr) -> Result<Vec<u8>> {
    if flag::is_reserved(name) {
        return Err(reserved_error(xattr::ENOATTR));
    }
    xattr::get(path.as_path(), name)?.ok_or_else(|| reserved_error(xattr::ENOATTR))
}

/// Write a caller-visible attribute; the marker cannot be written
pub fn setxattr(path: &VaultPath, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
    if flag::is_reserved(name) {
        return Err(reserved_error(libc::EPERM));
    }
    xattr::set(path.as_path(), name, value, flags)?;
    Ok(())
}

/// List caller-visible attributes, hiding the marker
pub fn listxattr(path: &VaultPath) -> Result<Vec<OsString>> {
    let mut names = xattr::list(path.as_path())?;
    names.retain(|name| !flag::is_reserved(name));
    Ok(names)
}

/// Remove a caller-visible attribute; the marker cannot be removed
pub fn removexattr(path: &VaultPath, name: &OsStr) -> Result<()> {
    if flag::is_reserved(name) {
        return Err(reserved_error(libc::EPERM));
    }
    xattr::remove(path.as_path(), name)?;
    Ok(())
}
