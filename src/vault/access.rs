//! Content access with transparent encryption
//!
//! Every call reopens the vault file; nothing is cached between calls. For a
//! plaintext file reads and writes go straight to the requested offset. For
//! an encrypted file the whole content is loaded, decrypted, modified in
//! memory, re-encrypted and written back, because the cipher only works on
//! complete buffers.
//!
//! Two concurrent writers on the same encrypted file can lose updates: both
//! load the old content and the later flush wins. Callers needing stronger
//! guarantees must serialize writes per file.

use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::vault::flag::{self, FlagStore};
use crate::vault::path::VaultPath;
use crate::vault::xattr;
use rand::Rng;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use tracing::{debug, warn};

/// Largest logical size of an encrypted file, which is held in memory whole
pub const MAX_ENCRYPTED_LEN: u64 = 1 << 30;

/// Reads and writes file content through the cipher when the file is marked
pub struct FileAccess {
    cipher: Box<dyn Cipher>,
    flags: Box<dyn FlagStore>,
}

impl FileAccess {
    pub fn new(cipher: Box<dyn Cipher>, flags: Box<dyn FlagStore>) -> Self {
        Self { cipher, flags }
    }

    /// Whether the stored bytes are ciphertext
    pub fn is_encrypted(&self, path: &VaultPath) -> Result<bool> {
        self.flags.get(path)
    }

    /// Size callers see for a file with the given metadata
    pub fn logical_len(&self, path: &VaultPath, meta: &fs::Metadata) -> Result<u64> {
        if !meta.is_file() || !self.is_encrypted(path)? {
            return Ok(meta.len());
        }
        if meta.len() == 0 {
            return Ok(0);
        }
        match self.cipher.plaintext_len(meta.len()) {
            Some(len) => Ok(len),
            None => {
                warn!("{:?}: stored size {} is not a valid ciphertext", path.as_path(), meta.len());
                Ok(meta.len())
            }
        }
    }

    /// Check that the file can be opened with `flags`
    ///
    /// `O_TRUNC` is applied through [`FileAccess::truncate`] so that an
    /// encrypted file is left holding a valid empty ciphertext.
    pub fn open(&self, path: &VaultPath, flags: i32) -> Result<()> {
        let accmode = flags & libc::O_ACCMODE;
        let passthrough = flags
            & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND);

        OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(passthrough)
            .open(path)?;

        if flags & libc::O_TRUNC != 0 && accmode != libc::O_RDONLY {
            self.truncate(path, 0)?;
        }
        Ok(())
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// Reading at or past the end yields a short or empty buffer.
    pub fn read(&self, path: &VaultPath, offset: u64, size: u32) -> Result<Vec<u8>> {
        if !self.is_encrypted(path)? {
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;

            let mut buffer = Vec::with_capacity(size as usize);
            file.take(size as u64).read_to_end(&mut buffer)?;
            return Ok(buffer);
        }

        let plaintext = self.load_plaintext(path)?;
        let start = match usize::try_from(offset) {
            Ok(start) if start < plaintext.len() => start,
            _ => return Ok(Vec::new()),
        };
        let end = start.saturating_add(size as usize).min(plaintext.len());
        Ok(plaintext[start..end].to_vec())
    }

    /// Write `data` at `offset`, returning the number of bytes written
    pub fn write(&self, path: &VaultPath, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.is_encrypted(path)? {
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            return Ok(data.len());
        }

        let mut plaintext = self.load_plaintext(path)?;
        splice(&mut plaintext, offset, data)?;
        self.store_ciphertext(path, &plaintext)?;
        debug!(
            "encrypted write {:?}: {} bytes at {}, new length {}",
            path.as_path(),
            data.len(),
            offset,
            plaintext.len()
        );
        Ok(data.len())
    }

    /// Create an empty file, marked according to `encrypt`
    ///
    /// Fails with `EEXIST` if the file is already there.
    pub fn create(&self, path: &VaultPath, mode: u32, encrypt: bool) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;

        let result = if encrypt {
            self.cipher
                .encrypt(&[])
                .and_then(|empty| file.write_all(&empty).map_err(Error::from))
                .and_then(|_| self.flags.set(path, true))
        } else {
            Ok(())
        };

        if let Err(e) = result {
            drop(file);
            if let Err(cleanup) = fs::remove_file(path) {
                warn!("Failed to remove half-created {:?}: {}", path.as_path(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Resize the logical content, zero-filling when growing
    pub fn truncate(&self, path: &VaultPath, size: u64) -> Result<()> {
        if !self.is_encrypted(path)? {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(size)?;
            return Ok(());
        }

        let mut plaintext = self.load_plaintext(path)?;
        resize(&mut plaintext, size)?;
        self.store_ciphertext(path, &plaintext)
    }

    /// Convert a file between plaintext and ciphertext storage
    ///
    /// The converted bytes and the new marker are written to a temporary
    /// file next to the original, which then replaces it with a single
    /// rename. Returns `false` if the file was already in the requested state.
    pub fn set_encryption(&self, path: &VaultPath, encrypt: bool) -> Result<bool> {
        let meta = fs::symlink_metadata(path)?;
        if !meta.is_file() {
            return Err(Error::InvalidPath(format!(
                "{:?} is not a regular file",
                path.as_path()
            )));
        }
        if self.is_encrypted(path)? == encrypt {
            return Ok(false);
        }

        let plaintext = self.load_plaintext(path)?;
        let stored = if encrypt {
            self.cipher.encrypt(&plaintext)?
        } else {
            plaintext
        };

        let temp = temp_sibling(path)?;
        let result = self.write_replacement(path, &temp, &meta, &stored, encrypt);
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&temp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", temp.as_path(), cleanup);
                }
            }
            return Err(e);
        }

        debug!("{:?} now {}", path.as_path(), if encrypt { "encrypted" } else { "plaintext" });
        Ok(true)
    }

    /// Flush the file's data and metadata to disk
    pub fn fsync(&self, path: &VaultPath, datasync: bool) -> Result<()> {
        let file = File::open(path)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn write_replacement(
        &self,
        path: &VaultPath,
        temp: &VaultPath,
        meta: &fs::Metadata,
        stored: &[u8],
        encrypt: bool,
    ) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(temp)?;
        file.write_all(stored)?;
        file.sync_all()?;
        drop(file);

        copy_user_xattrs(path, temp);
        self.flags.set(temp, encrypt)?;

        fs::set_permissions(temp, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        if let Err(e) = std::os::unix::fs::lchown(temp, Some(meta.uid()), Some(meta.gid())) {
            debug!("Keeping new owner on {:?}: {}", temp.as_path(), e);
        }

        fs::rename(temp, path)?;
        Ok(())
    }

    fn load_plaintext(&self, path: &VaultPath) -> Result<Vec<u8>> {
        let stored = fs::read(path)?;
        if !self.is_encrypted(path)? {
            return Ok(stored);
        }
        // No valid ciphertext is empty, so this can only be a file truncated
        // outside the mount
        if stored.is_empty() {
            return Ok(stored);
        }
        self.cipher.decrypt(&stored)
    }

    fn store_ciphertext(&self, path: &VaultPath, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.cipher.encrypt(plaintext)?;
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(&ciphertext)?;
        Ok(())
    }
}

/// Overwrite `buf` at `offset`, extending with zeros as needed
fn splice(buf: &mut Vec<u8>, offset: u64, data: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(data.len() as u64)
        .ok_or_else(|| too_large(u64::MAX))?;
    if (buf.len() as u64) < end {
        resize(buf, end)?;
    }

    // buf now holds at least `end` bytes, so both fit in usize
    let start = offset as usize;
    buf[start..start + data.len()].copy_from_slice(data);
    Ok(())
}

/// Resize an in-memory plaintext, zero-filling when growing
///
/// Growth is capped at [`MAX_ENCRYPTED_LEN`] and allocation failure is
/// reported instead of aborting the process.
fn resize(buf: &mut Vec<u8>, len: u64) -> Result<()> {
    if len > MAX_ENCRYPTED_LEN {
        return Err(too_large(len));
    }
    let len = len as usize;
    if len > buf.len() {
        buf.try_reserve_exact(len - buf.len())
            .map_err(|_| Error::Io(io::Error::from_raw_os_error(libc::ENOMEM)))?;
    }
    buf.resize(len, 0);
    Ok(())
}

fn too_large(len: u64) -> Error {
    debug!("refusing encrypted file of {} bytes", len);
    Error::Io(io::Error::from_raw_os_error(libc::EFBIG))
}

fn temp_sibling(path: &VaultPath) -> Result<VaultPath> {
    let name = path
        .as_path()
        .file_name()
        .ok_or_else(|| Error::InvalidPath(format!("{:?} has no file name", path.as_path())))?;

    let mut temp_name = OsString::from(".");
    temp_name.push(name);
    temp_name.push(format!(".vaultfs-{:08x}", rand::thread_rng().gen::<u32>()));

    path.sibling(&temp_name)
        .ok_or_else(|| Error::InvalidPath(format!("{:?}", temp_name)))
}

fn copy_user_xattrs(from: &VaultPath, to: &VaultPath) {
    let names = match xattr::list(from.as_path()) {
        Ok(names) => names,
        Err(e) => {
            warn!("Cannot list xattrs of {:?}: {}", from.as_path(), e);
            return;
        }
    };

    for name in names {
        if flag::is_reserved(&name) || !name.as_bytes().starts_with(b"user.") {
            continue;
        }
        match xattr::get(from.as_path(), &name) {
            Ok(Some(value)) => {
                if let Err(e) = xattr::set(to.as_path(), &name, &value, 0) {
                    warn!("Dropping xattr {:?}: {}", name, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Dropping xattr {:?}: {}", name, e),
        }
    }
}
