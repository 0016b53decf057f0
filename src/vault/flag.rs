//! Per-file encryption marker
//!
//! Whether a vault file holds ciphertext is recorded out-of-band in an
//! extended attribute, never inferred from the bytes themselves. A file
//! without the attribute is plaintext, so directories populated outside the
//! mount stay readable.

use crate::error::{Error, Result};
use crate::vault::path::VaultPath;
use crate::vault::xattr;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tracing::debug;

/// Reserved attribute name holding the marker
pub const ENCRYPTION_XATTR: &str = "user.vaultfs.encrypted";

const ENCRYPTED: &[u8] = b"1";
const PLAINTEXT: &[u8] = b"0";

/// Is `name` the reserved marker attribute
pub fn is_reserved(name: &OsStr) -> bool {
    name == OsStr::new(ENCRYPTION_XATTR)
}

/// Durable "is this file ciphertext" lookup
pub trait FlagStore: Send + Sync {
    /// Read the marker; a missing marker means plaintext
    fn get(&self, path: &VaultPath) -> Result<bool>;

    /// Write the marker
    fn set(&self, path: &VaultPath, encrypted: bool) -> Result<()>;
}

/// Marker stored in the `user.vaultfs.encrypted` xattr
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrFlagStore;

impl XattrFlagStore {
    pub fn new() -> Self {
        XattrFlagStore
    }

    /// Check that the vault filesystem accepts user xattrs
    ///
    /// Run once at mount time: without xattrs no file could ever be marked
    /// encrypted, so this is a configuration error rather than a per-call one.
    pub fn probe(dir: &Path) -> Result<()> {
        let name = OsStr::new("user.vaultfs.probe");
        xattr::set(dir, name, b"1", 0).map_err(Error::Store)?;
        xattr::remove(dir, name).map_err(Error::Store)?;
        Ok(())
    }
}

impl FlagStore for XattrFlagStore {
    fn get(&self, path: &VaultPath) -> Result<bool> {
        match xattr::get(path.as_path(), OsStr::new(ENCRYPTION_XATTR)) {
            Ok(None) => Ok(false),
            Ok(Some(value)) if value == ENCRYPTED => Ok(true),
            Ok(Some(value)) if value == PLAINTEXT => Ok(false),
            Ok(Some(value)) => Err(Error::Store(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognised marker value {:?}", String::from_utf8_lossy(&value)),
            ))),
            // Let the caller see ENOENT for the file itself
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Io(e)),
            // Special files and symlinks cannot carry user xattrs
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(false),
            Err(e) => Err(Error::Store(e)),
        }
    }

    fn set(&self, path: &VaultPath, encrypted: bool) -> Result<()> {
        debug!("flag set {:?} = {}", path.as_path(), encrypted);
        let value = if encrypted { ENCRYPTED } else { PLAINTEXT };
        xattr::set(path.as_path(), OsStr::new(ENCRYPTION_XATTR), value, 0).map_err(Error::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::path::{PathMapper, VirtualPath};
    use tempfile::tempdir;

    #[test]
    fn test_absent_marker_is_plaintext() {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            return;
        }
        std::fs::write(dir.path().join("plain"), b"data").unwrap();

        let mapper = PathMapper::new(dir.path().to_path_buf());
        let path = mapper.map(&VirtualPath::new("/plain").unwrap());
        assert!(!XattrFlagStore::new().get(&path).unwrap());
    }

    #[test]
    fn test_set_and_get() {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            return;
        }
        std::fs::write(dir.path().join("f"), b"").unwrap();

        let mapper = PathMapper::new(dir.path().to_path_buf());
        let path = mapper.map(&VirtualPath::new("/f").unwrap());
        let store = XattrFlagStore::new();

        store.set(&path, true).unwrap();
        assert!(store.get(&path).unwrap());

        store.set(&path, false).unwrap();
        assert!(!store.get(&path).unwrap());

        // "false" is stored, not merely absent
        let raw = xattr::get(path.as_path(), OsStr::new(ENCRYPTION_XATTR)).unwrap();
        assert_eq!(raw.as_deref(), Some(PLAINTEXT));
    }

    #[test]
    fn test_garbage_marker_is_an_error() {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            return;
        }
        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();
        xattr::set(&file, OsStr::new(ENCRYPTION_XATTR), b"maybe", 0).unwrap();

        let mapper = PathMapper::new(dir.path().to_path_buf());
        let path = mapper.map(&VirtualPath::new("/f").unwrap());
        assert!(matches!(
            XattrFlagStore::new().get(&path),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let mapper = PathMapper::new(dir.path().to_path_buf());
        let path = mapper.map(&VirtualPath::new("/missing").unwrap());
        let err = XattrFlagStore::new().get(&path).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_probe() {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            return;
        }
        XattrFlagStore::probe(dir.path()).unwrap();
    }

    #[test]
    fn test_is_reserved() {
        assert!(is_reserved(OsStr::new("user.vaultfs.encrypted")));
        assert!(!is_reserved(OsStr::new("user.other")));
    }
}
