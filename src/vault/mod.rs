//! Vault layer
//!
//! The real directory backing the mount. Paths are translated by
//! [`PathMapper`], content goes through [`FileAccess`], and everything else
//! is forwarded by [`passthrough`].

mod access;
mod flag;
pub mod passthrough;
mod path;
pub(crate) mod xattr;

pub use access::{FileAccess, MAX_ENCRYPTED_LEN};
pub use flag::{is_reserved, FlagStore, XattrFlagStore, ENCRYPTION_XATTR};
pub use path::{PathMapper, VaultPath, VirtualPath, MAX_PATH_LEN};

use crate::crypto::{AeadCipher, MountKey};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Everything fixed for the lifetime of a mount
#[derive(Debug)]
pub struct MountContext {
    key: MountKey,
    root: PathBuf,
    encrypt_new_files: bool,
}

impl MountContext {
    /// Build the context, canonicalizing the vault root
    pub fn new(key: MountKey, root: &Path, encrypt_new_files: bool) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            Error::InvalidConfig(format!("Vault root {:?} is not usable: {}", root, e))
        })?;
        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "Vault root {:?} is not a directory",
                root
            )));
        }

        Ok(Self {
            key,
            root,
            encrypt_new_files,
        })
    }

    pub fn key(&self) -> &MountKey {
        &self.key
    }

    /// Canonical vault root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether files created through the mount are encrypted
    pub fn encrypt_new_files(&self) -> bool {
        self.encrypt_new_files
    }

    /// Path mapper rooted at the vault root
    pub fn mapper(&self) -> PathMapper {
        PathMapper::new(self.root.clone())
    }

    /// Content access using the AES-GCM cipher and xattr markers
    pub fn file_access(&self) -> Result<FileAccess> {
        let cipher = AeadCipher::new(&self.key)?;
        Ok(FileAccess::new(Box::new(cipher), Box::new(XattrFlagStore::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use tempfile::tempdir;

    #[test]
    fn test_context_canonicalizes_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("v")).unwrap();
        let indirect = dir.path().join("v").join("..").join("v");

        let ctx = MountContext::new(MountKey::from_bytes([0; KEY_SIZE]), &indirect, true).unwrap();
        assert_eq!(ctx.root(), dir.path().join("v").canonicalize().unwrap());
        assert!(ctx.encrypt_new_files());
    }

    #[test]
    fn test_context_rejects_missing_or_file_root() {
        let dir = tempdir().unwrap();
        let key = MountKey::from_bytes([0; KEY_SIZE]);
        assert!(MountContext::new(key.clone(), &dir.path().join("missing"), true).is_err());

        std::fs::write(dir.path().join("file"), b"").unwrap();
        assert!(matches!(
            MountContext::new(key, &dir.path().join("file"), true),
            Err(Error::InvalidConfig(_))
        ));
    }
}
