//! Virtual path → vault path mapping
//!
//! Paths are normalized lexically when a [`VirtualPath`] is built: `.` is
//! dropped and `..` pops a component, stopping at the virtual root. A mapped
//! path therefore always stays under the vault root.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Longest virtual path accepted, in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Path as seen by filesystem callers, always rooted at `/`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath(PathBuf);

impl VirtualPath {
    /// The mount root
    pub fn root() -> Self {
        VirtualPath(PathBuf::from("/"))
    }

    /// Validate and normalize a caller-supplied path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = path.as_ref().as_os_str().as_bytes();
        if raw.len() > MAX_PATH_LEN {
            return Err(Error::InvalidPath(format!(
                "path too long: {} bytes",
                raw.len()
            )));
        }
        if raw.contains(&0) {
            return Err(Error::InvalidPath("embedded NUL byte".to_string()));
        }

        let mut normalized = PathBuf::from("/");
        for component in path.as_ref().components() {
            match component {
                Component::Normal(name) => normalized.push(name),
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(VirtualPath(normalized))
    }

    /// Path of a directory entry named `name` inside this directory
    pub fn join(&self, name: &OsStr) -> Result<Self> {
        if name.is_empty() || name.as_bytes().contains(&b'/') {
            return Err(Error::InvalidPath(format!(
                "invalid entry name: {:?}",
                name
            )));
        }
        VirtualPath::new(self.0.join(name))
    }

    /// Parent directory, `None` for the root
    pub fn parent(&self) -> Option<VirtualPath> {
        self.0.parent().map(|p| VirtualPath(p.to_path_buf()))
    }

    /// Last component, `None` for the root
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    pub fn is_root(&self) -> bool {
        self.0 == Path::new("/")
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Whether `self` is `ancestor` or lies below it
    pub fn starts_with(&self, ancestor: &VirtualPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Replace the `from` prefix with `to`
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<VirtualPath> {
        let rest = self.0.strip_prefix(&from.0).ok()?;
        if rest.as_os_str().is_empty() {
            Some(to.clone())
        } else {
            Some(VirtualPath(to.0.join(rest)))
        }
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Location of a file inside the vault
///
/// Only [`PathMapper::map`] and [`VaultPath::sibling`] construct these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPath(PathBuf);

impl VaultPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// A path in the same directory with a different file name
    pub fn sibling(&self, name: &OsStr) -> Option<VaultPath> {
        if name.is_empty() || name.as_bytes().contains(&b'/') || name == ".." || name == "." {
            return None;
        }
        let parent = self.0.parent()?;
        Some(VaultPath(parent.join(name)))
    }
}

impl AsRef<Path> for VaultPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Maps virtual paths under a fixed vault root
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the vault root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to its vault path
    pub fn map(&self, path: &VirtualPath) -> VaultPath {
        let relative = path.as_path().strip_prefix("/").unwrap_or(path.as_path());
        if relative.as_os_str().is_empty() {
            VaultPath(self.root.clone())
        } else {
            VaultPath(self.root.join(relative))
        }
    }

    /// Convert an absolute vault path back to a virtual path
    pub fn to_virtual(&self, vault_path: &Path) -> Option<VirtualPath> {
        let relative = vault_path.strip_prefix(&self.root).ok()?;
        VirtualPath::new(Path::new("/").join(relative)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new(PathBuf::from("/srv/vault"))
    }

    #[test]
    fn test_map_joins_with_one_separator() {
        let m = mapper();
        let v = VirtualPath::new("/docs/a.txt").unwrap();
        assert_eq!(m.map(&v).as_path(), Path::new("/srv/vault/docs/a.txt"));

        let v = VirtualPath::new("docs//b.txt").unwrap();
        assert_eq!(m.map(&v).as_path(), Path::new("/srv/vault/docs/b.txt"));
    }

    #[test]
    fn test_root_maps_to_vault_root() {
        let m = mapper();
        assert_eq!(m.map(&VirtualPath::root()).as_path(), Path::new("/srv/vault"));
        assert!(VirtualPath::new("/").unwrap().is_root());
    }

    #[test]
    fn test_parent_dir_cannot_escape() {
        let m = mapper();
        let v = VirtualPath::new("/../../etc/passwd").unwrap();
        assert_eq!(m.map(&v).as_path(), Path::new("/srv/vault/etc/passwd"));

        let v = VirtualPath::new("/a/./b/../c").unwrap();
        assert_eq!(v.as_path(), Path::new("/a/c"));

        let v = VirtualPath::root().join(OsStr::new("..")).unwrap();
        assert!(v.is_root());
    }

    #[test]
    fn test_rejects_nul_and_long_paths() {
        assert!(matches!(
            VirtualPath::new(OsStr::from_bytes(b"/a\0b")),
            Err(Error::InvalidPath(_))
        ));

        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert!(VirtualPath::new(&long).is_err());

        let fits = format!("/{}", "x".repeat(MAX_PATH_LEN - 1));
        assert!(VirtualPath::new(&fits).is_ok());
    }

    #[test]
    fn test_join_rejects_separator() {
        let root = VirtualPath::root();
        assert!(root.join(OsStr::new("a/b")).is_err());
        assert!(root.join(OsStr::new("")).is_err());
        assert_eq!(
            root.join(OsStr::new("a")).unwrap().as_path(),
            Path::new("/a")
        );
    }

    #[test]
    fn test_rebase() {
        let from = VirtualPath::new("/a").unwrap();
        let to = VirtualPath::new("/z/y").unwrap();

        let child = VirtualPath::new("/a/b/c").unwrap();
        assert_eq!(
            child.rebase(&from, &to).unwrap().as_path(),
            Path::new("/z/y/b/c")
        );
        assert_eq!(from.rebase(&from, &to).unwrap(), to);

        let other = VirtualPath::new("/ab").unwrap();
        assert!(!other.starts_with(&from));
    }

    #[test]
    fn test_to_virtual() {
        let m = mapper();
        let v = m.to_virtual(Path::new("/srv/vault/x/y")).unwrap();
        assert_eq!(v.as_path(), Path::new("/x/y"));
        assert!(m.to_virtual(Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn test_sibling_stays_in_directory() {
        let m = mapper();
        let p = m.map(&VirtualPath::new("/d/f").unwrap());
        let s = p.sibling(OsStr::new(".f.tmp")).unwrap();
        assert_eq!(s.as_path(), Path::new("/srv/vault/d/.f.tmp"));
        assert!(p.sibling(OsStr::new("../x")).is_none());
        assert!(p.sibling(OsStr::new("..")).is_none());
    }
}
