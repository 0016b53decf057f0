//! Extended attribute syscalls on vault paths
//!
//! All calls use the non-following variants so that symlinks are handled
//! as themselves.

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

/// errno for "attribute not present"
#[cfg(target_os = "linux")]
pub const ENOATTR: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
pub const ENOATTR: i32 = libc::ENOATTR;

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn c_name(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

#[cfg(target_os = "linux")]
unsafe fn sys_get(path: &CString, name: &CString, buf: *mut libc::c_void, size: usize) -> isize {
    libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf, size)
}

#[cfg(target_os = "macos")]
unsafe fn sys_get(path: &CString, name: &CString, buf: *mut libc::c_void, size: usize) -> isize {
    libc::getxattr(path.as_ptr(), name.as_ptr(), buf, size, 0, libc::XATTR_NOFOLLOW)
}

#[cfg(target_os = "linux")]
unsafe fn sys_set(path: &CString, name: &CString, value: &[u8], flags: i32) -> i32 {
    libc::lsetxattr(
        path.as_ptr(),
        name.as_ptr(),
        value.as_ptr() as *const libc::c_void,
        value.len(),
        flags,
    )
}

#[cfg(target_os = "macos")]
unsafe fn sys_set(path: &CString, name: &CString, value: &[u8], flags: i32) -> i32 {
    libc::setxattr(
        path.as_ptr(),
        name.as_ptr(),
        value.as_ptr() as *const libc::c_void,
        value.len(),
        0,
        flags | libc::XATTR_NOFOLLOW,
    )
}

#[cfg(target_os = "linux")]
unsafe fn sys_list(path: &CString, buf: *mut libc::c_char, size: usize) -> isize {
    libc::llistxattr(path.as_ptr(), buf, size)
}

#[cfg(target_os = "macos")]
unsafe fn sys_list(path: &CString, buf: *mut libc::c_char, size: usize) -> isize {
    libc::listxattr(path.as_ptr(), buf, size, libc::XATTR_NOFOLLOW)
}

#[cfg(target_os = "linux")]
unsafe fn sys_remove(path: &CString, name: &CString) -> i32 {
    libc::lremovexattr(path.as_ptr(), name.as_ptr())
}

#[cfg(target_os = "macos")]
unsafe fn sys_remove(path: &CString, name: &CString) -> i32 {
    libc::removexattr(path.as_ptr(), name.as_ptr(), libc::XATTR_NOFOLLOW)
}

/// Read an attribute; `Ok(None)` when it is not set
pub fn get(path: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
    let cpath = c_path(path)?;
    let cname = c_name(name)?;

    loop {
        let size = unsafe { sys_get(&cpath, &cname, std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ENOATTR) {
                return Ok(None);
            }
            return Err(err);
        }

        let mut buf = vec![0u8; size as usize];
        let read = unsafe {
            sys_get(&cpath, &cname, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Grew between the two calls
                Some(libc::ERANGE) => continue,
                Some(code) if code == ENOATTR => return Ok(None),
                _ => return Err(err),
            }
        }
        buf.truncate(read as usize);
        return Ok(Some(buf));
    }
}

/// Write an attribute; `flags` takes `XATTR_CREATE` / `XATTR_REPLACE`
pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let cpath = c_path(path)?;
    let cname = c_name(name)?;

    let res = unsafe { sys_set(&cpath, &cname, value, flags) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// List attribute names
pub fn list(path: &Path) -> io::Result<Vec<OsString>> {
    let cpath = c_path(path)?;

    loop {
        let size = unsafe { sys_list(&cpath, std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(io::Error::last_os_error());
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; size as usize];
        let read = unsafe { sys_list(&cpath, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err);
        }
        buf.truncate(read as usize);

        return Ok(buf
            .split(|&b| b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| OsString::from_vec(name.to_vec()))
            .collect());
    }
}

/// Remove an attribute
pub fn remove(path: &Path, name: &OsStr) -> io::Result<()> {
    let cpath = c_path(path)?;
    let cname = c_name(name)?;

    let res = unsafe { sys_remove(&cpath, &cname) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn supported(dir: &Path) -> bool {
    let probe = dir.join(".xattr-probe");
    if std::fs::write(&probe, b"").is_err() {
        return false;
    }
    let ok = set(&probe, OsStr::new("user.probe"), b"1", 0).is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_list_remove() {
        let dir = tempdir().unwrap();
        if !supported(dir.path()) {
            eprintln!("skipping: no user xattr support");
            return;
        }
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let name = OsStr::new("user.test.color");
        assert_eq!(get(&file, name).unwrap(), None);

        set(&file, name, b"blue", 0).unwrap();
        assert_eq!(get(&file, name).unwrap(), Some(b"blue".to_vec()));
        assert!(list(&file).unwrap().iter().any(|n| n == name));

        remove(&file, name).unwrap();
        assert_eq!(get(&file, name).unwrap(), None);
        assert_eq!(
            remove(&file, name).unwrap_err().raw_os_error(),
            Some(ENOATTR)
        );
    }

    #[test]
    fn test_create_flag_refuses_existing() {
        let dir = tempdir().unwrap();
        if !supported(dir.path()) {
            return;
        }
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let name = OsStr::new("user.test.once");
        set(&file, name, b"1", libc::XATTR_CREATE).unwrap();
        let err = set(&file, name, b"2", libc::XATTR_CREATE).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = get(&dir.path().join("nope"), OsStr::new("user.a")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
