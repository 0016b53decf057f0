//! Error types for vaultfs
//!
//! Every operation returns a tagged [`Error`]; the FUSE layer converts it to
//! an errno with [`Error::to_errno`] right before replying to the kernel.

use std::io;
use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Path does not exist in the vault
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Underlying storage failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Ciphertext malformed or key mismatch
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Cipher refused to encrypt
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Encryption marker could not be read or written
    #[error("Flag store error: {0}")]
    Store(#[source] io::Error),

    /// Offset beyond content length
    #[error("Offset {offset} out of range (length {len})")]
    OutOfRange { offset: u64, len: u64 },

    /// Virtual path rejected before mapping
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Configuration could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration is present but unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convert to a positive errno for `reply.error`
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::Io(e) => io_error_to_errno(e),
            Error::Store(e) => match e.raw_os_error() {
                Some(code) if code == libc::ENOTSUP || code == libc::ENOENT => code,
                _ => libc::EIO,
            },
            Error::Decryption(_) | Error::Encryption(_) => libc::EIO,
            Error::OutOfRange { .. } => libc::EINVAL,
            Error::InvalidPath(msg) if msg.contains("too long") => libc::ENAMETOOLONG,
            Error::InvalidPath(_) => libc::EINVAL,
            Error::KeyDerivation(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether the error means "nothing at this path"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Map an I/O error to errno, falling back to EIO when the OS gave none
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errno_passthrough() {
        let e = Error::Io(io::Error::from_raw_os_error(libc::ENOTEMPTY));
        assert_eq!(e.to_errno(), libc::ENOTEMPTY);

        let e = Error::Io(io::Error::other("no os code"));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_content_errors_map_to_eio() {
        assert_eq!(Error::Decryption("bad tag".into()).to_errno(), libc::EIO);
        assert_eq!(Error::Encryption("x".into()).to_errno(), libc::EIO);
    }

    #[test]
    fn test_store_errno() {
        let e = Error::Store(io::Error::from_raw_os_error(libc::ENOTSUP));
        assert_eq!(e.to_errno(), libc::ENOTSUP);

        let e = Error::Store(io::Error::from_raw_os_error(libc::ERANGE));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_path_errors() {
        assert_eq!(
            Error::InvalidPath("path too long".into()).to_errno(),
            libc::ENAMETOOLONG
        );
        assert_eq!(
            Error::InvalidPath("embedded NUL".into()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(Error::NotFound("a".into()).to_errno(), libc::ENOENT);
        assert_eq!(
            Error::PermissionDenied("a".into()).to_errno(),
            libc::EACCES
        );
    }

    #[test]
    fn test_nix_conversion() {
        let e: Error = nix::Error::EXDEV.into();
        assert_eq!(e.to_errno(), libc::EXDEV);
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(Error::Io(io::Error::from_raw_os_error(libc::ENOENT)).is_not_found());
        assert!(!Error::Decryption("x".into()).is_not_found());
    }
}
