//! vaultfs - Transparent-encryption overlay filesystem
//!
//! This library provides a FUSE filesystem that mirrors a real directory
//! (the vault) at a mount point. Files marked encrypted are stored as
//! AES-256-GCM ciphertext and presented as plaintext; everything else
//! passes through unchanged.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::vault::{MountContext, VirtualPath};
}
