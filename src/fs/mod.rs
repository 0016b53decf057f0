//! FUSE filesystem implementation
//!
//! Translates kernel requests into vault operations: namespace and metadata
//! calls pass straight through, file content goes through the cipher.

mod filesystem;
mod inode;
mod mount;

pub use filesystem::VaultFs;
pub use inode::{file_attr, InodeTable};
pub use mount::mount_options;
