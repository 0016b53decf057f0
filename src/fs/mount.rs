//! Mount options

use crate::config::MountConfig;
use fuser::MountOption;

/// FUSE options for a mount
///
/// The daemon opens vault files with its own credentials, so the kernel must
/// enforce the caller's permissions whenever other users can reach the
/// mount.
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("vaultfs".to_string()),
        MountOption::Subtype("vaultfs".to_string()),
    ];

    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    if config.allow_other {
        options.push(MountOption::AllowOther);
    } else if config.allow_root {
        options.push(MountOption::AllowRoot);
    }

    if config.default_permissions || config.allow_other || config.allow_root {
        options.push(MountOption::DefaultPermissions);
    }

    options
}
