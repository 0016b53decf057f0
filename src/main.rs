//! vaultfs - Transparent-encryption overlay filesystem
//!
//! Usage:
//!   vaultfs init --root <dir>        - Create a configuration for a vault
//!   vaultfs mount <mount_point>      - Mount the vault
//!   vaultfs unmount <mount_point>    - Unmount
//!   vaultfs encrypt <path>           - Encrypt a vault file in place
//!   vaultfs decrypt <path>           - Decrypt a vault file in place
//!   vaultfs status [<path>]          - Show configuration or a file's state

use clap::{Parser, Subcommand};
use nix::sys::stat::{umask, Mode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vaultfs::{
    config::Config,
    crypto::{derive_key, generate_salt, MountKey},
    fs::{mount_options, VaultFs},
    vault::{FileAccess, MountContext, PathMapper, VaultPath, VirtualPath, XattrFlagStore},
    Error, Result,
};

/// Environment variable holding the passphrase for non-interactive use
const KEY_ENV: &str = "VAULTFS_KEY";

#[derive(Parser)]
#[command(name = "vaultfs")]
#[command(author = "vaultfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Transparent-encryption overlay filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/vaultfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a configuration for a vault directory
    Init {
        /// Real directory holding the stored files
        #[arg(long)]
        root: PathBuf,

        /// Store files created through the mount as plaintext
        #[arg(long)]
        plaintext_new_files: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Vault directory (overrides the configuration)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Encrypt a vault file in place
    Encrypt {
        /// File path, relative to the vault root
        path: PathBuf,
    },

    /// Decrypt a vault file in place
    Decrypt {
        /// File path, relative to the vault root
        path: PathBuf,
    },

    /// Show configuration, or the state of one vault file
    Status {
        /// File path, relative to the vault root
        path: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            root,
            plaintext_new_files,
        } => cmd_init(config_path, &root, !plaintext_new_files),

        Commands::Mount {
            mount_point,
            root,
            allow_other,
        } => cmd_mount(config_path, &mount_point, root, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Encrypt { path } => cmd_set_encryption(config_path, &path, true),

        Commands::Decrypt { path } => cmd_set_encryption(config_path, &path, false),

        Commands::Status { path } => cmd_status(config_path, path.as_deref()),
    }
}

fn cmd_init(config_path: &Path, root: &Path, encrypt_new_files: bool) -> Result<()> {
    info!("Initializing vaultfs...");

    std::fs::create_dir_all(root)?;
    let root = root.canonicalize()?;
    XattrFlagStore::probe(&root)?;

    let mut config = Config::for_root(&root);
    config.vault.encrypt_new_files = encrypt_new_files;
    config.encryption.salt = generate_salt().to_vec();
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Vault directory: {:?}", root);
    info!("");
    info!("Next step:");
    info!("  Run 'vaultfs mount <mount_point>' to mount the vault");

    Ok(())
}

/// Read the passphrase and derive the mount key
fn load_key(config: &Config) -> Result<MountKey> {
    let passphrase = match std::env::var(KEY_ENV) {
        Ok(value) if !value.is_empty() => value,
        _ => rpassword::prompt_password("Enter encryption password: ")
            .map_err(|e| Error::Internal(e.to_string()))?,
    };

    let derived = derive_key(passphrase.as_bytes(), &config.encryption.salt, &config.encryption)?;
    Ok(MountKey::from(derived))
}

fn open_context(config: &Config) -> Result<MountContext> {
    let key = load_key(config)?;
    MountContext::new(key, &config.vault.root, config.vault.encrypt_new_files)
}

/// Resolve a user-supplied file path to its vault path
///
/// Absolute paths must lie inside the vault root; relative ones are taken
/// from the root.
fn vault_file(mapper: &PathMapper, path: &Path) -> Result<VaultPath> {
    let virt = if path.is_absolute() {
        let path = path.canonicalize()?;
        mapper.to_virtual(&path).ok_or_else(|| {
            Error::InvalidPath(format!("{:?} is outside the vault {:?}", path, mapper.root()))
        })?
    } else {
        VirtualPath::new(Path::new("/").join(path))?
    };
    Ok(mapper.map(&virt))
}

fn cmd_mount(
    config_path: &Path,
    mount_point: &Path,
    root: Option<PathBuf>,
    allow_other: bool,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other |= allow_other;
    if let Some(root) = root {
        config.vault.root = root;
    }

    info!("Starting vaultfs...");

    // Modes requested through the mount are applied as given
    umask(Mode::empty());

    let context = open_context(&config)?;
    XattrFlagStore::probe(context.root())?;

    // Create filesystem
    let ttl = Duration::from_secs(config.mount.attr_ttl_secs);
    let fs = VaultFs::new(context, ttl)?;

    // Ensure mount point exists
    std::fs::create_dir_all(mount_point)?;

    info!("Mounting {:?} at {:?}", config.vault.root, mount_point);

    // vaultfs stays attached to the terminal until unmounted
    info!("Use 'vaultfs unmount {:?}' or Ctrl-C to stop", mount_point);

    let options = mount_options(&config.mount);
    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    info!("vaultfs stopped");
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_set_encryption(config_path: &Path, path: &Path, encrypt: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let context = open_context(&config)?;
    let target = vault_file(&context.mapper(), path)?;
    let access = context.file_access()?;

    if access.set_encryption(&target, encrypt)? {
        info!(
            "{:?} is now {}",
            target.as_path(),
            if encrypt { "encrypted" } else { "plaintext" }
        );
    } else {
        info!("{:?} unchanged", target.as_path());
    }

    Ok(())
}

fn cmd_status(config_path: &Path, path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    let Some(path) = path else {
        println!("vaultfs Status");
        println!("==============");
        println!();
        println!("Configuration: {:?}", config_path);
        println!("Vault directory: {:?}", config.vault.root);
        println!(
            "New files: {}",
            if config.vault.encrypt_new_files { "encrypted" } else { "plaintext" }
        );
        println!("Default mount point: {:?}", config.mount.mount_point);
        println!(
            "Argon2id: {} KiB, {} iterations, parallelism {}",
            config.encryption.argon2_memory_kib,
            config.encryption.argon2_iterations,
            config.encryption.argon2_parallelism
        );
        println!(
            "Salt: {}",
            if config.encryption.salt.is_empty() { "missing (run 'vaultfs init')" } else { "present" }
        );
        match XattrFlagStore::probe(&config.vault.root) {
            Ok(()) => println!("Extended attributes: supported"),
            Err(e) => println!("Extended attributes: unavailable - {}", e),
        }
        return Ok(());
    };

    let context = open_context(&config)?;
    let target = vault_file(&context.mapper(), path)?;
    let access = context.file_access()?;
    let meta = std::fs::symlink_metadata(&target)?;

    println!("File: {:?}", target.as_path());
    println!("Stored size: {} bytes", meta.len());
    match plaintext_size(&access, &target, &meta)? {
        Some(size) => {
            println!("State: encrypted");
            println!("Plaintext size: {} bytes", size);
        }
        None => println!("State: plaintext"),
    }

    Ok(())
}

/// Logical size of an encrypted file, `None` for plaintext
fn plaintext_size(
    access: &FileAccess,
    target: &VaultPath,
    meta: &std::fs::Metadata,
) -> Result<Option<u64>> {
    if !access.is_encrypted(target)? {
        return Ok(None);
    }
    Ok(Some(access.logical_len(target, meta)?))
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
