//! Configuration management for vaultfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default attribute/entry TTL handed to the kernel, in seconds
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing vault configuration
    pub vault: VaultConfig,

    /// Key derivation configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Backing directory and creation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Real directory holding the stored files
    pub root: PathBuf,

    /// Encrypt files created through the mount
    pub encrypt_new_files: bool,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (generated by `init`)
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Let the kernel check permissions against the reported mode and owner
    ///
    /// Always in effect when other users can reach the mount.
    #[serde(default = "default_true")]
    pub default_permissions: bool,

    /// Kernel attribute cache TTL in seconds
    pub attr_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vault: VaultConfig::default(),
            encryption: EncryptionConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            root: PathBuf::new(),
            encrypt_new_files: true,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(), // Will be generated on init
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/vaultfs"),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            default_permissions: true,
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
        }
    }
}

impl Config {
    /// Default config location (`~/.config/vaultfs/config.json`)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultfs")
            .join("config.json")
    }

    /// Create a config for a vault root with default parameters
    pub fn for_root<P: Into<PathBuf>>(root: P) -> Self {
        let mut config = Config::default();
        config.vault.root = root.into();
        config
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("VAULTFS_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.vault.root = PathBuf::from(root);
            }
        }

        if let Ok(value) = std::env::var("VAULTFS_ENCRYPT_NEW_FILES") {
            if let Some(flag) = parse_bool(&value) {
                self.vault.encrypt_new_files = flag;
            }
        }

        if let Ok(value) = std::env::var("VAULTFS_ALLOW_OTHER") {
            if let Some(flag) = parse_bool(&value) {
                self.mount.allow_other = flag;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.vault.root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Vault root directory is required".to_string(),
            ));
        }

        if self.encryption.argon2_memory_kib == 0
            || self.encryption.argon2_iterations == 0
            || self.encryption.argon2_parallelism == 0
        {
            return Err(Error::InvalidConfig(
                "Argon2 parameters must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::for_root("/srv/vault");
        config.encryption.salt = vec![0xab; 16];
        config.vault.encrypt_new_files = false;
        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains(&"ab".repeat(16)));

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.encryption.salt, vec![0xab; 16]);
        assert!(!loaded.vault.encrypt_new_files);
    }

    #[test]
    fn test_validate_requires_root() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_argon2() {
        let mut config = Config::for_root("/srv/vault");
        config.encryption.argon2_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = Config::load(dir.path().join("missing.json"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_default_permissions_defaults_on() {
        assert!(MountConfig::default().default_permissions);

        // Configs written before the field existed still load with it on
        let json = r#"{"mount_point": "/mnt/v", "allow_other": true, "allow_root": false,
            "auto_unmount": true, "attr_ttl_secs": 1}"#;
        let mount: MountConfig = serde_json::from_str(json).unwrap();
        assert!(mount.default_permissions);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
