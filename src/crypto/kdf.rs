//! Key derivation using Argon2id
//!
//! The passphrase given at mount time is stretched into the mount key with
//! the salt stored in the configuration file.

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Derived key with associated salt
#[derive(Clone)]
pub struct DerivedKey {
    /// The derived key material (zeroized on drop)
    key: Zeroizing<[u8; KEY_SIZE]>,
    /// Salt used for derivation
    salt: [u8; SALT_SIZE],
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Get the salt
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

/// Derive the mount key from a passphrase
///
/// The salt must be at least [`SALT_SIZE`] bytes; only the first
/// [`SALT_SIZE`] are used.
pub fn derive_key(passphrase: &[u8], salt: &[u8], config: &EncryptionConfig) -> Result<DerivedKey> {
    if salt.len() < SALT_SIZE {
        return Err(Error::KeyDerivation(format!(
            "Salt too short: {} bytes, need {}",
            salt.len(),
            SALT_SIZE
        )));
    }
    if passphrase.is_empty() {
        return Err(Error::KeyDerivation("Empty passphrase".to_string()));
    }

    let mut salt_bytes = [0u8; SALT_SIZE];
    salt_bytes.copy_from_slice(&salt[..SALT_SIZE]);

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key_bytes = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase, &salt_bytes, key_bytes.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey {
        key: key_bytes,
        salt: salt_bytes,
    })
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
