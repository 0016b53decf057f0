//! Cryptographic primitives
//!
//! - [`Cipher`]: whole-buffer encrypt/decrypt capability used by the vault
//! - [`AeadCipher`]: AES-256-GCM implementation with synthetic nonces
//! - [`MountKey`]: the per-mount secret, derived with Argon2id

mod aead;
mod kdf;

pub use aead::{AeadCipher, CIPHERTEXT_OVERHEAD, FORMAT_MAGIC};
pub use kdf::{derive_key, generate_salt, DerivedKey};

use crate::error::Result;
use zeroize::Zeroizing;

/// Size of the mount key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the key derivation salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of the AEAD nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Whole-buffer content transform
///
/// Callers must materialize the full file before calling either method, so
/// the largest file the vault can hold is bounded by available memory.
/// Implementations must guarantee `decrypt(encrypt(x)) == x` for every `x`.
pub trait Cipher: Send + Sync {
    /// Turn plaintext into the bytes stored in the vault
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Recover plaintext, failing rather than returning garbage
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Plaintext length for a stored ciphertext of `ciphertext_len` bytes
    ///
    /// `None` when that many bytes cannot be a valid ciphertext.
    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64>;
}

/// Secret key held for the lifetime of a mount
#[derive(Clone)]
pub struct MountKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl MountKey {
    /// Wrap raw key material
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        MountKey {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl From<DerivedKey> for MountKey {
    fn from(derived: DerivedKey) -> Self {
        MountKey::from_bytes(*derived.key())
    }
}

impl std::fmt::Debug for MountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MountKey(..)")
    }
}
