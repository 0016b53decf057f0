//! AES-256-GCM content cipher
//!
//! Stored layout: `MAGIC (4) || nonce (12) || ciphertext || tag (16)`.
//!
//! The nonce is a keyed BLAKE3 hash of the plaintext, so encryption is
//! deterministic for a given key: equal plaintexts give equal ciphertexts,
//! and distinct plaintexts never share a nonce.

use crate::crypto::{Cipher, MountKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use zeroize::Zeroizing;

/// Leading bytes of every stored ciphertext
pub const FORMAT_MAGIC: &[u8; 4] = b"VFS1";

/// Bytes added to every plaintext
pub const CIPHERTEXT_OVERHEAD: usize = FORMAT_MAGIC.len() + NONCE_SIZE + TAG_SIZE;

const AEAD_KEY_CONTEXT: &str = "vaultfs 2024 file content aead key";
const NONCE_KEY_CONTEXT: &str = "vaultfs 2024 file content nonce key";

/// Cipher bound to a mount key
pub struct AeadCipher {
    key: LessSafeKey,
    nonce_key: Zeroizing<[u8; 32]>,
}

impl AeadCipher {
    /// Build the cipher, deriving independent sub-keys from the mount key
    pub fn new(key: &MountKey) -> Result<Self> {
        let aead_key = Zeroizing::new(blake3::derive_key(AEAD_KEY_CONTEXT, key.as_bytes()));
        let nonce_key = Zeroizing::new(blake3::derive_key(NONCE_KEY_CONTEXT, key.as_bytes()));

        let unbound = UnboundKey::new(&AES_256_GCM, &aead_key[..])
            .map_err(|_| Error::Encryption("Invalid AES-256-GCM key".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce_key,
        })
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_SIZE] {
        let hash = blake3::keyed_hash(&self.nonce_key, plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&hash.as_bytes()[..NONCE_SIZE]);
        nonce
    }
}

impl Cipher for AeadCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.synthetic_nonce(plaintext);

        let mut in_out = Vec::with_capacity(plaintext.len() + CIPHERTEXT_OVERHEAD);
        in_out.extend_from_slice(plaintext);

        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(FORMAT_MAGIC),
                &mut in_out,
            )
            .map_err(|_| Error::Encryption("AES-256-GCM seal failed".to_string()))?;

        let mut out = Vec::with_capacity(in_out.len() + FORMAT_MAGIC.len() + NONCE_SIZE);
        out.extend_from_slice(FORMAT_MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < CIPHERTEXT_OVERHEAD {
            return Err(Error::Decryption(format!(
                "Ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let (magic, rest) = ciphertext.split_at(FORMAT_MAGIC.len());
        if magic != FORMAT_MAGIC {
            return Err(Error::Decryption("Unknown ciphertext format".to_string()));
        }

        let (nonce_bytes, sealed) = rest.split_at(NONCE_SIZE);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Decryption("Invalid nonce".to_string()))?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(FORMAT_MAGIC), &mut in_out)
            .map_err(|_| {
                Error::Decryption("Authentication failed (wrong key or corrupt data)".to_string())
            })?;
        let len = plaintext.len();

        in_out.truncate(len);
        Ok(in_out)
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64> {
        ciphertext_len.checked_sub(CIPHERTEXT_OVERHEAD as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;

    fn cipher(byte: u8) -> AeadCipher {
        AeadCipher::new(&MountKey::from_bytes([byte; KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher(7);
        let cases: [&[u8]; 4] = [b"", b"a", b"hello world", &[0u8; 4096]];
        for data in cases {
            let sealed = c.encrypt(data).unwrap();
            assert_eq!(sealed.len(), data.len() + CIPHERTEXT_OVERHEAD);
            assert_eq!(c.decrypt(&sealed).unwrap(), data);
        }
    }

    #[test]
    fn test_deterministic() {
        let c = cipher(1);
        assert_eq!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"diff").unwrap());
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let c = cipher(1);
        let sealed = c.encrypt(b"secret message").unwrap();
        assert!(!sealed.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher(1).encrypt(b"data").unwrap();
        let result = cipher(2).decrypt(&sealed);
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[test]
    fn test_tampered_fails() {
        let c = cipher(3);
        let mut sealed = c.encrypt(b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(c.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_short_and_foreign_input() {
        let c = cipher(3);
        assert!(c.decrypt(b"VFS1").is_err());
        assert!(c.decrypt(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_plaintext_len() {
        let c = cipher(0);
        assert_eq!(c.plaintext_len(CIPHERTEXT_OVERHEAD as u64 + 5), Some(5));
        assert_eq!(c.plaintext_len(3), None);
    }
}
