//! Cryptographic primitives for `stash`.
//!
//! Provides AES-GCM authenticated encryption with 128, 192, or 256-bit
//! keys, and a zeroize-on-drop key newtype. The key length selects the
//! cipher.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Key bytes are zeroized on drop and never appear in `Debug` output.

use std::fmt;

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// Authentication tag length.
pub const TAG_LEN: usize = 16;

/// Minimum ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
pub const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES key sizes accepted by [`EncryptionKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    /// 16-byte key, AES-128-GCM.
    Aes128,
    /// 24-byte key, AES-192-GCM.
    Aes192,
    /// 32-byte key, AES-256-GCM.
    Aes256,
}

impl KeySize {
    /// Every supported size, smallest first.
    pub const ALL: [Self; 3] = [Self::Aes128, Self::Aes192, Self::Aes256];

    /// Key length in bytes.
    #[must_use]
    pub fn byte_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// The size for a key of `len` bytes, if it is one of the three valid
    /// lengths.
    #[must_use]
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(Self::Aes128),
            24 => Some(Self::Aes192),
            32 => Some(Self::Aes256),
            _ => None,
        }
    }
}

/// A symmetric AES-GCM key that is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    /// Create a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is 16, 24,
    /// or 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if KeySize::from_len(bytes.len()).is_none() {
            return Err(CryptoError::InvalidKeyLength {
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Parse a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHex`] for malformed hex and
    /// [`CryptoError::InvalidKeyLength`] for a decoded length other than
    /// 16, 24, or 32 bytes.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(encoded.trim()).map_err(|e| CryptoError::InvalidHex {
            reason: e.to_string(),
        })?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate(size: KeySize) -> Self {
        let mut material = Aes256Gcm::generate_key(OsRng);
        let key = Self(material[..size.byte_len()].to_vec());
        material.as_mut_slice().zeroize();
        key
    }

    /// The cipher strength this key selects.
    #[must_use]
    pub fn size(&self) -> KeySize {
        match self.0.len() {
            16 => KeySize::Aes128,
            24 => KeySize::Aes192,
            _ => KeySize::Aes256,
        }
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care: the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("size", &self.size())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt plaintext with a fresh random nonce, using the cipher selected by
/// the key length.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match key.size() {
        KeySize::Aes128 => seal::<Aes128Gcm>(key.as_bytes(), plaintext),
        KeySize::Aes192 => seal::<Aes192Gcm>(key.as_bytes(), plaintext),
        KeySize::Aes256 => seal::<Aes256Gcm>(key.as_bytes(), plaintext),
    }
}

/// Decrypt ciphertext produced by [`encrypt`] with the same key.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input is shorter than
/// 28 bytes (nonce + tag minimum).
///
/// Returns [`CryptoError::Decryption`] if authentication fails (wrong key,
/// corrupted data, or tampered nonce or tag).
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    match key.size() {
        KeySize::Aes128 => open::<Aes128Gcm>(key.as_bytes(), combined),
        KeySize::Aes192 => open::<Aes192Gcm>(key.as_bytes(), combined),
        KeySize::Aes256 => open::<Aes256Gcm>(key.as_bytes(), combined),
    }
}

fn cipher<C: KeyInit>(key: &[u8]) -> Result<C, CryptoError> {
    C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength { actual: key.len() })
}

fn seal<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
    let cipher = cipher::<C>(key)?;
    let nonce = C::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

fn open<C>(key: &[u8], combined: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher::<C>(key)?
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip_for_every_size() {
        for size in KeySize::ALL {
            let key = EncryptionKey::generate(size);
            assert_eq!(key.as_bytes().len(), size.byte_len());
            let plaintext = b"secret data for stash";
            let ciphertext = encrypt(&key, plaintext).unwrap();
            assert_eq!(ciphertext.len(), MIN_CIPHERTEXT_LEN + plaintext.len());
            assert_eq!(decrypt(&key, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn encrypt_decrypt_empty_plaintext() {
        let key = EncryptionKey::generate(KeySize::Aes256);
        let ciphertext = encrypt(&key, b"").unwrap();
        assert_eq!(ciphertext.len(), MIN_CIPHERTEXT_LEN);
        assert!(decrypt(&key, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn only_three_key_lengths_are_accepted() {
        for len in 0..=48 {
            let result = EncryptionKey::from_bytes(&vec![7u8; len]);
            if matches!(len, 16 | 24 | 32) {
                assert_eq!(result.unwrap().size().byte_len(), len);
            } else {
                assert!(matches!(
                    result,
                    Err(CryptoError::InvalidKeyLength { actual }) if actual == len
                ));
            }
        }
    }

    #[test]
    fn hex_keys_parse() {
        let key = EncryptionKey::from_hex(&"ab".repeat(24)).unwrap();
        assert_eq!(key.size(), KeySize::Aes192);
        assert!(matches!(
            EncryptionKey::from_hex("not hex"),
            Err(CryptoError::InvalidHex { .. })
        ));
        assert!(matches!(
            EncryptionKey::from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength { actual: 2 })
        ));
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let key1 = EncryptionKey::generate(KeySize::Aes128);
        let key2 = EncryptionKey::generate(KeySize::Aes128);
        let ciphertext = encrypt(&key1, b"secret").unwrap();
        assert!(matches!(
            decrypt(&key2, &ciphertext),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn decrypt_with_other_key_size_fails() {
        let small = EncryptionKey::generate(KeySize::Aes128);
        let large = EncryptionKey::generate(KeySize::Aes256);
        let ciphertext = encrypt(&small, b"secret").unwrap();
        assert!(decrypt(&large, &ciphertext).is_err());
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate(KeySize::Aes256);
        let result = decrypt(&key, &[0u8; 10]);
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn two_encryptions_produce_different_ciphertext() {
        let key = EncryptionKey::generate(KeySize::Aes192);
        let ct1 = encrypt(&key, b"same data").unwrap();
        let ct2 = encrypt(&key, b"same data").unwrap();
        assert_ne!(ct1[..NONCE_LEN], ct2[..NONCE_LEN]);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let key = EncryptionKey::from_bytes(&[0x5Au8; 32]).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("90"));
    }
}
