//! Error types for `stash-core`.
//!
//! Crypto errors never include key material, only lengths and operation
//! descriptions.

use stash_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key is not 16, 24, or 32 bytes long.
    #[error("invalid key length {actual}: expected 16, 24, or 32 bytes")]
    InvalidKeyLength { actual: usize },

    /// The key is not valid hex.
    #[error("invalid hex key: {reason}")]
    InvalidHex { reason: String },

    /// AES-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

impl CryptoError {
    /// Report this failure as a [`StorageError::Codec`] for `key`.
    #[must_use]
    pub fn into_storage(self, key: &str) -> StorageError {
        StorageError::Codec {
            key: key.to_owned(),
            reason: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use stash_storage::ErrorKind;

    use super::*;

    #[test]
    fn codec_errors_are_unexpected() {
        let err = CryptoError::Decryption {
            reason: "aead::Error".to_owned(),
        }
        .into_storage("blob");
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(
            err.to_string(),
            "payload codec failed for key 'blob': decryption failed: aead::Error"
        );
    }
}
