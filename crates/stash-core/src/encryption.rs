//! Transparent encryption for buffered backends.
//!
//! [`EncryptedBackend`] wraps any [`Backend`] and implements the same
//! contract. Every payload is sealed with AES-GCM before it reaches the
//! wrapped backend and opened on the way back out, so the medium only ever
//! holds `nonce || ciphertext || tag`. Keys (identifiers) and ttls pass
//! through untouched, which keeps the conflict and expiry rules entirely in
//! the wrapped backend.
//!
//! A blob that fails authentication is reported as
//! [`StorageError::Codec`]; corrupted plaintext is never returned.

use std::time::Duration;

use stash_storage::{Backend, Removable, StorageError, StorageResult};

use crate::crypto::{self, EncryptionKey};

/// A [`Backend`] decorator that encrypts payloads at rest.
///
/// # Examples
///
/// ```
/// # use stash_core::crypto::{EncryptionKey, KeySize};
/// # use stash_core::EncryptedBackend;
/// # use stash_storage::{Backend, MemoryBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let inner = MemoryBackend::new();
/// let backend = EncryptedBackend::new(inner.clone(), EncryptionKey::generate(KeySize::Aes256));
///
/// backend.save("note", b"attack at dawn").await.unwrap();
/// assert_eq!(backend.retrieve("note").await.unwrap(), b"attack at dawn");
/// assert_ne!(inner.retrieve("note").await.unwrap(), b"attack at dawn");
/// # }
/// ```
pub struct EncryptedBackend<B> {
    inner: B,
    key: EncryptionKey,
}

impl<B> EncryptedBackend<B> {
    /// Wrap `inner`, sealing payloads with `key`.
    pub fn new(inner: B, key: EncryptionKey) -> Self {
        Self { inner, key }
    }

    /// Build from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CryptoError::InvalidKeyLength`] unless the key is
    /// 16, 24, or 32 bytes long.
    pub fn with_key_bytes(inner: B, key: &[u8]) -> Result<Self, crate::CryptoError> {
        Ok(Self::new(inner, EncryptionKey::from_bytes(key)?))
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B> std::fmt::Debug for EncryptedBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBackend")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<B: Backend> Backend for EncryptedBackend<B> {
    async fn save_ttl(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        let sealed = crypto::encrypt(&self.key, data).map_err(|e| e.into_storage(key))?;
        self.inner.save_ttl(key, &sealed, ttl).await
    }

    async fn retrieve(&self, key: &str) -> StorageResult<Vec<u8>> {
        let sealed = self.inner.retrieve(key).await?;
        crypto::decrypt(&self.key, &sealed).map_err(|e| {
            tracing::warn!(key = %key, error = %e, "stored payload failed authentication");
            e.into_storage(key)
        })
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

#[async_trait::async_trait]
impl<B: Backend + Removable> Removable for EncryptedBackend<B> {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }
}

/// Whether `err` came from a payload that failed to decrypt.
pub fn is_codec_error(err: &StorageError) -> bool {
    matches!(err, StorageError::Codec { .. })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use stash_storage::MemoryBackend;

    use super::*;
    use crate::crypto::{KeySize, MIN_CIPHERTEXT_LEN, NONCE_LEN};

    fn wrapped(size: KeySize) -> (MemoryBackend, EncryptedBackend<MemoryBackend>) {
        let inner = MemoryBackend::new();
        let backend = EncryptedBackend::new(inner.clone(), EncryptionKey::generate(size));
        (inner, backend)
    }

    #[tokio::test]
    async fn medium_only_sees_ciphertext() {
        let (inner, backend) = wrapped(KeySize::Aes256);
        backend.save("k", b"plaintext payload").await.unwrap();

        let stored = inner.retrieve("k").await.unwrap();
        assert_eq!(stored.len(), MIN_CIPHERTEXT_LEN + b"plaintext payload".len());
        assert!(!stored.windows(9).any(|w| w == b"plaintext"));
        assert_eq!(backend.retrieve("k").await.unwrap(), b"plaintext payload");
    }

    #[tokio::test]
    async fn any_flipped_byte_fails_authentication() {
        for size in KeySize::ALL {
            let (inner, backend) = wrapped(size);
            backend.save("original", b"tamper me").await.unwrap();
            let stored = inner.retrieve("original").await.unwrap();

            // Nonce, body, and tag: every position must be covered.
            for i in 0..stored.len() {
                let mut corrupt = stored.clone();
                corrupt[i] ^= 0x01;
                let key = format!("tampered-{i}");
                inner.save(&key, &corrupt).await.unwrap();

                let err = backend.retrieve(&key).await.unwrap_err();
                assert!(
                    is_codec_error(&err),
                    "{size:?}: flip at byte {i} (nonce ends at {NONCE_LEN}) gave {err}"
                );
            }
        }
    }

    #[tokio::test]
    async fn truncated_blob_is_a_codec_error() {
        let (inner, backend) = wrapped(KeySize::Aes128);
        inner.save("short", &[0u8; 5]).await.unwrap();
        let err = backend.retrieve("short").await.unwrap_err();
        assert!(is_codec_error(&err));
        assert!(err.to_string().contains("too short"));
    }

    #[tokio::test]
    async fn conflict_and_not_found_pass_through() {
        let (_inner, backend) = wrapped(KeySize::Aes192);
        assert!(backend.retrieve("missing").await.unwrap_err().is_not_found());

        backend.save("k", b"one").await.unwrap();
        assert!(backend.save("k", b"two").await.unwrap_err().is_conflict());
        assert_eq!(backend.retrieve("k").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn different_key_cannot_read() {
        let inner = MemoryBackend::new();
        let writer = EncryptedBackend::new(inner.clone(), EncryptionKey::generate(KeySize::Aes256));
        let reader = EncryptedBackend::new(inner, EncryptionKey::generate(KeySize::Aes256));

        writer.save("k", b"secret").await.unwrap();
        assert!(is_codec_error(&reader.retrieve("k").await.unwrap_err()));
    }

    #[test]
    fn invalid_key_length_rejected_at_construction() {
        for len in [0, 1, 15, 17, 23, 25, 31, 33, 48] {
            assert!(EncryptedBackend::with_key_bytes(MemoryBackend::new(), &vec![1u8; len]).is_err());
        }
        for len in [16, 24, 32] {
            assert!(EncryptedBackend::with_key_bytes(MemoryBackend::new(), &vec![1u8; len]).is_ok());
        }
    }

    #[test]
    fn debug_does_not_leak_key() {
        let backend =
            EncryptedBackend::with_key_bytes(MemoryBackend::new(), &[0x42u8; 32]).unwrap();
        let rendered = format!("{backend:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("66"));
    }
}
