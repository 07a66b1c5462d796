//! In-memory buffered backend.
//!
//! Stores every record in a `BTreeMap` behind a `RwLock`. Nothing is
//! persisted; all data is lost when the process exits. Expiration uses the
//! Tokio clock, so tests can drive it with `tokio::time::pause`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{Backend, Removable, StorageError, StorageResult};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: &[u8], ttl: Duration) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        Self {
            data: data.to_vec(),
            expires_at,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now <= deadline)
    }
}

/// An in-memory [`Backend`].
///
/// Clones share the same underlying map.
///
/// # Examples
///
/// ```
/// # use stash_storage::{Backend, MemoryBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.save("greeting", b"hello").await.unwrap();
/// assert_eq!(backend.retrieve("greeting").await.unwrap(), b"hello");
/// assert!(backend.save("greeting", b"again").await.unwrap_err().is_conflict());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the map holds no records at all.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn save_ttl(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        let mut map = self.data.write().await;
        if map.get(key).is_some_and(|e| e.is_live(Instant::now())) {
            return Err(StorageError::conflict(key));
        }
        map.insert(key.to_owned(), Entry::new(data, ttl));
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StorageResult<Vec<u8>> {
        {
            let map = self.data.read().await;
            match map.get(key) {
                None => return Err(StorageError::not_found(key)),
                Some(entry) if entry.is_live(Instant::now()) => return Ok(entry.data.clone()),
                Some(_) => {}
            }
        }

        // Expired: evict on access, unless a writer replaced it meanwhile.
        let mut map = self.data.write().await;
        match map.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(entry.data.clone()),
            Some(_) => {
                map.remove(key);
                tracing::debug!(key = %key, "evicted expired record");
                Err(StorageError::not_found(key))
            }
            None => Err(StorageError::not_found(key)),
        }
    }
}

#[async_trait::async_trait]
impl Removable for MemoryBackend {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retrieve_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.retrieve("does/not/exist").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn save_and_retrieve_roundtrip() {
        let backend = MemoryBackend::new();
        backend.save("k", b"hello").await.unwrap();
        assert_eq!(backend.retrieve("k").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn second_save_conflicts_and_keeps_payload() {
        let backend = MemoryBackend::new();
        backend.save("k", b"v1").await.unwrap();
        let err = backend.save("k", b"v2").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(backend.retrieve("k").await.unwrap(), b"v1");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_record_is_evicted_on_retrieve() {
        let backend = MemoryBackend::new();
        backend
            .save_ttl("k", b"v", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(backend.retrieve("k").await.unwrap(), b"v");

        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(backend.retrieve("k").await.unwrap_err().is_not_found());
        assert!(backend.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_clears_conflict() {
        let backend = MemoryBackend::new();
        backend
            .save_ttl("k", b"old", Duration::from_millis(500))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        backend
            .save_ttl("k", b"new", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(backend.retrieve("k").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.delete("nope").await.unwrap();
        backend.save("k", b"v").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(backend.retrieve("k").await.unwrap_err().is_not_found());
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.save("k", b"v").await.unwrap();
        assert_eq!(clone.retrieve("k").await.unwrap(), b"v");
    }
}
