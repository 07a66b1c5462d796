//! Storage contracts for `stash`.
//!
//! This crate defines the contracts every storage medium must satisfy:
//! write-once-per-key semantics, optional expiration, and streaming-safe
//! retrieval.
//!
//! - [`Backend`]: buffered save/retrieve of whole payloads.
//! - [`StreamBackend`]: the same semantics over [`AsyncRead`] streams, for
//!   payloads too large to hold in memory.
//! - [`Removable`]: idempotent deletion, composable onto either contract.
//!
//! A save fails with [`StorageError::Conflict`] while a live record exists
//! for the key. A record whose ttl has elapsed is reported as
//! [`StorageError::NotFound`], exactly like one that never existed, and is
//! evicted the next time it is accessed.
//!
//! Implementations:
//!
//! - [`MemoryBackend`]: in-process buffered store, for development and tests
//! - [`FileBackend`]: one file per key (feature `file-backend`)
//! - [`SqliteBackend`]: single relational table (feature `sqlite-backend`)
//! - [`RedisBackend`]: native `SET NX` with expiry (feature `redis-backend`)
//! - [`S3Backend`]: one object per key (feature `s3-backend`)

mod cancel;
mod error;
mod memory;
pub mod ttl;

#[cfg(feature = "file-backend")]
mod file_backend;
#[cfg(feature = "redis-backend")]
mod redis_backend;
#[cfg(feature = "s3-backend")]
mod s3_backend;
#[cfg(feature = "sqlite-backend")]
mod sqlite_backend;
#[cfg(feature = "testing")]
pub mod testing;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;

pub use cancel::{CancelReader, CancelToken, Cancelled, is_cancelled_io};
pub use error::{ErrorKind, StorageError, StorageResult};
#[cfg(feature = "file-backend")]
pub use file_backend::{FileBackend, FileConfig};
pub use memory::MemoryBackend;
#[cfg(feature = "redis-backend")]
pub use redis_backend::{RedisBackend, RedisConfig};
#[cfg(feature = "s3-backend")]
pub use s3_backend::{S3Backend, S3Config};
#[cfg(feature = "sqlite-backend")]
pub use sqlite_backend::{SqliteBackend, SqliteConfig};

/// An owned, closable byte stream. Dropping it releases the underlying
/// handle.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Buffered storage: whole payloads in memory.
///
/// Implementations must be safe to share across async tasks. Dropping a
/// returned future abandons the call.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Store `data` under `key` without expiration.
    ///
    /// # Errors
    ///
    /// See [`save_ttl`](Backend::save_ttl).
    async fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.save_ttl(key, data, Duration::ZERO).await
    }

    /// Store `data` under `key`, expiring after `ttl` (zero = never).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if a live record already exists for
    /// `key`; any other variant means the medium failed.
    async fn save_ttl(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()>;

    /// Fetch the payload stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no live record exists.
    async fn retrieve(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Release the backend's connection or handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to shut down cleanly.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Streaming storage: payloads flow through [`AsyncRead`] streams.
///
/// Every transfer observes a [`CancelToken`]; once it fires the transfer
/// stops promptly with [`StorageError::Cancelled`] and no partial record is
/// left behind.
#[async_trait::async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// Stream `reader` into `key` without expiration.
    ///
    /// # Errors
    ///
    /// See [`save_ttl`](StreamBackend::save_ttl).
    async fn save(&self, cancel: &CancelToken, key: &str, reader: BoxReader) -> StorageResult<u64> {
        self.save_ttl(cancel, key, reader, Duration::ZERO).await
    }

    /// Stream `reader` into `key`, expiring after `ttl` (zero = never).
    /// Returns the number of payload bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if a live record already exists,
    /// [`StorageError::Cancelled`] if `cancel` fired mid-transfer.
    async fn save_ttl(
        &self,
        cancel: &CancelToken,
        key: &str,
        reader: BoxReader,
        ttl: Duration,
    ) -> StorageResult<u64>;

    /// Open the payload stored under `key` for streaming. The returned
    /// reader fails with a [`Cancelled`] I/O error once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no live record exists.
    async fn retrieve(&self, cancel: &CancelToken, key: &str) -> StorageResult<BoxReader>;

    /// Release the backend's connection or handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to shut down cleanly.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Explicit deletion.
#[async_trait::async_trait]
pub trait Removable: Send + Sync + 'static {
    /// Delete `key`. Deleting a key that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the medium fails.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// A buffered backend that also supports deletion.
pub trait RemovableBackend: Backend + Removable {}

impl<T: Backend + Removable + ?Sized> RemovableBackend for T {}

/// A streaming backend that also supports deletion.
pub trait RemovableStreamBackend: StreamBackend + Removable {}

impl<T: StreamBackend + Removable + ?Sized> RemovableStreamBackend for T {}

#[async_trait::async_trait]
impl<T: Backend + ?Sized> Backend for Arc<T> {
    async fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        (**self).save(key, data).await
    }

    async fn save_ttl(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        (**self).save_ttl(key, data, ttl).await
    }

    async fn retrieve(&self, key: &str) -> StorageResult<Vec<u8>> {
        (**self).retrieve(key).await
    }

    async fn close(&self) -> StorageResult<()> {
        (**self).close().await
    }
}

#[async_trait::async_trait]
impl<T: StreamBackend + ?Sized> StreamBackend for Arc<T> {
    async fn save(&self, cancel: &CancelToken, key: &str, reader: BoxReader) -> StorageResult<u64> {
        (**self).save(cancel, key, reader).await
    }

    async fn save_ttl(
        &self,
        cancel: &CancelToken,
        key: &str,
        reader: BoxReader,
        ttl: Duration,
    ) -> StorageResult<u64> {
        (**self).save_ttl(cancel, key, reader, ttl).await
    }

    async fn retrieve(&self, cancel: &CancelToken, key: &str) -> StorageResult<BoxReader> {
        (**self).retrieve(cancel, key).await
    }

    async fn close(&self) -> StorageResult<()> {
        (**self).close().await
    }
}

#[async_trait::async_trait]
impl<T: Removable + ?Sized> Removable for Arc<T> {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key).await
    }
}
