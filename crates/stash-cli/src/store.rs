//! Backend wiring for the CLI.
//!
//! Turns a [`StashConfig`] into a ready backend and runs the three commands
//! against whichever contract that backend implements. Buffered calls are
//! cancelled by dropping them; streaming calls hand the token to the
//! backend so it can clean up partial uploads itself.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use stash_core::EncryptedBackend;
use stash_core::crypto::EncryptionKey;
use stash_storage::{
    Backend, BoxReader, CancelToken, FileBackend, FileConfig, MemoryBackend, Removable,
    RemovableBackend, RemovableStreamBackend, StorageError, StreamBackend, is_cancelled_io,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::config::{BackendType, StashConfig};

type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// An opened backend, tagged with the contract it implements.
pub enum Store {
    Buffered(Arc<dyn RemovableBackend>),
    Streaming(Arc<dyn RemovableStreamBackend>),
}

/// Open the backend selected by `config`, wrapped in the encryption
/// decorator when a key is configured.
///
/// # Errors
///
/// Returns an error if the key is malformed, the backend is not compiled in,
/// or the backend fails its construction checks.
pub async fn open(config: &StashConfig) -> Result<Store> {
    let key = config
        .encryption_key
        .as_deref()
        .map(EncryptionKey::from_hex)
        .transpose()
        .context("invalid STASH_ENCRYPTION_KEY")?;

    let store = match &config.backend {
        BackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            buffered(MemoryBackend::new(), key)
        }
        BackendType::File { data_dir } => {
            info!(path = %data_dir.display(), "using file storage");
            let backend = FileBackend::open(FileConfig::new(data_dir.clone()))
                .await
                .context("failed to open file storage")?;
            streaming(backend, key.as_ref())?
        }
        #[cfg(feature = "sqlite-backend")]
        BackendType::Sqlite { path } => {
            info!(path = %path, "using SQLite storage");
            ensure_parent_dir(path).await?;
            let backend =
                stash_storage::SqliteBackend::connect(stash_storage::SqliteConfig::new(path.clone()))
                    .await
                    .context("failed to open SQLite storage")?;
            buffered(backend, key)
        }
        #[cfg(not(feature = "sqlite-backend"))]
        BackendType::Sqlite { .. } => {
            bail!("SQLite backend requested but feature 'sqlite-backend' is not enabled");
        }
        #[cfg(feature = "redis-backend")]
        BackendType::Redis { addr } => {
            info!(addr = %addr, "using Redis storage");
            let backend =
                stash_storage::RedisBackend::connect(stash_storage::RedisConfig::new(addr.clone()))
                    .await
                    .context("failed to connect to Redis storage")?;
            buffered(backend, key)
        }
        #[cfg(not(feature = "redis-backend"))]
        BackendType::Redis { .. } => {
            bail!("Redis backend requested but feature 'redis-backend' is not enabled");
        }
        #[cfg(feature = "s3-backend")]
        BackendType::S3(s3) => {
            info!(bucket = %s3.bucket, endpoint = ?s3.endpoint, "using S3 storage");
            let backend = stash_storage::S3Backend::connect(stash_storage::S3Config {
                bucket: s3.bucket.clone(),
                endpoint: s3.endpoint.clone(),
                region: s3.region.clone(),
                access_key: s3.access_key.clone(),
                secret_key: s3.secret_key.clone(),
                force_path_style: s3.force_path_style,
                disable_ssl: s3.disable_ssl,
                part_size: s3.part_size,
            })
            .await
            .context("failed to connect to S3 storage")?;
            streaming(backend, key.as_ref())?
        }
        #[cfg(not(feature = "s3-backend"))]
        BackendType::S3(_) => {
            bail!("S3 backend requested but feature 's3-backend' is not enabled");
        }
    };
    Ok(store)
}

fn buffered<B: Backend + Removable>(backend: B, key: Option<EncryptionKey>) -> Store {
    match key {
        Some(key) => {
            info!(size = ?key.size(), "encrypting payloads at rest");
            Store::Buffered(Arc::new(EncryptedBackend::new(backend, key)))
        }
        None => Store::Buffered(Arc::new(backend)),
    }
}

fn streaming<B: StreamBackend + Removable>(
    backend: B,
    key: Option<&EncryptionKey>,
) -> Result<Store> {
    if key.is_some() {
        bail!("STASH_ENCRYPTION_KEY requires a buffered backend (memory, sqlite, or redis)");
    }
    Ok(Store::Streaming(Arc::new(backend)))
}

#[cfg(feature = "sqlite-backend")]
async fn ensure_parent_dir(path: &str) -> Result<()> {
    if path.starts_with("sqlite:") {
        return Ok(());
    }
    let parent = Path::new(path).parent().unwrap_or_else(|| Path::new(""));
    if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create directory {}", parent.display()))?;
    }
    Ok(())
}

impl Store {
    /// Store the payload read from `source` (stdin when `None`). Returns the
    /// number of payload bytes stored.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`] (conflict, cancellation, ...)
    /// or an I/O error reading the input.
    pub async fn put(
        &self,
        cancel: &CancelToken,
        key: &str,
        source: Option<&Path>,
        ttl: Duration,
    ) -> Result<u64> {
        match self {
            Self::Buffered(backend) => {
                let data = read_input(source).await?;
                let len = data.len() as u64;
                until_cancelled(cancel, backend.save_ttl(key, &data, ttl)).await?;
                Ok(len)
            }
            Self::Streaming(backend) => {
                let reader = open_input(source).await?;
                Ok(backend.save_ttl(cancel, key, reader, ttl).await?)
            }
        }
    }

    /// Copy the payload stored under `key` to `output` (stdout when `None`).
    /// Returns the number of bytes written.
    ///
    /// The output file is only created once the record has been found.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`] (not found, cancellation, ...)
    /// or an I/O error writing the output.
    pub async fn get(&self, cancel: &CancelToken, key: &str, output: Option<&Path>) -> Result<u64> {
        match self {
            Self::Buffered(backend) => {
                let data = until_cancelled(cancel, backend.retrieve(key)).await?;
                let mut out = open_output(output).await?;
                out.write_all(&data).await.context("failed to write output")?;
                out.flush().await.context("failed to write output")?;
                Ok(data.len() as u64)
            }
            Self::Streaming(backend) => {
                let mut reader = backend.retrieve(cancel, key).await?;
                let mut out = open_output(output).await?;
                let copied = tokio::io::copy(&mut reader, &mut out).await.map_err(|e| {
                    if is_cancelled_io(&e) {
                        anyhow::Error::new(StorageError::Cancelled)
                    } else {
                        anyhow::Error::new(e).context("failed to stream payload")
                    }
                })?;
                out.flush().await.context("failed to write output")?;
                Ok(copied)
            }
        }
    }

    /// Delete `key`. Succeeds if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`] if the medium fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::Buffered(backend) => backend.delete(key).await?,
            Self::Streaming(backend) => backend.delete(key).await?,
        }
        Ok(())
    }

    /// Release the backend's connection or handle.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`] if shutdown fails.
    pub async fn close(&self) -> Result<()> {
        match self {
            Self::Buffered(backend) => backend.close().await?,
            Self::Streaming(backend) => backend.close().await?,
        }
        Ok(())
    }
}

async fn until_cancelled<T>(
    cancel: &CancelToken,
    call: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StorageError::Cancelled),
        result = call => result,
    }
}

async fn read_input(source: Option<&Path>) -> Result<Vec<u8>> {
    match source {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display())),
        None => {
            let mut data = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("cannot read stdin")?;
            Ok(data)
        }
    }
}

async fn open_input(source: Option<&Path>) -> Result<BoxReader> {
    match source {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            Ok(Box::pin(file))
        }
        None => Ok(Box::pin(tokio::io::stdin())),
    }
}

async fn open_output(output: Option<&Path>) -> Result<BoxWriter> {
    match output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?;
            Ok(Box::pin(file))
        }
        None => Ok(Box::pin(tokio::io::stdout())),
    }
}
