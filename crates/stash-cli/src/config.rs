//! CLI configuration for `stash`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Backend-specific fields are validated by the backend itself when it is
//! constructed.

use std::fmt;
use std::path::PathBuf;

use anyhow::bail;

/// Default multipart part size for S3 uploads (16 MiB).
const DEFAULT_S3_PART_SIZE: usize = 16 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct StashConfig {
    /// Which storage medium to use.
    pub backend: BackendType,
    /// Hex-encoded AES key enabling the encryption decorator.
    pub encryption_key: Option<String>,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
}

/// Supported storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendType {
    /// In-memory (data lost when the process exits).
    Memory,
    /// One file per key under a data directory.
    File { data_dir: PathBuf },
    /// Single-table SQLite database.
    Sqlite { path: String },
    /// Redis server.
    Redis { addr: String },
    /// S3-compatible object storage.
    S3(S3Settings),
}

/// Object storage settings.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub force_path_style: bool,
    pub disable_ssl: bool,
    pub part_size: usize,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .field("force_path_style", &self.force_path_style)
            .field("disable_ssl", &self.disable_ssl)
            .field("part_size", &self.part_size)
            .finish()
    }
}

impl StashConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STASH_BACKEND`: `memory`, `file`, `sqlite`, `redis`, or `s3` (default: `file`)
    /// - `STASH_DATA_DIR`: data directory for the file backend (default: `./data`)
    /// - `STASH_SQLITE_PATH`: SQLite file or `sqlite:` DSN (default: `./data/stash.db`)
    /// - `STASH_REDIS_ADDR`: `host:port` or `redis://` URL (default: `localhost:6379`)
    /// - `STASH_S3_BUCKET`, `STASH_S3_ENDPOINT`, `STASH_S3_REGION` (default: `us-east-1`),
    ///   `STASH_S3_ACCESS_KEY`, `STASH_S3_SECRET_KEY`
    /// - `STASH_S3_FORCE_PATH_STYLE`, `STASH_S3_DISABLE_SSL`: booleans (default: `false`)
    /// - `STASH_S3_PART_SIZE`: multipart part size in bytes (default: 16 MiB)
    /// - `STASH_ENCRYPTION_KEY`: hex AES key, 16/24/32 bytes (optional)
    /// - `STASH_LOG_LEVEL`: log filter (default: `info`)
    ///
    /// # Errors
    ///
    /// Returns an error if `STASH_BACKEND` names an unknown backend.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_owned());
        let flag = |name: &str| lookup(name).is_some_and(|v| v == "true" || v == "1");

        let backend = match var("STASH_BACKEND", "file").to_lowercase().as_str() {
            "memory" => BackendType::Memory,
            "file" | "fs" => BackendType::File {
                data_dir: PathBuf::from(var("STASH_DATA_DIR", "./data")),
            },
            "sqlite" => BackendType::Sqlite {
                path: var("STASH_SQLITE_PATH", "./data/stash.db"),
            },
            "redis" => BackendType::Redis {
                addr: var("STASH_REDIS_ADDR", "localhost:6379"),
            },
            "s3" => BackendType::S3(S3Settings {
                bucket: var("STASH_S3_BUCKET", ""),
                endpoint: lookup("STASH_S3_ENDPOINT").filter(|v| !v.is_empty()),
                region: var("STASH_S3_REGION", "us-east-1"),
                access_key: var("STASH_S3_ACCESS_KEY", ""),
                secret_key: var("STASH_S3_SECRET_KEY", ""),
                force_path_style: flag("STASH_S3_FORCE_PATH_STYLE"),
                disable_ssl: flag("STASH_S3_DISABLE_SSL"),
                part_size: lookup("STASH_S3_PART_SIZE")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_S3_PART_SIZE),
            }),
            other => bail!(
                "unknown STASH_BACKEND '{other}': expected memory, file, sqlite, redis, or s3"
            ),
        };

        Ok(Self {
            backend,
            encryption_key: lookup("STASH_ENCRYPTION_KEY").filter(|v| !v.is_empty()),
            log_level: var("STASH_LOG_LEVEL", "info"),
        })
    }
}
