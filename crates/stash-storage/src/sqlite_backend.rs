//! SQLite buffered backend.
//!
//! Stores every record in a single `backend_sqlite_data` table:
//!
//! | column    | type    | meaning |
//! |-----------|---------|---------|
//! | `id`      | TEXT    | primary key |
//! | `data`    | BLOB    | payload |
//! | `created` | INTEGER | creation time, Unix nanoseconds |
//! | `expires` | INTEGER | expiry time, Unix nanoseconds; NULL = never |
//!
//! Feature-gated behind `sqlite-backend`. Uses `sqlx` with the Tokio runtime,
//! so no `spawn_blocking` is needed. Saves are a single conditional upsert
//! inside a transaction, which makes the conflict check atomic.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::{Backend, Removable, StorageError, StorageResult};

const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Configuration for [`SqliteBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database file path, or a `sqlite:` DSN.
    pub path: String,
    /// Connection pool size (forced to 1 for in-memory databases).
    pub max_connections: u32,
}

impl SqliteConfig {
    /// Configuration for the database at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the path is empty or the pool
    /// size is zero.
    pub fn validate(&self) -> StorageResult<()> {
        if self.path.trim().is_empty() {
            return Err(StorageError::Config {
                reason: "sqlite db path cannot be empty".to_owned(),
            });
        }
        if self.max_connections == 0 {
            return Err(StorageError::Config {
                reason: "sqlite max_connections must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        self.path.contains(":memory:") || self.path.contains("mode=memory")
    }
}

/// A [`Backend`] backed by a SQLite database.
///
/// Thread-safe via `SqlitePool`; clones share the pool.
///
/// # Examples
///
/// ```no_run
/// # use stash_storage::{SqliteBackend, SqliteConfig};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = SqliteBackend::connect(SqliteConfig::new("/var/lib/stash/stash.db"))
///     .await
///     .unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("pool", &"[SqlitePool]")
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open the database and run the initial migration.
    ///
    /// Creates the database file and the `backend_sqlite_data` table if they
    /// do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] for an invalid configuration and
    /// [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(config: SqliteConfig) -> StorageResult<Self> {
        config.validate()?;
        let open_err = |reason: String| StorageError::Open {
            path: config.path.clone(),
            reason,
        };

        let options = if config.path.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(&config.path).map_err(|e| open_err(e.to_string()))?
        } else {
            SqliteConnectOptions::new().filename(&config.path)
        }
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

        let mut pool_options = SqlitePoolOptions::new();
        if config.is_in_memory() {
            // Every connection to `:memory:` is a separate database.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(config.max_connections);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| open_err(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backend_sqlite_data (\
                id      TEXT    PRIMARY KEY, \
                data    BLOB    NOT NULL, \
                created INTEGER NOT NULL, \
                expires INTEGER\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| open_err(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Return a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    async fn save_ttl(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        let now = now_nanos();
        let expires = expires_nanos(now, ttl);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })?;

        // The WHERE clause is the conflict check: an existing row is only
        // replaced once it has expired, so zero affected rows means a live
        // record is in the way.
        let result = sqlx::query(
            "INSERT INTO backend_sqlite_data (id, data, created, expires) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (id) DO UPDATE SET \
                data = excluded.data, \
                created = excluded.created, \
                expires = excluded.expires \
             WHERE backend_sqlite_data.expires IS NOT NULL \
               AND backend_sqlite_data.expires < ?3",
        )
        .bind(key)
        .bind(data)
        .bind(now)
        .bind(expires)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        if result.rows_affected() == 0 {
            return Err(StorageError::conflict(key));
        }

        tx.commit().await.map_err(|e| StorageError::Transaction {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StorageResult<Vec<u8>> {
        let row: Option<(Vec<u8>, Option<i64>)> =
            sqlx::query_as("SELECT data, expires FROM backend_sqlite_data WHERE id = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        let Some((data, expires)) = row else {
            return Err(StorageError::not_found(key));
        };

        let now = now_nanos();
        if is_live(expires, now) {
            return Ok(data);
        }

        let evicted = sqlx::query(
            "DELETE FROM backend_sqlite_data \
             WHERE id = ?1 AND expires IS NOT NULL AND expires < ?2",
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await;
        if let Err(e) = evicted {
            tracing::warn!(key = %key, error = %e, "failed to evict expired row");
        }
        Err(StorageError::not_found(key))
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Removable for SqliteBackend {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM backend_sqlite_data WHERE id = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// `None` means the row never expires.
fn expires_nanos(now: i64, ttl: Duration) -> Option<i64> {
    if ttl.is_zero() {
        return None;
    }
    i64::try_from(ttl.as_nanos())
        .ok()
        .and_then(|ttl| now.checked_add(ttl))
}

fn is_live(expires: Option<i64>, now: i64) -> bool {
    expires.is_none_or(|deadline| now <= deadline)
}
