//! Redis buffered backend.
//!
//! Uses Redis' native expiry: a save is a single `SET key value NX [PX ms]`,
//! so the conflict check and the write are one atomic command and expired
//! keys are dropped by the server. Feature-gated behind `redis-backend`.

use std::time::Duration;

use redis::aio::MultiplexedConnection;

use crate::{Backend, Removable, StorageError, StorageResult};

const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for [`RedisBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// `host:port`, or a full `redis://` / `rediss://` URL.
    pub addr: String,
}

impl RedisConfig {
    /// Configuration for the server at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the address is empty.
    pub fn validate(&self) -> StorageResult<()> {
        if self.addr.trim().is_empty() {
            return Err(StorageError::Config {
                reason: "redis address cannot be empty".to_owned(),
            });
        }
        Ok(())
    }

    fn url(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("redis://{}", self.addr)
        }
    }
}

/// A [`Backend`] backed by a Redis server.
///
/// Holds one multiplexed connection; clones share it.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    addr: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the server and verify it answers `PING` within one second.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] for an invalid configuration and
    /// [`StorageError::Open`] if the server is unreachable.
    pub async fn connect(config: RedisConfig) -> StorageResult<Self> {
        config.validate()?;
        let url = config.url();
        let open_err = |reason: String| StorageError::Open {
            path: config.addr.clone(),
            reason,
        };

        let client = redis::Client::open(url.as_str()).map_err(|e| open_err(e.to_string()))?;
        let mut conn = tokio::time::timeout(PING_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| open_err("connection timed out".to_owned()))?
            .map_err(|e| open_err(e.to_string()))?;

        let pong: String = tokio::time::timeout(PING_TIMEOUT, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| open_err("ping timed out".to_owned()))?
            .map_err(|e| open_err(format!("ping failed: {e}")))?;
        tracing::debug!(addr = %config.addr, reply = %pong, "connected to redis");

        Ok(Self {
            conn,
            addr: config.addr,
        })
    }
}

#[async_trait::async_trait]
impl Backend for RedisBackend {
    async fn save_ttl(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(data).arg("NX");
        if let Some(millis) = ttl_millis(ttl) {
            cmd.arg("PX").arg(millis);
        }

        // `NX` replies nil when the key is already taken.
        let reply: Option<String> =
            cmd.query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Write {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;
        match reply {
            Some(_) => Ok(()),
            None => Err(StorageError::conflict(key)),
        }
    }

    async fn retrieve(&self, key: &str) -> StorageResult<Vec<u8>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        value.ok_or_else(|| StorageError::not_found(key))
    }

    async fn close(&self) -> StorageResult<()> {
        // The multiplexed connection shuts down when the last clone drops.
        tracing::debug!(addr = %self.addr, "closing redis backend");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Removable for RedisBackend {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Millisecond expiry for `PX`, or `None` for a record that never expires.
/// Sub-millisecond ttls round up so they still expire. A ttl too long to
/// express as signed nanoseconds (about 292 years) saturates to "never",
/// the same cut-off the SQLite backend applies.
fn ttl_millis(ttl: Duration) -> Option<u64> {
    if ttl.is_zero() || i64::try_from(ttl.as_nanos()).is_err() {
        return None;
    }
    Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
}
