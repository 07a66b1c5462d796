//! TTL envelope for media without native expiration.
//!
//! Backends that store raw bytes (the filesystem) put a fixed 32-byte
//! header in front of every payload:
//!
//! ```text
//! offset  len  field
//! 0       1    format version (only 0 is defined)
//! 1       15   creation instant, UTC (binary time encoding, see below)
//! 16      8    ttl in nanoseconds, little-endian; 0 = never expires
//! 24      8    reserved, zero
//! ```
//!
//! The creation instant uses the 15-byte binary time layout: a layout byte
//! (`1`), big-endian `i64` seconds since 0001-01-01T00:00:00Z, big-endian
//! `i32` nanoseconds, and a big-endian `i16` zone offset in minutes (`-1`
//! for UTC).
//!
//! The header is a persisted format. Readers reject unknown version bytes
//! instead of guessing at the layout.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{StorageError, StorageResult};

/// Total size of the envelope in bytes.
pub const HEADER_LEN: usize = 32;

/// The only defined envelope version.
pub const VERSION_V0: u8 = 0;

const TIME_LEN: usize = 15;
const TIME_LAYOUT_V1: u8 = 1;
const UTC_OFFSET_MARKER: i16 = -1;
/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const UNIX_TO_ABSOLUTE_SECS: i64 = 62_135_596_800;

const CREATED_AT: std::ops::Range<usize> = 1..16;
const TTL_AT: std::ops::Range<usize> = 16..24;

/// Decoded TTL envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlHeader {
    created_at: DateTime<Utc>,
    ttl: Duration,
}

impl TtlHeader {
    /// A header stamped with the current UTC time.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_created_at(Utc::now(), ttl)
    }

    /// A header with an explicit creation instant.
    #[must_use]
    pub fn with_created_at(created_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self { created_at, ttl }
    }

    /// When the record was written.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time to live; zero means the record never expires.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The instant after which the record is expired, if it ever expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(self.created_at, self.ttl)
    }

    /// `ttl != 0 && now > created_at + ttl`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| now > deadline)
    }

    /// [`is_expired_at`](Self::is_expired_at) against the current time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Serialize into the 32-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = VERSION_V0;
        out[CREATED_AT].copy_from_slice(&encode_time(self.created_at));
        let nanos = u64::try_from(self.ttl.as_nanos()).unwrap_or(u64::MAX);
        out[TTL_AT].copy_from_slice(&nanos.to_le_bytes());
        out
    }

    /// Parse the 32-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Header`] for an unknown envelope version or a
    /// malformed creation timestamp.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> StorageResult<Self> {
        if bytes[0] != VERSION_V0 {
            return Err(StorageError::Header {
                reason: format!("unrecognized version byte {:#04x}", bytes[0]),
            });
        }

        let mut time = [0u8; TIME_LEN];
        time.copy_from_slice(&bytes[CREATED_AT]);
        let created_at = decode_time(&time)?;

        let mut ttl = [0u8; 8];
        ttl.copy_from_slice(&bytes[TTL_AT]);
        let ttl = Duration::from_nanos(u64::from_le_bytes(ttl));

        Ok(Self { created_at, ttl })
    }
}

/// `created_at + ttl`, or `None` when the record never expires (zero ttl,
/// or a ttl too large to represent).
pub(crate) fn expires_at(created_at: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    let delta = TimeDelta::from_std(ttl).ok()?;
    created_at.checked_add_signed(delta)
}

/// Write a fresh header for `ttl` at the current position of `sink`.
///
/// # Errors
///
/// Returns the underlying I/O error if the write fails.
pub async fn write_header<W>(sink: &mut W, ttl: Duration) -> std::io::Result<TtlHeader>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = TtlHeader::new(ttl);
    sink.write_all(&header.encode()).await?;
    Ok(header)
}

/// Read and decode a header from the current position of `source`.
///
/// # Errors
///
/// Returns [`StorageError::Header`] if the source is shorter than
/// [`HEADER_LEN`], cannot be read, or holds an unknown version.
pub async fn read_header<R>(source: &mut R) -> StorageResult<TtlHeader>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; HEADER_LEN];
    source.read_exact(&mut buf).await.map_err(|e| {
        let reason = if e.kind() == std::io::ErrorKind::UnexpectedEof {
            "truncated ttl header".to_owned()
        } else {
            format!("cannot read ttl header: {e}")
        };
        StorageError::Header { reason }
    })?;
    TtlHeader::decode(&buf)
}

/// Read a header from `source` and report whether its ttl has elapsed.
///
/// # Errors
///
/// See [`read_header`].
pub async fn ttl_exceeded<R>(source: &mut R) -> StorageResult<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(read_header(source).await?.is_expired())
}

fn encode_time(at: DateTime<Utc>) -> [u8; TIME_LEN] {
    let secs = at.timestamp().saturating_add(UNIX_TO_ABSOLUTE_SECS);
    let nanos = i32::try_from(at.timestamp_subsec_nanos().min(999_999_999)).unwrap_or(0);

    let mut out = [0u8; TIME_LEN];
    out[0] = TIME_LAYOUT_V1;
    out[1..9].copy_from_slice(&secs.to_be_bytes());
    out[9..13].copy_from_slice(&nanos.to_be_bytes());
    out[13..15].copy_from_slice(&UTC_OFFSET_MARKER.to_be_bytes());
    out
}

fn decode_time(bytes: &[u8; TIME_LEN]) -> StorageResult<DateTime<Utc>> {
    if bytes[0] != TIME_LAYOUT_V1 {
        return Err(StorageError::Header {
            reason: format!("unsupported timestamp layout {}", bytes[0]),
        });
    }

    let mut secs = [0u8; 8];
    secs.copy_from_slice(&bytes[1..9]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&bytes[9..13]);

    let secs = i64::from_be_bytes(secs).saturating_sub(UNIX_TO_ABSOLUTE_SECS);
    let nanos = u32::try_from(i32::from_be_bytes(nanos)).map_err(|_| StorageError::Header {
        reason: "negative nanoseconds in timestamp".to_owned(),
    })?;

    // The zone offset only affects presentation; the instant is absolute.
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| StorageError::Header {
        reason: format!("timestamp out of range: {secs}s {nanos}ns"),
    })
}
