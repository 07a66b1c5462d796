//! Conformance suite shared by every backend.
//!
//! Each suite drives a backend through the observable contract: round-trip,
//! conflict on a live key, expiry, expiry clearing the conflict, and
//! idempotent deletion. Suites panic on the first violation, so call them
//! from a `#[tokio::test]`.
//!
//! Keys carry a timestamp and sequence suffix, so suites can run repeatedly
//! against a shared server without clean-up between runs. Expiry checks
//! sleep for about a second of wall-clock time.

#![allow(clippy::unwrap_used, clippy::panic, clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;

use crate::{
    Backend, BoxReader, CancelToken, RemovableBackend, RemovableStreamBackend, StorageError,
    StreamBackend,
};

/// Size of the payload used by the streaming suites.
pub const PAYLOAD_LEN: usize = 10 * 1024;

/// Size of the multi-megabyte payload streamed once per suite run. Not a
/// multiple of any common buffer or part size.
pub const LARGE_PAYLOAD_LEN: usize = 12 * 1024 * 1024 + 7;

const SHORT_TTL: Duration = Duration::from_millis(500);
const LONG_TTL: Duration = Duration::from_secs(3600);
const PAST_SHORT_TTL: Duration = Duration::from_secs(1);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A key unique to this call.
#[must_use]
pub fn unique_key(name: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{name}-{nanos}-{seq}")
}

/// A deterministic, non-repeating-looking payload of `len` bytes.
#[must_use]
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed) | 0x9E37_0000;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state.to_le_bytes()[0]
        })
        .collect()
}

/// Wrap `data` as a [`BoxReader`].
#[must_use]
pub fn reader(data: Vec<u8>) -> BoxReader {
    Box::pin(std::io::Cursor::new(data))
}

/// Drain `reader` into memory.
pub async fn read_all(mut reader: BoxReader) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

fn assert_conflict<T: std::fmt::Debug>(result: Result<T, StorageError>, what: &str) {
    match result {
        Err(e) if e.is_conflict() => {}
        other => panic!("{what}: expected conflict, got {other:?}"),
    }
}

fn assert_not_found<T: std::fmt::Debug>(result: Result<T, StorageError>, what: &str) {
    match result {
        Err(e) if e.is_not_found() => {}
        other => panic!("{what}: expected not found, got {other:?}"),
    }
}

/// Buffered contract: round-trip, conflict, expiry.
pub async fn buffered_suite<B: Backend + ?Sized>(backend: &B) {
    let missing = unique_key("missing");
    assert_not_found(backend.retrieve(&missing).await, "retrieve of unknown key");

    let key = unique_key("buffered");
    let data = payload(1024, 1);
    backend.save(&key, &data).await.unwrap();
    assert_eq!(backend.retrieve(&key).await.unwrap(), data);

    assert_conflict(backend.save(&key, b"other").await, "second save");
    assert_eq!(
        backend.retrieve(&key).await.unwrap(),
        data,
        "payload must survive a rejected save"
    );

    let live = unique_key("live");
    backend.save_ttl(&live, b"h", LONG_TTL).await.unwrap();
    assert_conflict(
        backend.save_ttl(&live, b"z", LONG_TTL).await,
        "save within ttl",
    );

    let forever = unique_key("forever");
    backend
        .save_ttl(&forever, b"f", Duration::MAX)
        .await
        .unwrap_or_else(|e| panic!("an unrepresentable ttl must mean no expiry: {e}"));
    assert_eq!(backend.retrieve(&forever).await.unwrap(), b"f");
    assert_conflict(backend.save(&forever, b"g").await, "save over a record that never expires");

    let expiring = unique_key("expiring");
    let reused = unique_key("reused");
    backend.save_ttl(&expiring, b"h", SHORT_TTL).await.unwrap();
    backend.save_ttl(&reused, b"old", SHORT_TTL).await.unwrap();
    assert_eq!(backend.retrieve(&expiring).await.unwrap(), b"h");

    tokio::time::sleep(PAST_SHORT_TTL).await;

    assert_not_found(backend.retrieve(&expiring).await, "retrieve after ttl");
    backend
        .save_ttl(&reused, b"new", LONG_TTL)
        .await
        .unwrap_or_else(|e| panic!("save after ttl must not conflict: {e}"));
    assert_eq!(backend.retrieve(&reused).await.unwrap(), b"new");
}

/// Deletion on a buffered backend.
pub async fn removable_suite<B: RemovableBackend + ?Sized>(backend: &B) {
    let key = unique_key("removable");
    backend.delete(&key).await.unwrap();

    backend.save(&key, b"v").await.unwrap();
    backend.delete(&key).await.unwrap();
    assert_not_found(backend.retrieve(&key).await, "retrieve after delete");

    backend
        .save(&key, b"again")
        .await
        .unwrap_or_else(|e| panic!("save after delete must not conflict: {e}"));
    assert_eq!(backend.retrieve(&key).await.unwrap(), b"again");

    backend.delete(&key).await.unwrap();
    backend.delete(&key).await.unwrap();
}

/// Streaming contract: round-trip, conflict, expiry, cancellation.
pub async fn stream_suite<B: StreamBackend + ?Sized>(backend: &B) {
    let cancel = CancelToken::new();

    let missing = unique_key("missing");
    assert_not_found(
        backend.retrieve(&cancel, &missing).await.map(|_| ()),
        "retrieve of unknown key",
    );

    let key = unique_key("stream");
    let data = payload(PAYLOAD_LEN, 2);
    let written = backend
        .save(&cancel, &key, reader(data.clone()))
        .await
        .unwrap();
    assert_eq!(written, PAYLOAD_LEN as u64);
    assert_eq!(read_all(backend.retrieve(&cancel, &key).await.unwrap()).await, data);

    assert_conflict(
        backend.save(&cancel, &key, reader(b"other".to_vec())).await,
        "second save",
    );
    assert_eq!(
        read_all(backend.retrieve(&cancel, &key).await.unwrap()).await,
        data,
        "payload must survive a rejected save"
    );

    let empty = unique_key("empty");
    assert_eq!(backend.save(&cancel, &empty, reader(Vec::new())).await.unwrap(), 0);
    assert!(read_all(backend.retrieve(&cancel, &empty).await.unwrap()).await.is_empty());

    let large = unique_key("large");
    let big = payload(LARGE_PAYLOAD_LEN, 5);
    let written = backend
        .save(&cancel, &large, reader(big.clone()))
        .await
        .unwrap();
    assert_eq!(written, LARGE_PAYLOAD_LEN as u64);
    let fetched = read_all(backend.retrieve(&cancel, &large).await.unwrap()).await;
    assert_eq!(fetched.len(), big.len());
    assert!(fetched == big, "large payload must round-trip byte for byte");

    let aborted = unique_key("aborted");
    let fired = CancelToken::new();
    fired.cancel();
    match backend.save(&fired, &aborted, reader(payload(64, 3))).await {
        Err(StorageError::Cancelled) => {}
        other => panic!("save with a fired token: expected cancelled, got {other:?}"),
    }
    assert_not_found(
        backend.retrieve(&cancel, &aborted).await.map(|_| ()),
        "retrieve after cancelled save",
    );

    let long = unique_key("long");
    let expiring = unique_key("expiring");
    backend
        .save_ttl(&cancel, &long, reader(data.clone()), SHORT_TTL * 4)
        .await
        .unwrap();
    backend
        .save_ttl(&cancel, &expiring, reader(data.clone()), SHORT_TTL)
        .await
        .unwrap();
    assert_conflict(
        backend
            .save_ttl(&cancel, &expiring, reader(data.clone()), SHORT_TTL)
            .await,
        "save within ttl",
    );

    tokio::time::sleep(PAST_SHORT_TTL).await;

    assert_eq!(
        read_all(backend.retrieve(&cancel, &long).await.unwrap()).await,
        data,
        "record must stay readable before its ttl"
    );
    assert_conflict(
        backend.save(&cancel, &long, reader(data.clone())).await,
        "save within longer ttl",
    );
    assert_not_found(
        backend.retrieve(&cancel, &expiring).await.map(|_| ()),
        "retrieve after ttl",
    );
    backend
        .save(&cancel, &expiring, reader(b"fresh".to_vec()))
        .await
        .unwrap_or_else(|e| panic!("save after ttl must not conflict: {e}"));
    assert_eq!(
        read_all(backend.retrieve(&cancel, &expiring).await.unwrap()).await,
        b"fresh"
    );
}

/// Deletion on a streaming backend.
pub async fn removable_stream_suite<B: RemovableStreamBackend + ?Sized>(backend: &B) {
    let cancel = CancelToken::new();
    let key = unique_key("removable-stream");
    backend.delete(&key).await.unwrap();

    backend
        .save(&cancel, &key, reader(payload(PAYLOAD_LEN, 4)))
        .await
        .unwrap();
    backend.delete(&key).await.unwrap();
    assert_not_found(
        backend.retrieve(&cancel, &key).await.map(|_| ()),
        "retrieve after delete",
    );

    backend
        .save(&cancel, &key, reader(b"again".to_vec()))
        .await
        .unwrap_or_else(|e| panic!("save after delete must not conflict: {e}"));
    backend.delete(&key).await.unwrap();
    backend.delete(&key).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_deterministic_and_varied() {
        let a = payload(PAYLOAD_LEN, 9);
        assert_eq!(a, payload(PAYLOAD_LEN, 9));
        assert_ne!(a, payload(PAYLOAD_LEN, 10));
        assert!(a.iter().any(|&b| b != a[0]));
    }

    #[test]
    fn unique_keys_differ() {
        assert_ne!(unique_key("k"), unique_key("k"));
    }
}
