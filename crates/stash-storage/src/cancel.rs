//! Cooperative cancellation for streaming transfers.
//!
//! A [`CancelToken`] is a cheaply clonable signal built on a Tokio `watch`
//! channel. [`CancelReader`] wraps any [`AsyncRead`] so that a transfer
//! aborts as soon as its token fires, even while the underlying source is
//! blocked on a socket or disk.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;

/// A shared cancellation signal.
///
/// All clones observe the same state. Once cancelled, a token stays
/// cancelled.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Fire the token once `after` has elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn cancel_after(&self, after: Duration) {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }

    /// Whether the token has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token fires.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once the
        // value flips to `true`.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Marker carried inside the `io::Error` a [`CancelReader`] returns.
#[derive(Debug, thiserror::Error)]
#[error("read cancelled")]
pub struct Cancelled;

pub(crate) fn cancelled_io() -> io::Error {
    io::Error::other(Cancelled)
}

/// Whether `err` was produced by a cancelled [`CancelReader`].
#[must_use]
pub fn is_cancelled_io(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<Cancelled>())
}

/// An [`AsyncRead`] adapter that fails with a [`Cancelled`] error once its
/// token fires.
///
/// Every read checks the token first and returns immediately, without
/// polling the source, if it has already fired. Otherwise the read races
/// the source against the token and whichever is ready first wins. The
/// losing side is never leaked: a pending source read is simply not polled
/// again and is released when the reader is dropped.
pub struct CancelReader<R> {
    inner: R,
    token: CancelToken,
    fired: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl<R> CancelReader<R> {
    /// Wrap `inner` so it observes `token`.
    pub fn new(inner: R, token: &CancelToken) -> Self {
        let waiter = token.clone();
        Self {
            inner,
            token: token.clone(),
            fired: Box::pin(async move { waiter.cancelled().await }),
        }
    }

    /// Unwrap the source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> fmt::Debug for CancelReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelReader")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancelReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.token.is_cancelled() || this.fired.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(cancelled_io()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;

    use super::*;

    /// A source that never produces data.
    struct Stalled;

    impl AsyncRead for Stalled {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    /// A source that counts how often it is polled.
    struct Counting(Arc<AtomicUsize>);

    impl AsyncRead for Counting {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            buf.put_slice(b"x");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn passes_data_through_when_not_cancelled() {
        let token = CancelToken::new();
        let mut reader = CancelReader::new(&b"hello world"[..], &token);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn already_cancelled_does_not_touch_source() {
        let polls = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        token.cancel();

        let mut reader = CancelReader::new(Counting(Arc::clone(&polls)), &token);
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();

        assert!(is_cancelled_io(&err));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_read() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(50));

        let mut reader = CancelReader::new(Stalled, &token);
        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(Duration::from_secs(5), reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert!(is_cancelled_io(&err));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_aborts_an_endless_copy() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(100));

        let mut reader = CancelReader::new(tokio::io::repeat(0xAB), &token);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::copy(&mut reader, &mut tokio::io::sink()),
        )
        .await
        .unwrap();
        assert!(is_cancelled_io(&result.unwrap_err()));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[test]
    fn foreign_io_errors_are_not_cancellation() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(!is_cancelled_io(&err));
        assert!(is_cancelled_io(&cancelled_io()));
    }
}
