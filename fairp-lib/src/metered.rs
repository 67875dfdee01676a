//! Byte accounting for relayed streams.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::AsyncWrite;

use crate::{Counter, RateCountingWriter};

/// An [`AsyncWrite`] adapter that reports every byte accepted by the inner
/// writer to a byte [`Counter`] and a [`RateCountingWriter`].
///
/// Only bytes the inner writer actually accepted are counted.
#[derive(Debug)]
pub struct MeteredWriter<W> {
    inner: W,
    bytes: Counter,
    rate: Arc<RateCountingWriter>,
}

impl<W> MeteredWriter<W> {
    /// Meter writes to `inner`
    pub const fn new(inner: W, bytes: Counter, rate: Arc<RateCountingWriter>) -> Self {
        Self { inner, bytes, rate }
    }

    /// Unwrap the inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn account(&self, n: usize) {
        if n > 0 {
            self.bytes.add(i64::try_from(n).unwrap_or(i64::MAX));
            self.rate.record(n);
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for MeteredWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.account(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test(start_paused = true)]
    async fn test_counts_written_bytes() {
        let bytes = Counter::new();
        let rate = Arc::new(RateCountingWriter::new(Duration::from_secs(1)));
        let mut writer = MeteredWriter::new(Vec::new(), bytes.clone(), Arc::clone(&rate));

        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(bytes.get(), 11);
        assert_eq!(writer.into_inner(), b"hello world");

        tokio::time::advance(Duration::from_millis(1001)).await;
        rate.record(0);
        assert_eq!(rate.rate().0, 11.0);
    }

    #[tokio::test]
    async fn test_failed_writes_are_not_counted() {
        let bytes = Counter::new();
        let rate = Arc::new(RateCountingWriter::new(Duration::from_secs(1)));
        let (client, server) = tokio::io::duplex(8);
        drop(server);

        let mut writer = MeteredWriter::new(client, bytes.clone(), rate);
        assert!(writer.write_all(b"data").await.is_err());
        assert_eq!(bytes.get(), 0);
    }
}
