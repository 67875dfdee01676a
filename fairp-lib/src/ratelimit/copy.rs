use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{CopyError, Limiter, RateLimitedReader};

/// Size of the intermediate buffer of a copy
const COPY_BUFFER_SIZE: usize = 32 * 1024;

type BoxedReader<'a> = Box<dyn AsyncRead + Unpin + Send + 'a>;

/// Wrap `src` in one [`RateLimitedReader`] per limiter.
///
/// The first limiter sits closest to the source.
fn limited<'a, R>(src: R, limiters: &[Arc<dyn Limiter>]) -> BoxedReader<'a>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    limiters
        .iter()
        .fold(Box::new(src) as BoxedReader<'a>, |reader, limiter| {
            Box::new(RateLimitedReader::new(reader, Arc::clone(limiter))) as BoxedReader<'a>
        })
}

/// Copy `src` to `dst` until EOF, paying for every byte with each of
/// `limiters`.
///
/// Returns the number of bytes written. `dst` is flushed once the source is
/// exhausted.
///
/// # Errors
///
/// Returns [`CopyError::Io`] if reading or writing fails and
/// [`CopyError::Limit`] if a limiter refuses to grant tokens. Both carry the
/// number of bytes written up to that point.
pub async fn copy<R, W>(
    dst: &mut W,
    src: R,
    limiters: &[Arc<dyn Limiter>],
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + ?Sized,
{
    copy_until_cancelled(dst, src, limiters, &CancellationToken::new()).await
}

/// Same as [`copy`], but gives up as soon as `cancel` fires.
///
/// # Errors
///
/// Same as [`copy`]; additionally [`CopyError::Cancelled`] once `cancel`
/// fires. Bytes that were read but not yet written are dropped.
pub async fn copy_until_cancelled<R, W>(
    dst: &mut W,
    src: R,
    limiters: &[Arc<dyn Limiter>],
    cancel: &CancellationToken,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut reader = limited(src, limiters);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CopyError::Cancelled { written }),
            read = reader.read(&mut buf) => read.map_err(|e| CopyError::from_io(e, written))?,
        };

        if n == 0 {
            dst.flush()
                .await
                .map_err(|source| CopyError::Io { written, source })?;
            return Ok(written);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CopyError::Cancelled { written }),
            write = dst.write_all(&buf[..n]) => write.map_err(|source| CopyError::Io { written, source })?,
        }
        written += n as u64;
    }
}
