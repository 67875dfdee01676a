use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};

use super::{LimitError, Limiter};

enum State {
    /// Nothing buffered, the next poll reads from the source
    Idle,
    /// `len` bytes are buffered and wait for the limiter
    Waiting {
        wait: BoxFuture<'static, Result<(), LimitError>>,
        len: usize,
    },
    /// Tokens were granted, `buf[pos..len]` can be handed out
    Ready { pos: usize, len: usize },
}

/// An [`AsyncRead`] adapter that pays for every byte with limiter tokens.
///
/// Each read pulls at most `min(requested, burst)` bytes from the source,
/// then waits until the limiter grants exactly that many tokens before the
/// bytes are handed to the caller. Limiter failures surface as
/// [`io::Error`]s wrapping a [`LimitError`].
pub struct RateLimitedReader<R> {
    inner: R,
    limiter: Arc<dyn Limiter>,
    buf: Vec<u8>,
    state: State,
}

impl<R> RateLimitedReader<R> {
    /// Limit `inner` with `limiter`
    pub fn new(inner: R, limiter: Arc<dyn Limiter>) -> Self {
        Self {
            inner,
            limiter,
            buf: Vec::new(),
            state: State::Idle,
        }
    }
}

impl<R> fmt::Debug for RateLimitedReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedReader")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Ready { pos, len } => {
                    let n = out.remaining().min(*len - *pos);
                    out.put_slice(&this.buf[*pos..*pos + n]);
                    *pos += n;
                    if *pos == *len {
                        this.state = State::Idle;
                    }
                    return Poll::Ready(Ok(()));
                }
                State::Waiting { wait, len } => {
                    let len = *len;
                    let granted = ready!(wait.as_mut().poll(cx));
                    match granted {
                        Ok(()) => this.state = State::Ready { pos: 0, len },
                        Err(err) => {
                            this.state = State::Idle;
                            return Poll::Ready(Err(err.into()));
                        }
                    }
                }
                State::Idle => {
                    let want = out.remaining().min(this.limiter.burst().max(1));
                    if want == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    if this.buf.len() < want {
                        this.buf.resize(want, 0);
                    }

                    let mut chunk = ReadBuf::new(&mut this.buf[..want]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
                    let len = chunk.filled().len();
                    if len == 0 {
                        return Poll::Ready(Ok(()));
                    }

                    let limiter = Arc::clone(&this.limiter);
                    this.state = State::Waiting {
                        wait: Box::pin(async move { limiter.wait_n(len).await }),
                        len,
                    };
                }
            }
        }
    }
}
