use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::LimitError;

/// Something that hands out byte tokens at a bounded rate.
///
/// Implemented by [`TokenBucket`] and [`super::CombinedLimiter`].
#[async_trait]
pub trait Limiter: Send + Sync + Debug {
    /// Maximum number of tokens handed out in a single grant
    fn burst(&self) -> usize;

    /// Tokens currently available, for diagnostics only
    fn tokens(&self) -> f64;

    /// Wait until `n` tokens are available and consume them.
    ///
    /// Fails immediately, without consuming anything, if `n` exceeds the
    /// burst or if the tokens would only be available after `deadline`.
    /// Dropping the returned future before it completes hands the reserved
    /// tokens back.
    async fn wait_n_until(&self, n: usize, deadline: Option<Instant>) -> Result<(), LimitError>;

    /// Same as [`Limiter::wait_n_until`] without a deadline
    async fn wait_n(&self, n: usize) -> Result<(), LimitError> {
        self.wait_n_until(n, None).await
    }
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    fn burst(&self) -> usize {
        (**self).burst()
    }

    fn tokens(&self) -> f64 {
        (**self).tokens()
    }

    async fn wait_n_until(&self, n: usize, deadline: Option<Instant>) -> Result<(), LimitError> {
        (**self).wait_n_until(n, deadline).await
    }
}

/// Tokens per second; `f64::INFINITY` disables limiting
pub type TokenRate = f64;

#[derive(Debug)]
struct BucketState {
    rate: TokenRate,
    burst: usize,
    tokens: f64,
    /// Last time `tokens` was brought up to date
    last: Instant,
    /// Latest time any reservation becomes due
    last_event: Instant,
}

impl BucketState {
    /// Tokens that would be available at `now`, capped at the burst
    fn advance(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last);
        #[allow(clippy::cast_precision_loss)]
        let burst = self.burst as f64;
        (self.tokens + tokens_from_duration(elapsed, self.rate)).min(burst)
    }
}

fn tokens_from_duration(elapsed: Duration, rate: TokenRate) -> f64 {
    if rate <= 0.0 {
        return 0.0;
    }
    elapsed.as_secs_f64() * rate
}

fn duration_from_tokens(tokens: f64, rate: TokenRate) -> Duration {
    if rate <= 0.0 {
        return Duration::MAX;
    }
    Duration::try_from_secs_f64(tokens / rate).unwrap_or(Duration::MAX)
}

/// Tokens taken out of a bucket that become usable at `time_to_act`
#[derive(Debug, Clone, Copy)]
struct Reservation {
    tokens: usize,
    time_to_act: Instant,
    rate: TokenRate,
}

/// A token bucket whose rate can be changed while it is in use.
///
/// The bucket starts full. Waiters reserve their tokens up front and are
/// served in reservation order, so a large backlog cannot starve later
/// callers beyond their place in line.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate` tokens per second that holds at
    /// most `burst` tokens
    #[must_use]
    pub fn new(rate: TokenRate, burst: usize) -> Self {
        let now = Instant::now();
        #[allow(clippy::cast_precision_loss)]
        let tokens = burst as f64;
        Self {
            state: Mutex::new(BucketState {
                rate,
                burst,
                tokens,
                last: now,
                last_event: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current refill rate in tokens per second
    #[must_use]
    pub fn rate(&self) -> TokenRate {
        self.lock().rate
    }

    /// Change the refill rate.
    ///
    /// Tokens accumulated under the old rate are kept; the new rate applies
    /// from now on.
    pub fn set_rate(&self, rate: TokenRate) {
        self.set_rate_at(Instant::now(), rate);
    }

    /// Change the refill rate as of `now`
    pub fn set_rate_at(&self, now: Instant, rate: TokenRate) {
        let mut state = self.lock();
        let tokens = state.advance(now);
        state.last = now;
        state.tokens = tokens;
        state.rate = rate;
    }

    /// Tokens available at `now`
    #[must_use]
    pub fn tokens_at(&self, now: Instant) -> f64 {
        self.lock().advance(now)
    }

    /// Take `n` tokens if they are available at `now` without waiting
    pub fn allow_n(&self, now: Instant, n: usize) -> bool {
        self.reserve_n(now, n, Duration::ZERO).is_some()
    }

    fn reserve_n(&self, now: Instant, n: usize, max_wait: Duration) -> Option<Reservation> {
        let mut state = self.lock();

        if state.rate.is_infinite() {
            return Some(Reservation {
                tokens: n,
                time_to_act: now,
                rate: state.rate,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let tokens = state.advance(now) - n as f64;
        let wait = if tokens < 0.0 {
            duration_from_tokens(-tokens, state.rate)
        } else {
            Duration::ZERO
        };

        if n > state.burst || wait > max_wait {
            return None;
        }
        let time_to_act = now.checked_add(wait)?;

        state.last = now;
        state.tokens = tokens;
        state.last_event = time_to_act;

        Some(Reservation {
            tokens: n,
            time_to_act,
            rate: state.rate,
        })
    }

    /// Give back the tokens of a reservation that will not be used.
    ///
    /// Tokens already claimed by later reservations are not restored.
    fn cancel(&self, reservation: &Reservation, now: Instant) {
        if reservation.tokens == 0 || reservation.time_to_act < now {
            return;
        }

        let mut state = self.lock();
        let later = state
            .last_event
            .saturating_duration_since(reservation.time_to_act);
        #[allow(clippy::cast_precision_loss)]
        let restore = reservation.tokens as f64 - tokens_from_duration(later, reservation.rate);
        if restore <= 0.0 {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let burst = state.burst as f64;
        let tokens = (state.advance(now) + restore).min(burst);
        state.last = now;
        state.tokens = tokens;

        if reservation.time_to_act == state.last_event {
            #[allow(clippy::cast_precision_loss)]
            let reserved = duration_from_tokens(reservation.tokens as f64, reservation.rate);
            if let Some(previous) = reservation.time_to_act.checked_sub(reserved) {
                if previous >= now {
                    state.last_event = previous;
                }
            }
        }
    }
}

/// Returns the tokens of a reservation if the wait is abandoned
struct PendingReservation<'a> {
    bucket: &'a TokenBucket,
    reservation: Reservation,
    armed: bool,
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.cancel(&self.reservation, Instant::now());
        }
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn burst(&self) -> usize {
        self.lock().burst
    }

    fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    async fn wait_n_until(&self, n: usize, deadline: Option<Instant>) -> Result<(), LimitError> {
        if n == 0 {
            return Ok(());
        }

        let burst = {
            let state = self.lock();
            (!state.rate.is_infinite()).then_some(state.burst)
        };
        if let Some(burst) = burst {
            if n > burst {
                return Err(LimitError::ExceedsBurst { requested: n, burst });
            }
        }

        let now = Instant::now();
        let max_wait = deadline.map_or(Duration::MAX, |deadline| {
            deadline.saturating_duration_since(now)
        });
        let reservation = self
            .reserve_n(now, n, max_wait)
            .ok_or(LimitError::WouldExceedDeadline { requested: n })?;

        if reservation.time_to_act <= now {
            return Ok(());
        }

        let mut pending = PendingReservation {
            bucket: self,
            reservation,
            armed: true,
        };
        tokio::time::sleep_until(reservation.time_to_act).await;
        pending.armed = false;
        Ok(())
    }
}
