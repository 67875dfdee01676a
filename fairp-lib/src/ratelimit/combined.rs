use async_trait::async_trait;
use std::sync::Arc;

use tokio::time::Instant;

use super::{LimitError, Limiter, TokenBucket};

/// Two-tier limiter: a per-host guaranteed bucket backed by a shared pool.
///
/// Grants come from the guaranteed bucket when it has enough tokens right
/// now, otherwise from the shared bucket when that one has enough right now.
/// If neither can serve the request immediately the caller queues on the
/// guaranteed bucket, so a host never waits longer than its guaranteed share
/// dictates.
#[derive(Debug, Clone)]
pub struct CombinedLimiter {
    guaranteed: Arc<TokenBucket>,
    shared: Arc<TokenBucket>,
}

impl CombinedLimiter {
    /// Combine a host's `guaranteed` bucket with the `shared` pool
    #[must_use]
    pub const fn new(guaranteed: Arc<TokenBucket>, shared: Arc<TokenBucket>) -> Self {
        Self { guaranteed, shared }
    }

    /// Try both tiers without waiting
    fn try_take(&self, now: Instant, n: usize) -> bool {
        if self.guaranteed.allow_n(now, n) {
            return true;
        }
        Limiter::burst(&*self.shared) >= n && self.shared.allow_n(now, n)
    }
}

#[async_trait]
impl Limiter for CombinedLimiter {
    fn burst(&self) -> usize {
        Limiter::burst(&*self.guaranteed)
    }

    fn tokens(&self) -> f64 {
        Limiter::tokens(&*self.guaranteed)
    }

    async fn wait_n_until(&self, n: usize, deadline: Option<Instant>) -> Result<(), LimitError> {
        if self.try_take(Instant::now(), n) {
            return Ok(());
        }
        self.guaranteed.wait_n_until(n, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_guaranteed_first() {
        let guaranteed = Arc::new(TokenBucket::new(10.0, 10));
        let shared = Arc::new(TokenBucket::new(10.0, 10));
        let limiter = CombinedLimiter::new(Arc::clone(&guaranteed), Arc::clone(&shared));

        limiter.wait_n(5).await.unwrap();

        let now = Instant::now();
        assert!((guaranteed.tokens_at(now) - 5.0).abs() < 1e-9);
        assert!((shared.tokens_at(now) - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_shared_pool() {
        let guaranteed = Arc::new(TokenBucket::new(10.0, 10));
        let shared = Arc::new(TokenBucket::new(10.0, 10));
        let limiter = CombinedLimiter::new(Arc::clone(&guaranteed), Arc::clone(&shared));

        let start = Instant::now();
        limiter.wait_n(10).await.unwrap();
        limiter.wait_n(10).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert!(guaranteed.tokens_at(start).abs() < 1e-9);
        assert!(shared.tokens_at(start).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_on_guaranteed_when_both_empty() {
        let guaranteed = Arc::new(TokenBucket::new(10.0, 10));
        let shared = Arc::new(TokenBucket::new(1000.0, 10));
        let limiter = CombinedLimiter::new(Arc::clone(&guaranteed), Arc::clone(&shared));

        let start = Instant::now();
        assert!(guaranteed.allow_n(start, 10));
        assert!(shared.allow_n(start, 10));

        limiter.wait_n(5).await.unwrap();
        // queued on the 10/s guaranteed bucket, not the faster shared one
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(shared.tokens_at(Instant::now()) >= 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_with_zero_burst_is_skipped() {
        let guaranteed = Arc::new(TokenBucket::new(10.0, 10));
        let shared = Arc::new(TokenBucket::new(0.0, 0));
        let limiter = CombinedLimiter::new(Arc::clone(&guaranteed), shared);

        let start = Instant::now();
        limiter.wait_n(10).await.unwrap();
        limiter.wait_n(10).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_guaranteed_values() {
        let guaranteed = Arc::new(TokenBucket::new(10.0, 7));
        let shared = Arc::new(TokenBucket::new(10.0, 5));
        let limiter = CombinedLimiter::new(guaranteed, shared);

        assert_eq!(limiter.burst(), 7);
        assert!((limiter.tokens() - 7.0).abs() < 1e-9);
        assert!(matches!(
            limiter.wait_n(8).await,
            Err(LimitError::ExceedsBurst { .. })
        ));
    }
}
