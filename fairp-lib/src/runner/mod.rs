//! Orchestration of rate limited transfers.
//!
//! A [`Runner`] owns every process-wide limiter and counter of the proxy and
//! runs transfers through them. Each transfer pays for its bytes with a
//! chain of limiters: the optional per-request self limiter, the two-tier
//! host limiter and finally the global limiter of its direction.

mod stats;
mod tunnel;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::counter::{CounterGuard, Ticket};
use crate::metered::MeteredWriter;
use crate::ratelimit::{
    CombinedLimiter, CopyError, HostKey, HostLimiterHandle, HostLimiterStorage, Limiter,
    RateLimitConfig, TokenBucket, copy_until_cancelled,
};
use crate::{Counter, RateCountingWriter, Result};

pub use stats::RuntimeStats;
pub use tunnel::{Side, TunnelReport};

/// Requests per second each host may make to the health endpoint
const HEALTH_RATE: f64 = 1.0;

/// Health requests a host may burst before being throttled
const HEALTH_BURST: usize = 3;

/// Limiters and counters of one transfer direction
#[derive(Debug)]
struct Direction {
    hosts: HostLimiterStorage,
    main: Arc<TokenBucket>,
    shared: Arc<TokenBucket>,
    rate: Arc<RateCountingWriter>,
    bytes: Counter,
}

impl Direction {
    fn new(config: &RateLimitConfig) -> Self {
        let shared_throughput = config.shared_throughput();
        // a pool without throughput must never be drawn from
        let shared_burst = if shared_throughput > 0.0 {
            config.burst_size
        } else {
            0
        };

        Self {
            hosts: HostLimiterStorage::new(config.host_throughput(), config.burst_size),
            main: Arc::new(TokenBucket::new(config.max_throughput, config.burst_size)),
            shared: Arc::new(TokenBucket::new(shared_throughput, shared_burst)),
            rate: Arc::new(RateCountingWriter::new(config.rate_interval)),
            bytes: Counter::new(),
        }
    }
}

/// Throttles one transfer to its share of the concurrent requests.
///
/// The rate follows the request counter for as long as this value lives.
struct SelfLimiter {
    bucket: Arc<TokenBucket>,
    _ticket: Ticket,
}

impl SelfLimiter {
    fn new(max_throughput: f64, burst: usize, requests: &Counter) -> Self {
        fn share(max_throughput: f64, requests: i64) -> f64 {
            #[allow(clippy::cast_precision_loss)]
            let requests = requests.max(1) as f64;
            max_throughput / requests
        }

        let bucket = Arc::new(TokenBucket::new(
            share(max_throughput, requests.get()),
            burst,
        ));
        let subscriber = Arc::downgrade(&bucket);
        let ticket = requests.subscribe(move |requests| {
            if requests <= 0 {
                return;
            }
            if let Some(bucket) = subscriber.upgrade() {
                bucket.set_rate(share(max_throughput, requests));
            }
        });

        Self {
            bucket,
            _ticket: ticket,
        }
    }
}

/// The limiters a single transfer pays with.
///
/// Holds the host handle and the self limiter subscription, both released
/// when the transfer is done.
struct TransferLimits {
    chain: Vec<Arc<dyn Limiter>>,
    _handle: HostLimiterHandle,
    _self_limiter: Option<SelfLimiter>,
}

/// Owns the limiters and counters of a proxy and runs transfers through
/// them.
///
/// A runner is shared between all connections, usually behind an [`Arc`].
#[derive(Debug)]
pub struct Runner {
    config: RateLimitConfig,
    concurrent_requests: Counter,
    health: HostLimiterStorage,
    send: Direction,
    recv: Direction,
    shutdown: CancellationToken,
}

impl Runner {
    /// Create a runner enforcing `config`
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not pass
    /// [`RateLimitConfig::validate`].
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            concurrent_requests: Counter::new(),
            health: HostLimiterStorage::new(HEALTH_RATE, HEALTH_BURST),
            send: Direction::new(&config),
            recv: Direction::new(&config),
            shutdown: CancellationToken::new(),
        })
    }

    /// The limits this runner enforces
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request as in flight until the returned guard is dropped
    #[must_use]
    pub fn track_request(&self) -> CounterGuard {
        self.concurrent_requests.track()
    }

    /// Number of requests and tunnels in flight
    #[must_use]
    pub fn concurrent_requests(&self) -> i64 {
        self.concurrent_requests.get()
    }

    /// Per-host limiters of the health endpoint
    #[must_use]
    pub const fn health_limiters(&self) -> &HostLimiterStorage {
        &self.health
    }

    /// Per-host limiters of uploads
    #[must_use]
    pub const fn send_limiters(&self) -> &HostLimiterStorage {
        &self.send.hosts
    }

    /// Per-host limiters of downloads
    #[must_use]
    pub const fn recv_limiters(&self) -> &HostLimiterStorage {
        &self.recv.hosts
    }

    /// Abort all running transfers.
    ///
    /// Transfers started afterwards are aborted immediately.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`Runner::shutdown`] was called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token that fires on [`Runner::shutdown`]
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn limits(&self, direction: &Direction, remote_host: &HostKey) -> TransferLimits {
        let handle = direction.hosts.get_limiter_handle(remote_host.clone());
        let combined = CombinedLimiter::new(handle.limiter(), Arc::clone(&direction.shared));

        let self_limiter = self.config.self_limit.then(|| {
            SelfLimiter::new(
                self.config.max_throughput,
                self.config.burst_size,
                &self.concurrent_requests,
            )
        });

        let mut chain: Vec<Arc<dyn Limiter>> = Vec::with_capacity(3);
        if let Some(self_limiter) = &self_limiter {
            chain.push(Arc::clone(&self_limiter.bucket) as Arc<dyn Limiter>);
        }
        chain.push(Arc::new(combined));
        chain.push(Arc::clone(&direction.main) as Arc<dyn Limiter>);

        TransferLimits {
            chain,
            _handle: handle,
            _self_limiter: self_limiter,
        }
    }

    async fn transfer<R, W>(
        &self,
        direction: &Direction,
        dst: &mut W,
        src: R,
        remote_host: &HostKey,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, CopyError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let limits = self.limits(direction, remote_host);
        let mut dst = MeteredWriter::new(dst, direction.bytes.clone(), Arc::clone(&direction.rate));
        copy_until_cancelled(&mut dst, src, &limits.chain, cancel).await
    }

    /// Relay `src` to `dst` as an upload of `remote_host`.
    ///
    /// # Errors
    ///
    /// Fails with a [`CopyError`] if either stream fails, a limiter refuses
    /// the transfer or the runner shuts down.
    pub async fn copy_send<R, W>(
        &self,
        dst: &mut W,
        src: R,
        remote_host: &HostKey,
    ) -> std::result::Result<u64, CopyError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.transfer(&self.send, dst, src, remote_host, &self.shutdown)
            .await
    }

    /// Relay `src` to `dst` as a download of `remote_host`.
    ///
    /// # Errors
    ///
    /// Fails with a [`CopyError`] if either stream fails, a limiter refuses
    /// the transfer or the runner shuts down.
    pub async fn copy_recv<R, W>(
        &self,
        dst: &mut W,
        src: R,
        remote_host: &HostKey,
    ) -> std::result::Result<u64, CopyError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.transfer(&self.recv, dst, src, remote_host, &self.shutdown)
            .await
    }

    /// Statistics as of now
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        let now = Instant::now();
        let metrics = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.metrics());

        RuntimeStats {
            upload_rate: self.send.rate.rate(),
            download_rate: self.recv.rate.rate(),
            guaranteed_send: self.send.hosts.guaranteed_throughput(),
            guaranteed_recv: self.recv.hosts.guaranteed_throughput(),
            bytes_sent: self.send.bytes.get(),
            bytes_received: self.recv.bytes.get(),
            send_hosts: self.send.hosts.n_hosts(),
            recv_hosts: self.recv.hosts.n_hosts(),
            concurrent_requests: self.concurrent_requests.get(),
            main_send_tokens: self.send.main.tokens_at(now),
            main_recv_tokens: self.recv.main.tokens_at(now),
            workers: metrics.as_ref().map(tokio::runtime::RuntimeMetrics::num_workers),
            alive_tasks: metrics
                .as_ref()
                .map(tokio::runtime::RuntimeMetrics::num_alive_tasks),
        }
    }
}
