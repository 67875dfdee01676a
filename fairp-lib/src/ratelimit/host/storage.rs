use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::HostKey;
use crate::ratelimit::TokenBucket;

#[derive(Debug, Default)]
struct Inner {
    limiter_usage: HashMap<HostKey, i64>,
    limiters: HashMap<HostKey, Arc<TokenBucket>>,
}

impl Inner {
    /// Give every active limiter an even share of `max_throughput`
    fn redistribute(&self, max_throughput: f64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let rate = max_throughput / self.limiters.len() as f64;
        for limiter in self.limiters.values() {
            limiter.set_rate(rate);
        }
        rate
    }

    fn assert_in_sync(&self, host: &HostKey) {
        let used = self.limiter_usage.contains_key(host);
        let present = self.limiters.contains_key(host);
        assert!(
            used == present,
            "host limiter maps out of sync for {host}: usage entry {used}, limiter entry {present}"
        );
    }
}

/// Reference counted per-host limiters that split a fixed throughput evenly.
///
/// Whenever a host becomes active or goes idle, the rate of every active
/// host's limiter is set to `max_throughput / active_hosts` before the call
/// returns. Cloning the storage yields another handle to the same hosts.
#[derive(Debug, Clone)]
pub struct HostLimiterStorage {
    inner: Arc<Mutex<Inner>>,
    max_throughput: f64,
    burst: usize,
}

impl HostLimiterStorage {
    /// Create an empty storage.
    ///
    /// `max_throughput` is in tokens per second and is split among all
    /// active hosts; every limiter holds at most `burst` tokens.
    #[must_use]
    pub fn new(max_throughput: f64, burst: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_throughput,
            burst,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out the limiter of `host`, creating it if the host was idle.
    ///
    /// The host stays active until the returned handle is closed or
    /// dropped.
    #[must_use]
    pub fn get_limiter_handle(&self, host: impl Into<HostKey>) -> HostLimiterHandle {
        let host = host.into();
        let mut inner = self.lock();
        inner.assert_in_sync(&host);

        *inner.limiter_usage.entry(host.clone()).or_insert(0) += 1;

        let limiter = if let Some(limiter) = inner.limiters.get(&host) {
            Arc::clone(limiter)
        } else {
            let limiter = Arc::new(TokenBucket::new(self.max_throughput, self.burst));
            inner.limiters.insert(host.clone(), Arc::clone(&limiter));
            let rate = inner.redistribute(self.max_throughput);
            log::debug!(
                "Host became active host={host} hosts={} rate={rate:.0}",
                inner.limiters.len()
            );
            limiter
        };

        HostLimiterHandle {
            storage: self.clone(),
            host,
            limiter,
        }
    }

    fn release(&self, host: &HostKey) {
        let mut inner = self.lock();
        inner.assert_in_sync(host);

        let Some(usage) = inner.limiter_usage.get_mut(host) else {
            panic!("released host {host} which has no active limiter");
        };
        *usage -= 1;
        let usage = *usage;

        assert!(usage >= 0, "limiter usage of {host} dropped below zero");
        if usage > 0 {
            return;
        }

        inner.limiter_usage.remove(host);
        inner.limiters.remove(host);
        if inner.limiters.is_empty() {
            log::debug!("Host went idle host={host} hosts=0");
            return;
        }

        let rate = inner.redistribute(self.max_throughput);
        log::debug!(
            "Host went idle host={host} hosts={} rate={rate:.0}",
            inner.limiters.len()
        );
    }

    /// The rate each active host is currently guaranteed.
    ///
    /// With no active hosts this is the full throughput a new host would
    /// get.
    #[must_use]
    pub fn guaranteed_throughput(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let hosts = self.n_hosts().max(1) as f64;
        self.max_throughput / hosts
    }

    /// Number of hosts with at least one open handle
    #[must_use]
    pub fn n_hosts(&self) -> usize {
        self.lock().limiters.len()
    }

    /// Current rate of the limiter of `host`, if it is active
    #[must_use]
    pub fn host_rate(&self, host: &HostKey) -> Option<f64> {
        self.lock().limiters.get(host).map(|limiter| limiter.rate())
    }

    /// Throughput shared by all hosts
    #[must_use]
    pub const fn max_throughput(&self) -> f64 {
        self.max_throughput
    }

    #[cfg(test)]
    fn usage(&self, host: &HostKey) -> Option<i64> {
        self.lock().limiter_usage.get(host).copied()
    }
}

/// A checked-out per-host limiter.
///
/// Releases its host exactly once, either through [`HostLimiterHandle::close`]
/// or when dropped.
#[derive(Debug)]
pub struct HostLimiterHandle {
    storage: HostLimiterStorage,
    host: HostKey,
    limiter: Arc<TokenBucket>,
}

impl HostLimiterHandle {
    /// The host's limiter; its rate follows the number of active hosts
    #[must_use]
    pub fn limiter(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.limiter)
    }

    /// The host this handle belongs to
    #[must_use]
    pub const fn host(&self) -> &HostKey {
        &self.host
    }

    /// Release the host
    pub fn close(self) {
        // Drop does the work
    }
}

impl Drop for HostLimiterHandle {
    fn drop(&mut self) {
        self.storage.release(&self.host);
    }
}
