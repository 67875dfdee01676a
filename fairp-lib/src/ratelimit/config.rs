use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ErrorKind, Result};

/// Default burst of every byte limiter
pub const DEFAULT_BURST_SIZE: usize = 2 * 1024 * 1024;

/// Default fraction of the throughput that is split among hosts
pub const DEFAULT_GUARANTEED_SHARE: f64 = 0.5;

/// Default measurement interval of the throughput counters
pub const DEFAULT_RATE_INTERVAL: Duration = Duration::from_secs(1);

/// Bandwidth limits of a [`crate::Runner`].
///
/// All throughput values are in bytes per second and apply to each
/// direction separately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global ceiling per direction
    pub max_throughput: f64,

    /// Burst of every byte limiter, also the largest single read
    #[serde(default = "default_burst_size")]
    pub burst_size: usize,

    /// Fraction of `max_throughput` that is divided evenly among active
    /// hosts; the remainder forms the shared pool
    #[serde(default = "default_guaranteed_share")]
    pub guaranteed_share: f64,

    /// Additionally limit every transfer to `max_throughput / concurrent
    /// requests`
    #[serde(default)]
    pub self_limit: bool,

    /// Measurement interval of the upload and download rate
    #[serde(default = "default_rate_interval", with = "humantime_serde")]
    pub rate_interval: Duration,
}

/// Default burst of every byte limiter
const fn default_burst_size() -> usize {
    DEFAULT_BURST_SIZE
}

/// Default fraction of the throughput that is split among hosts
const fn default_guaranteed_share() -> f64 {
    DEFAULT_GUARANTEED_SHARE
}

/// Default measurement interval of the throughput counters
const fn default_rate_interval() -> Duration {
    DEFAULT_RATE_INTERVAL
}

impl RateLimitConfig {
    /// Create a config with the given ceiling and defaults for everything
    /// else
    #[must_use]
    pub const fn new(max_throughput: f64) -> Self {
        Self {
            max_throughput,
            burst_size: DEFAULT_BURST_SIZE,
            guaranteed_share: DEFAULT_GUARANTEED_SHARE,
            self_limit: false,
            rate_interval: DEFAULT_RATE_INTERVAL,
        }
    }

    /// Check that the limits describe a usable proxy
    ///
    /// # Errors
    ///
    /// Returns an error if the throughput is not a positive finite number,
    /// the burst is zero, the share lies outside `(0, 1]`, or the rate
    /// interval is zero.
    pub fn validate(&self) -> Result<()> {
        if !self.max_throughput.is_finite() || self.max_throughput <= 0.0 {
            return Err(ErrorKind::InvalidMaxThroughput(self.max_throughput));
        }
        if self.burst_size == 0 {
            return Err(ErrorKind::InvalidBurstSize);
        }
        // Hosts fall back to their own bucket when the pool is empty, so it
        // must refill
        if !(self.guaranteed_share > 0.0 && self.guaranteed_share <= 1.0) {
            return Err(ErrorKind::InvalidGuaranteedShare(self.guaranteed_share));
        }
        if self.rate_interval.is_zero() {
            return Err(ErrorKind::InvalidRateInterval);
        }
        Ok(())
    }

    /// Throughput divided among active hosts
    #[must_use]
    pub fn host_throughput(&self) -> f64 {
        self.max_throughput * self.guaranteed_share
    }

    /// Throughput of the pool any host may draw from
    #[must_use]
    pub fn shared_throughput(&self) -> f64 {
        self.max_throughput * (1.0 - self.guaranteed_share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = RateLimitConfig::new(1000.0);
        assert_eq!(config.burst_size, 2 * 1024 * 1024);
        assert_eq!(config.rate_interval, Duration::from_secs(1));
        assert!(!config.self_limit);
        assert!((config.host_throughput() - 500.0).abs() < 1e-9);
        assert!((config.shared_throughput() - 500.0).abs() < 1e-9);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RateLimitConfig = toml::from_str("max_throughput = 2048.0").unwrap();
        assert_eq!(config, RateLimitConfig::new(2048.0));

        let config: RateLimitConfig = toml::from_str(
            r#"
            max_throughput = 100.0
            guaranteed_share = 0.75
            rate_interval = "500ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_interval, Duration::from_millis(500));
        assert!((config.shared_throughput() - 25.0).abs() < 1e-9);
    }

    #[rstest]
    #[case(RateLimitConfig::new(0.0))]
    #[case(RateLimitConfig::new(-1.0))]
    #[case(RateLimitConfig::new(f64::NAN))]
    #[case(RateLimitConfig::new(f64::INFINITY))]
    #[case(RateLimitConfig { burst_size: 0, ..RateLimitConfig::new(1.0) })]
    #[case(RateLimitConfig { guaranteed_share: 1.5, ..RateLimitConfig::new(1.0) })]
    #[case(RateLimitConfig { guaranteed_share: 0.0, ..RateLimitConfig::new(1.0) })]
    #[case(RateLimitConfig { guaranteed_share: -0.5, ..RateLimitConfig::new(1.0) })]
    #[case(RateLimitConfig { guaranteed_share: f64::NAN, ..RateLimitConfig::new(1.0) })]
    #[case(RateLimitConfig { rate_interval: Duration::ZERO, ..RateLimitConfig::new(1.0) })]
    fn test_invalid_configs(#[case] config: RateLimitConfig) {
        assert!(config.validate().is_err());
    }
}
