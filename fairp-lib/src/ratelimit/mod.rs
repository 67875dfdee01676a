//! Fair-share bandwidth limiting.
//!
//! Every byte a [`crate::Runner`] relays is paid for with tokens from a
//! chain of limiters:
//!
//! - [`TokenBucket`]: token bucket whose rate can change while it is in use
//! - [`HostLimiterStorage`]: hands out one [`TokenBucket`] per active remote
//!   host and keeps their rates at an even split of the host throughput
//! - [`CombinedLimiter`]: a host's guaranteed bucket backed by a shared pool
//! - [`RateLimitedReader`] and [`copy`]: stream adapters paying for bytes
//!   before they are handed on
//! - [`RateLimitConfig`]: the limits of a proxy

mod combined;
mod config;
mod copy;
mod error;
mod host;
mod limiter;
mod reader;

pub use combined::CombinedLimiter;
pub use config::{
    DEFAULT_BURST_SIZE, DEFAULT_GUARANTEED_SHARE, DEFAULT_RATE_INTERVAL, RateLimitConfig,
};
pub use copy::{copy, copy_until_cancelled};
pub use error::{CopyError, LimitError};
pub use host::{HostKey, HostLimiterHandle, HostLimiterStorage};
pub use limiter::{Limiter, TokenBucket, TokenRate};
pub use reader::RateLimitedReader;
