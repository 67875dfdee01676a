//! `fairp` is a library for proxying HTTP(S) traffic under a global bandwidth
//! ceiling that is shared fairly between remote hosts.
//!
//! The quickest way to run a proxy:
//! ```no_run
//! use std::sync::Arc;
//! use fairp_lib::{Result, Runner, proxy::ProxyOptions, ratelimit::RateLimitConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   // 10 MiB/s in each direction
//!   let runner = Arc::new(Runner::new(RateLimitConfig::new(10.0 * 1024.0 * 1024.0))?);
//!   let listener = tokio::net::TcpListener::bind("[::]:8888").await?;
//!   fairp_lib::proxy::serve(runner, listener, ProxyOptions::default()).await
//! }
//! ```
//!
//! The building blocks can also be used on their own, for example to relay
//! any pair of streams through the fair-share limiters:
//!
//! ```
//! use fairp_lib::{Result, Runner, ratelimit::{HostKey, RateLimitConfig}};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let runner = Runner::new(RateLimitConfig::new(1024.0 * 1024.0))?;
//!   let mut received = Vec::new();
//!   let n = runner
//!       .copy_recv(&mut received, &b"hello"[..], &HostKey::from("192.0.2.1"))
//!       .await?;
//!   assert_eq!(n, 5);
//!   Ok(())
//! }
//! ```
#![deny(missing_docs)]

mod counter;
mod metered;
mod rate_counter;
mod runner;
mod types;

pub mod proxy;
pub mod ratelimit;

pub use counter::{Counter, CounterGuard, Ticket};
pub use metered::MeteredWriter;
pub use rate_counter::{MIN_RATE_INTERVAL, Rate, RateCountingWriter};
pub use runner::{Runner, RuntimeStats, Side, TunnelReport};
pub use types::*;
