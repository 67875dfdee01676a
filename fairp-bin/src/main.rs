//! `fairp` is a forward HTTP(S) proxy that shares a global bandwidth ceiling
//! fairly between the hosts it serves.
//!
//! The fairp binary is a wrapper around fairp-lib, which provides the rate
//! limiting and the proxy itself.
//!
//! Run it with a ceiling of 10 MiB/s per direction:
//! ```sh
//! fairp --max-throughput 10M
//! ```
//!
//! Listen on another port and log more:
//! ```sh
//! fairp --max-throughput 512K --port 3128 -v
//! ```
//!
//! Every option can also be set through a `FAIRP_*` environment variable or
//! in a `fairp.toml` config file:
//! ```toml
//! max_throughput = "10M"
//! port = 3128
//! self_limit = true
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fairp_lib::ratelimit::RateLimitConfig;
use fairp_lib::{Runner, proxy::Proxy};
use log::{error, info, warn};
use tokio::net::TcpListener;

mod logging;
mod options;
mod parse;
mod runtime_log;
mod verbosity;

use crate::logging::init_logging;
use crate::options::{Config, FAIRP_CONFIG_FILE, FairpOptions};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator, such as a port that cannot be bound.
    #[allow(unused)]
    UnexpectedFailure = 1,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap the main code in another function to ensure that.
    // See: https://doc.rust-lang.org/stable/std/process/fn.exit.html
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Merge all provided config options into one.
/// This includes a potential config file, command-line- and environment variables
fn load_config() -> Result<FairpOptions> {
    let mut opts = FairpOptions::parse();

    // Load a potentially existing config file and merge it into the config from
    // the CLI
    if let Some(config_file) = &opts.config_file {
        match Config::load_from_file(config_file) {
            Ok(c) => opts.config.merge(c),
            Err(e) => {
                init_logging(&opts.config.verbose);
                bail!(
                    "Cannot load configuration file `{}`: {e:?}",
                    config_file.display()
                );
            }
        }
    } else {
        // Without an explicit config file, the default one is used if it
        // exists. An invalid default file is still an error.
        let default_config = PathBuf::from(FAIRP_CONFIG_FILE);
        if default_config.is_file() {
            match Config::load_from_file(&default_config) {
                Ok(c) => opts.config.merge(c),
                Err(e) => {
                    init_logging(&opts.config.verbose);
                    bail!(
                        "Cannot load default configuration file `{}`: {e:?}",
                        default_config.display()
                    );
                }
            }
        }
    }

    // The config file may change the verbosity, so logging starts after the merge
    init_logging(&opts.config.verbose);

    if opts.config.runtime_log_interval.is_zero() {
        bail!("`runtime_log_interval` must be greater than zero");
    }

    Ok(opts)
}

/// Set up runtime and call fairp entrypoint
fn run_main() -> Result<i32> {
    use std::process::exit;

    let (opts, limits) = match load_config()
        .and_then(|opts| opts.config.rate_limit_config().map(|limits| (opts, limits)))
    {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Error while loading config: {e:#}");
            exit(ExitCode::ConfigFile as i32);
        }
    };

    let runtime = match opts.config.threads {
        Some(threads) => {
            // We define our own runtime instead of the `tokio::main` attribute
            // since we want to make the number of threads configurable
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(threads)
                .enable_all()
                .build()?
        }
        None => tokio::runtime::Runtime::new()?,
    };

    runtime.block_on(run(&opts.config, limits))?;
    Ok(ExitCode::Success as i32)
}

/// Bind the listening socket, preferring a dual-stack IPv6 socket
async fn bind(port: u16) -> Result<TcpListener> {
    let any_v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    match TcpListener::bind(any_v6).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!("Cannot listen on {any_v6} ({e}), falling back to IPv4");
            let any_v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            TcpListener::bind(any_v4)
                .await
                .with_context(|| format!("Cannot listen on port {port}"))
        }
    }
}

/// Run the proxy until interrupted
async fn run(config: &Config, limits: RateLimitConfig) -> Result<()> {
    let runner = Arc::new(Runner::new(limits)?);
    let proxy = Proxy::new(Arc::clone(&runner), config.proxy_options())?;
    let listener = bind(config.port).await?;

    info!(
        "Starting fairp max_throughput={} burst_size={} guaranteed_share={} self_limit={}",
        limits.max_throughput, limits.burst_size, limits.guaranteed_share, limits.self_limit
    );

    tokio::spawn(runtime_log::run(
        Arc::clone(&runner),
        config.runtime_log_interval,
    ));

    let shutdown = Arc::clone(&runner);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for the interrupt signal: {e}");
            return;
        }
        info!("Interrupted, shutting down");
        shutdown.shutdown();
    });

    proxy.serve(listener).await?;
    Ok(())
}
