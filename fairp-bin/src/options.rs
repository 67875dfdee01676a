use crate::parse::parse_byte_count;
use crate::verbosity::Verbosity;
use anyhow::{Context, Error, Result, anyhow};
use clap::Parser;
use const_format::{concatcp, formatcp};
use fairp_lib::proxy::{DEFAULT_DIAL_TIMEOUT, ProxyOptions};
use fairp_lib::ratelimit::{
    DEFAULT_BURST_SIZE, DEFAULT_GUARANTEED_SHARE, DEFAULT_RATE_INTERVAL, RateLimitConfig,
};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::{fmt, fs, path::PathBuf, str::FromStr, time::Duration};

pub(crate) const FAIRP_CONFIG_FILE: &str = "fairp.toml";

const DEFAULT_PORT: u16 = 8888;
const DEFAULT_RUNTIME_LOG_INTERVAL: Duration = Duration::from_secs(10);

// clap needs `&str` defaults, serde and `fold_in!` need the typed values
const PORT_STR: &str = concatcp!(DEFAULT_PORT);
const BURST_SIZE_STR: &str = concatcp!(DEFAULT_BURST_SIZE);
const GUARANTEED_SHARE_STR: &str = "0.5";
const RATE_INTERVAL_STR: &str = "1s";
const DIAL_TIMEOUT_STR: &str = "10s";
const RUNTIME_LOG_INTERVAL_STR: &str = "10s";

// The config file is only an error when it was given explicitly, so the
// default is shown in the help text instead of being a clap default.
const HELP_MSG_CONFIG_FILE: &str = formatcp!(
    "Configuration file to use\n\n[default: {}]",
    FAIRP_CONFIG_FILE,
);

/// A number of bytes, or bytes per second, parsed from `10M`-style strings
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub(crate) struct ByteCount(pub(crate) f64);

impl FromStr for ByteCount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_count(s).map(ByteCount)
    }
}

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// TOML may hold either a plain number or a string with a unit
impl<'de> Deserialize<'de> for ByteCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) if n.is_finite() && n >= 0.0 => Ok(ByteCount(n)),
            Raw::Number(n) => Err(serde::de::Error::custom(format!(
                "byte count must be a non-negative number, got `{n}`"
            ))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// Macro for generating default functions to be used by serde
macro_rules! default_function {
    ( $( $name:ident : $T:ty = $e:expr; )* ) => {
        $(
            #[allow(clippy::missing_const_for_fn)]
            fn $name() -> $T {
                $e
            }
        )*
    };
}

// Generate the functions for serde defaults
default_function! {
    burst_size: ByteCount = ByteCount(DEFAULT_BURST_SIZE as f64);
    guaranteed_share: f64 = DEFAULT_GUARANTEED_SHARE;
    rate_interval: Duration = DEFAULT_RATE_INTERVAL;
    port: u16 = DEFAULT_PORT;
    dial_timeout: Duration = DEFAULT_DIAL_TIMEOUT;
    runtime_log_interval: Duration = DEFAULT_RUNTIME_LOG_INTERVAL;
    verbosity: Verbosity = Verbosity::default();
}

// Macro for merging configuration values
macro_rules! fold_in {
    ($cli:ident , $toml:ident ; $ty:ident { $(..$ignore:ident,)* $( $key:ident : $default:expr, )* } ) => {
        if (false) {
            #[allow(dead_code, unused, clippy::diverging_sub_expression)]
            let _check_fold_in_exhaustivity = $ty {
                $($key: unreachable!(), )*
                $($ignore: unreachable!(), )*
            };
        };
        $(
            if $cli.$key == $default && $toml.$key != $default {
                $cli.$key = $toml.$key;
            }
        )*
    };
}

/// fairp is a forward HTTP(S) proxy that enforces a global bandwidth
/// ceiling and splits it fairly between the remote hosts it serves.
///
/// Every client host is guaranteed an even share of the ceiling; bandwidth
/// a host does not use goes to a shared pool anyone may draw from.
#[derive(Parser, Debug)]
#[command(version, about, next_display_order = None)]
pub(crate) struct FairpOptions {
    /// Configuration file to use
    #[arg(short, long = "config", env = "FAIRP_CONFIG")]
    #[arg(help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) config: Config,
}

/// The main configuration for fairp
#[derive(Parser, Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Verbose program output
    #[clap(flatten)]
    #[serde(default = "verbosity")]
    pub(crate) verbose: Verbosity,

    /// Global bandwidth ceiling per direction, in bytes per second
    #[arg(
        short,
        long,
        env = "FAIRP_MAX_THROUGHPUT",
        value_name = "BYTES",
        long_help = "Global bandwidth ceiling per direction, in bytes per second.

Accepts binary unit suffixes: `512K`, `10M`, `1.5G`. Uploads and downloads
are limited separately, each to this value. Required, either here or as
`max_throughput` in the config file."
    )]
    #[serde(default)]
    pub(crate) max_throughput: Option<ByteCount>,

    /// Burst of every byte limiter, also the largest chunk read at once
    #[arg(long, env = "FAIRP_BURST_SIZE", value_name = "BYTES", default_value = BURST_SIZE_STR)]
    #[serde(default = "burst_size")]
    pub(crate) burst_size: ByteCount,

    /// Fraction of the ceiling split evenly among active hosts
    #[arg(
        long,
        env = "FAIRP_GUARANTEED_SHARE",
        default_value = GUARANTEED_SHARE_STR,
        long_help = "Fraction of the ceiling split evenly among active hosts.

The rest forms a shared pool that any host may draw from when its own share
is used up. Must be greater than 0 and at most 1."
    )]
    #[serde(default = "guaranteed_share")]
    pub(crate) guaranteed_share: f64,

    /// Also limit every transfer to the ceiling divided by the number of
    /// requests in flight
    #[arg(long, env = "FAIRP_SELF_LIMIT")]
    #[serde(default)]
    pub(crate) self_limit: bool,

    /// Interval over which upload and download speeds are measured
    #[arg(long, env = "FAIRP_RATE_INTERVAL", value_parser = humantime::parse_duration, default_value = RATE_INTERVAL_STR)]
    #[serde(default = "rate_interval", with = "humantime_serde")]
    pub(crate) rate_interval: Duration,

    /// Port to listen on
    #[arg(short, long, env = "FAIRP_PORT", default_value = PORT_STR)]
    #[serde(default = "port")]
    pub(crate) port: u16,

    /// Connect to tunnel destinations over IPv6 only
    #[arg(long, env = "FAIRP_NO_IPV4")]
    #[serde(default)]
    pub(crate) no_ipv4: bool,

    /// Time allowed for connecting to a tunnel destination
    #[arg(long, env = "FAIRP_DIAL_TIMEOUT", value_parser = humantime::parse_duration, default_value = DIAL_TIMEOUT_STR)]
    #[serde(default = "dial_timeout", with = "humantime_serde")]
    pub(crate) dial_timeout: Duration,

    /// How often to log runtime statistics
    #[arg(long, env = "FAIRP_RUNTIME_LOG_INTERVAL", value_parser = humantime::parse_duration, default_value = RUNTIME_LOG_INTERVAL_STR)]
    #[serde(default = "runtime_log_interval", with = "humantime_serde")]
    pub(crate) runtime_log_interval: Duration,

    /// Number of threads to utilize.
    /// Defaults to number of cores available to the system
    #[arg(short = 'T', long, env = "FAIRP_THREADS", verbatim_doc_comment)]
    #[serde(default)]
    pub(crate) threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: verbosity(),
            max_throughput: None,
            burst_size: burst_size(),
            guaranteed_share: guaranteed_share(),
            self_limit: false,
            rate_interval: rate_interval(),
            port: port(),
            no_ipv4: false,
            dial_timeout: dial_timeout(),
            runtime_log_interval: runtime_log_interval(),
            threads: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        // Read configuration file
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }

    /// Merge the configuration from TOML into the CLI configuration
    pub(crate) fn merge(&mut self, toml: Config) {
        // NOTE: if you see an error within this macro call, check to make sure that
        // that the fields provided to fold_in! match all the fields of the Config struct.
        fold_in! {
            // Destination and source configs
            self, toml;

            Config {
                // Keys with defaults to assign
                verbose: Verbosity::default(),
                max_throughput: None,
                burst_size: burst_size(),
                guaranteed_share: DEFAULT_GUARANTEED_SHARE,
                self_limit: false,
                rate_interval: DEFAULT_RATE_INTERVAL,
                port: DEFAULT_PORT,
                no_ipv4: false,
                dial_timeout: DEFAULT_DIAL_TIMEOUT,
                runtime_log_interval: DEFAULT_RUNTIME_LOG_INTERVAL,
                threads: None,
            }
        }
    }

    /// The bandwidth limits of the proxy
    ///
    /// Fails if no ceiling was configured or the limits are unusable.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(crate) fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        let max_throughput = self.max_throughput.ok_or_else(|| {
            anyhow!(
                "No bandwidth ceiling configured; pass `--max-throughput`, set `FAIRP_MAX_THROUGHPUT` or add `max_throughput` to `{FAIRP_CONFIG_FILE}`"
            )
        })?;

        let config = RateLimitConfig {
            max_throughput: max_throughput.0,
            burst_size: self.burst_size.0 as usize,
            guaranteed_share: self.guaranteed_share,
            self_limit: self.self_limit,
            rate_interval: self.rate_interval,
        };
        config.validate().context("Invalid rate limits")?;
        Ok(config)
    }

    /// How the proxy reaches destinations
    pub(crate) const fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            no_ipv4: self.no_ipv4,
            dial_timeout: self.dial_timeout,
        }
    }
}
