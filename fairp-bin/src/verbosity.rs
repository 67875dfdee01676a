//! `-v` / `-q` flags that shift the log level of fairp around `info`.
//!
//! The same setting can be given in the config file as a level name:
//!
//! ```toml
//! verbose = "debug"
//! ```

use log::{Level, LevelFilter};
use serde::Deserialize;
use std::fmt;

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    /// Log more; pass twice for trace output
    ///
    /// fairp logs at `info` by default: every request, tunnel and the
    /// periodic runtime statistics. `-v` adds per-connection debug detail
    /// such as host activation and request headers, `-vv` enables trace.
    #[arg(
        long,
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet",
    )]
    verbose: u8,

    /// Log less; pass up to three times
    ///
    /// `-q` only keeps warnings, `-qq` errors, `-qqq` silences fairp.
    #[arg(
        long,
        short = 'q',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "verbose",
    )]
    quiet: u8,
}

impl Verbosity {
    /// Get the log level filter for fairp's own modules.
    pub(crate) fn log_level_filter(&self) -> LevelFilter {
        match self.verbosity() {
            i16::MIN..=-1 => LevelFilter::Off,
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            3 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    const fn verbosity(&self) -> i16 {
        level_value(Level::Info) - self.quiet as i16 + self.verbose as i16
    }
}

// Accepts a level name such as "warn", "warning" or "Debug"
impl<'de> Deserialize<'de> for Verbosity {
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let level = match s.to_lowercase().as_str() {
            "off" => return Ok(Verbosity { verbose: 0, quiet: 3 }),
            "error" => Level::Error,
            "warn" | "warning" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            level => {
                return Err(serde::de::Error::custom(format!(
                    "invalid log level `{level}`"
                )));
            }
        };

        let shift = level_value(level) - level_value(Level::Info);
        Ok(if shift < 0 {
            Verbosity {
                verbose: 0,
                quiet: shift.unsigned_abs() as u8,
            }
        } else {
            Verbosity {
                verbose: shift as u8,
                quiet: 0,
            }
        })
    }
}

const fn level_value(level: Level) -> i16 {
    match level {
        Level::Error => 0,
        Level::Warn => 1,
        Level::Info => 2,
        Level::Debug => 3,
        Level::Trace => 4,
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.log_level_filter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Debug, Parser)]
    struct Cli {
        #[clap(flatten)]
        verbose: Verbosity,
    }

    #[test]
    fn verify_app() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_log_level() {
        assert_eq!(Verbosity::default().log_level_filter(), LevelFilter::Info);
    }

    #[rstest]
    #[case(&["fairp"], LevelFilter::Info)]
    #[case(&["fairp", "-v"], LevelFilter::Debug)]
    #[case(&["fairp", "-vv"], LevelFilter::Trace)]
    #[case(&["fairp", "-vvvvv"], LevelFilter::Trace)]
    #[case(&["fairp", "-q"], LevelFilter::Warn)]
    #[case(&["fairp", "-qq"], LevelFilter::Error)]
    #[case(&["fairp", "-qqq"], LevelFilter::Off)]
    fn test_flags(#[case] args: &[&str], #[case] expected: LevelFilter) {
        let cli = Cli::parse_from(args);
        assert_eq!(cli.verbose.log_level_filter(), expected);
    }

    #[rstest]
    #[case("error", LevelFilter::Error)]
    #[case("Warning", LevelFilter::Warn)]
    #[case("info", LevelFilter::Info)]
    #[case("DEBUG", LevelFilter::Debug)]
    #[case("trace", LevelFilter::Trace)]
    #[case("off", LevelFilter::Off)]
    fn test_deserialize_level(#[case] name: &str, #[case] expected: LevelFilter) {
        #[derive(Deserialize)]
        struct Wrapper {
            verbose: Verbosity,
        }

        let wrapper: Wrapper = toml::from_str(&format!("verbose = \"{name}\"")).unwrap();
        assert_eq!(wrapper.verbose.log_level_filter(), expected);
    }

    #[test]
    fn test_deserialize_unknown_level() {
        #[derive(Debug, Deserialize)]
        struct Wrapper {
            #[allow(dead_code)]
            verbose: Verbosity,
        }

        let err = toml::from_str::<Wrapper>("verbose = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("invalid log level `loud`"));
    }
}
