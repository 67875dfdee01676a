//! Byte-rate measurement over fixed intervals.

use std::fmt;
use std::io;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// Shortest measurement interval; shorter ones are raised to this
pub const MIN_RATE_INTERVAL: Duration = Duration::from_millis(1);

/// Bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Rate(pub f64);

impl Rate {
    /// The rate in mebibytes per second, handy for human readable output
    #[must_use]
    pub fn as_mib_per_sec(self) -> f64 {
        self.0 / 1024.0 / 1024.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} MB/s", self.as_mib_per_sec())
    }
}

#[derive(Debug)]
struct Intervals {
    last_interval_finish: Instant,
    last_interval_bytes: u64,
    this_interval_bytes: u64,
}

impl Intervals {
    fn record(&mut self, now: Instant, interval: Duration, bytes: usize) {
        if now > self.last_interval_finish + interval {
            self.last_interval_finish = now;
            self.last_interval_bytes = self.this_interval_bytes;
            self.this_interval_bytes = 0;
        }
        self.this_interval_bytes += bytes as u64;
    }
}

/// A measurement sink that counts bytes written to it and reports the
/// throughput of the last fully elapsed interval.
///
/// Writes never fail and always report the full length as written.
#[derive(Debug)]
pub struct RateCountingWriter {
    interval: Duration,
    intervals: RwLock<Intervals>,
}

impl RateCountingWriter {
    /// Create a writer measuring over windows of `interval`, at least
    /// [`MIN_RATE_INTERVAL`]
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_RATE_INTERVAL),
            intervals: RwLock::new(Intervals {
                last_interval_finish: Instant::now(),
                last_interval_bytes: 0,
                this_interval_bytes: 0,
            }),
        }
    }

    /// Account for `buf.len()` bytes, rolling the window first if the
    /// current interval has elapsed
    pub fn write(&self, buf: &[u8]) -> usize {
        self.record(buf.len());
        buf.len()
    }

    /// Account for `bytes` bytes without needing the data itself
    pub fn record(&self, bytes: usize) {
        let now = Instant::now();
        self.intervals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record(now, self.interval, bytes);
    }

    /// The throughput of the last completed interval.
    ///
    /// A partially elapsed interval never counts. When no bytes arrived for
    /// two or more intervals the rate drops to zero instead of repeating the
    /// last nonzero value.
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(&self) -> Rate {
        loop {
            let now = Instant::now();
            {
                let intervals = self.intervals.read().unwrap_or_else(PoisonError::into_inner);
                if now <= intervals.last_interval_finish + self.interval * 2 {
                    return Rate(intervals.last_interval_bytes as f64 / self.interval.as_secs_f64());
                }
            }
            // stale window: roll it forward with an empty write
            self.record(0);
        }
    }
}

impl io::Write for &RateCountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(RateCountingWriter::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
