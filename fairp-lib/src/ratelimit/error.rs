use std::io;

use thiserror::Error;

/// Errors that can occur while waiting on a limiter
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitError {
    /// More tokens were requested than the limiter can ever hand out at once
    #[error("Requested {requested} tokens, but the limiter burst is {burst}")]
    ExceedsBurst {
        /// Number of requested tokens
        requested: usize,
        /// Burst size of the limiter
        burst: usize,
    },

    /// The tokens would only become available after the caller's deadline
    #[error("Waiting for {requested} tokens would exceed the deadline")]
    WouldExceedDeadline {
        /// Number of requested tokens
        requested: usize,
    },
}

impl LimitError {
    /// Recover a [`LimitError`] that travelled through an [`io::Error`]
    pub(crate) fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<Self>())
            .copied()
    }
}

impl From<LimitError> for io::Error {
    fn from(err: LimitError) -> Self {
        io::Error::other(err)
    }
}

/// Errors that can terminate a rate limited copy.
///
/// Every variant carries the number of bytes that had already reached the
/// destination.
#[derive(Error, Debug)]
pub enum CopyError {
    /// Reading from the source or writing to the destination failed
    #[error("I/O error after {written} bytes: {source}")]
    Io {
        /// Bytes written before the failure
        written: u64,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// One of the limiters refused to hand out tokens
    #[error("Rate limiter failed after {written} bytes: {source}")]
    Limit {
        /// Bytes written before the failure
        written: u64,
        /// The limiter error
        #[source]
        source: LimitError,
    },

    /// The copy was cancelled from the outside
    #[error("Transfer cancelled after {written} bytes")]
    Cancelled {
        /// Bytes written before cancellation
        written: u64,
    },
}

impl CopyError {
    /// Classify an I/O error raised somewhere inside the reader chain
    pub(crate) fn from_io(source: io::Error, written: u64) -> Self {
        match LimitError::from_io(&source) {
            Some(source) => Self::Limit { written, source },
            None => Self::Io { written, source },
        }
    }

    /// Bytes that had been written before the copy stopped
    #[must_use]
    pub const fn written(&self) -> u64 {
        match self {
            Self::Io { written, .. } | Self::Limit { written, .. } | Self::Cancelled { written } => {
                *written
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_survives_io_error() {
        let err = LimitError::ExceedsBurst {
            requested: 10,
            burst: 5,
        };
        let io_err: io::Error = err.into();
        assert_eq!(LimitError::from_io(&io_err), Some(err));

        let copy_err = CopyError::from_io(io_err, 42);
        assert!(matches!(
            copy_err,
            CopyError::Limit {
                written: 42,
                source: LimitError::ExceedsBurst { .. }
            }
        ));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let io_err = io::Error::from(io::ErrorKind::UnexpectedEof);
        let copy_err = CopyError::from_io(io_err, 7);
        assert!(matches!(copy_err, CopyError::Io { written: 7, .. }));
        assert_eq!(copy_err.written(), 7);
    }
}
