use http::StatusCode;
use thiserror::Error;

use crate::ratelimit::CopyError;

/// Possible errors when running `fairp_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The global throughput ceiling is not a positive, finite number
    #[error("Maximum throughput must be a positive number of bytes per second, got {0}")]
    InvalidMaxThroughput(f64),
    /// A burst of zero bytes would never let a single byte through
    #[error("Burst size must be at least one byte")]
    InvalidBurstSize,
    /// The guaranteed share of the throughput is outside of `(0, 1]`
    #[error("Guaranteed share must be in the range (0, 1], got {0}")]
    InvalidGuaranteedShare(f64),
    /// The interval used for rate measurement is zero
    #[error("Rate measurement interval must be longer than zero")]
    InvalidRateInterval,
    /// A CONNECT request or a proxied request did not name a destination
    #[error("Request does not contain a destination host: `{0}`")]
    MissingDestination(String),
    /// Connecting to the destination of a tunnel failed
    #[error("Cannot connect to destination `{destination}`: {source}")]
    Dial {
        /// The `host:port` the proxy tried to reach
        destination: String,
        /// The underlying connection error
        #[source]
        source: std::io::Error,
    },
    /// Connecting to the destination of a tunnel took too long
    #[error("Timed out connecting to destination `{0}`")]
    DialTimeout(String),
    /// IPv4 is disabled and the destination has no IPv6 address
    #[error("Destination `{0}` does not resolve to an IPv6 address")]
    NoIpv6Address(String),
    /// Taking over the client connection after a CONNECT failed
    #[error("Cannot upgrade client connection: {0}")]
    Upgrade(#[source] hyper::Error),
    /// Forwarding a plain HTTP request to its destination failed
    #[error("Network error while forwarding request: {0}")]
    Upstream(#[from] reqwest::Error),
    /// A rate limited transfer was aborted
    #[error(transparent)]
    Copy(#[from] CopyError),
    /// Any other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorKind {
    /// Whether the error happened before a destination connection was
    /// established, in which case the client should see a
    /// `503 Service Unavailable`
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. } | Self::DialTimeout(_) | Self::NoIpv6Address(_) | Self::Upstream(_)
        )
    }

    /// The status the proxy answers with when a request fails with this error
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingDestination(_) => StatusCode::BAD_REQUEST,
            _ if self.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_errors() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let dial = ErrorKind::Dial {
            destination: "example.com:443".to_string(),
            source: refused,
        };
        assert!(dial.is_unavailable());
        assert!(ErrorKind::DialTimeout("example.com:443".to_string()).is_unavailable());
        assert!(!ErrorKind::InvalidBurstSize.is_unavailable());
    }

    #[test]
    fn test_status() {
        let missing = ErrorKind::MissingDestination("/".to_string());
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        let timeout = ErrorKind::DialTimeout("example.com:443".to_string());
        assert_eq!(timeout.status(), StatusCode::SERVICE_UNAVAILABLE);
        let ipv6 = ErrorKind::NoIpv6Address("example.com:443".to_string());
        assert_eq!(ipv6.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ErrorKind::InvalidBurstSize.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_message_contains_destination() {
        let err = ErrorKind::NoIpv6Address("example.com:80".to_string());
        assert!(err.to_string().contains("example.com:80"));
    }
}
