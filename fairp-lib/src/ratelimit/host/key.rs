use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// The fairness partition key of a remote peer.
///
/// Peers are grouped by IP address, so several connections from the same
/// machine share one slice of the bandwidth.
///
/// # Examples
///
/// ```
/// use fairp_lib::ratelimit::HostKey;
///
/// let key = HostKey::from_remote_addr("192.0.2.7:51234");
/// assert_eq!(key.as_str(), "192.0.2.7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(String);

impl HostKey {
    /// Derive the key from a peer address in `ip:port` form.
    ///
    /// Falls back to the raw string when it is not a socket address.
    #[must_use]
    pub fn from_remote_addr(remote_addr: &str) -> Self {
        match remote_addr.parse::<SocketAddr>() {
            Ok(addr) => Self::from(addr.ip()),
            Err(_) => Self(remote_addr.to_string()),
        }
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for HostKey {
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}

impl From<IpAddr> for HostKey {
    fn from(ip: IpAddr) -> Self {
        // IPv4 peers on a dual-stack listener show up as mapped addresses
        let ip = ip.to_canonical();
        Self(ip.to_string())
    }
}

impl From<&str> for HostKey {
    fn from(host: &str) -> Self {
        Self(host.to_string())
    }
}

impl From<String> for HostKey {
    fn from(host: String) -> Self {
        Self(host)
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.1:8080", "10.0.0.1")]
    #[case("[::1]:443", "::1")]
    #[case("[::ffff:192.0.2.1]:443", "192.0.2.1")]
    #[case("not-an-address", "not-an-address")]
    #[case("10.0.0.1", "10.0.0.1")]
    fn test_from_remote_addr(#[case] remote_addr: &str, #[case] expected: &str) {
        assert_eq!(HostKey::from_remote_addr(remote_addr).as_str(), expected);
    }

    #[test]
    fn test_ports_share_a_key() {
        let a = HostKey::from_remote_addr("10.0.0.1:1000");
        let b = HostKey::from_remote_addr("10.0.0.1:2000");
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_key_display() {
        let host_key = HostKey::from("example.com");
        assert_eq!(format!("{host_key}"), "example.com");
    }
}
