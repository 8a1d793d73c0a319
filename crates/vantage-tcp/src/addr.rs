//! Listen addresses.
//!
//! An [`Address`] is a `(host, port)` pair, resolved lazily at bind time.
//! Port `0` asks the kernel for an ephemeral port; the effective port is
//! discoverable through `Listener::get_port` once bound.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Address family of a resolved candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

/// A host/port pair a listener binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Creates an address from a host (name or IP literal) and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback address on the given port.
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The family, when the host is an IP literal. Hostnames resolve to
    /// candidates of either family.
    #[must_use]
    pub fn family(&self) -> Option<Family> {
        match IpAddr::from_str(&self.host) {
            Ok(IpAddr::V4(_)) => Some(Family::Ipv4),
            Ok(IpAddr::V6(_)) => Some(Family::Ipv6),
            Err(_) => None,
        }
    }

    /// Resolves to candidate socket addresses, in resolver order.
    pub(crate) fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let candidates = (self.host.as_str(), self.port).to_socket_addrs()?;
        Ok(candidates.collect())
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::localhost(0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Address {
    type Err = io::Error;

    /// Parses `host:port`. IPv6 literals use the usual bracket form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_of_literals() {
        assert_eq!(Address::localhost(0).family(), Some(Family::Ipv4));
        assert_eq!(Address::new("::1", 80).family(), Some(Family::Ipv6));
        assert_eq!(Address::new("localhost", 80).family(), None);
    }

    #[test]
    fn parses_host_and_port() {
        let addr: Address = "127.0.0.1:8080".parse().expect("parse");
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 8080);

        let addr: Address = "example.com:443".parse().expect("parse");
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.port(), 443);
    }

    #[test]
    fn rejects_missing_or_bad_port() {
        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:http".parse::<Address>().is_err());
    }

    #[test]
    fn resolves_loopback() {
        let candidates = Address::localhost(0).resolve().expect("resolve");
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.ip().is_loopback()));
    }

    #[test]
    fn display_round_trip() {
        let addr = Address::new("0.0.0.0", 9000);
        assert_eq!(addr.to_string(), "0.0.0.0:9000");
        assert_eq!(addr.to_string().parse::<Address>().expect("parse"), addr);
    }
}
