//! Address type for network connections

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Network address of a listener or an upstream node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Parse a `host:port` string as used in routing tables and configuration
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address should be host:port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in address: {}", s)))?;

        if host.is_empty() {
            return Err(Error::Config(format!("missing host in address: {}", s)));
        }
        if let Ok(ip) = host.parse() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket() {
        let addr = Address::parse("127.0.0.1:18001").unwrap();
        assert_eq!(addr, Address::Socket("127.0.0.1:18001".parse().unwrap()));
    }

    #[test]
    fn test_parse_domain() {
        let addr = Address::parse("webdc.eu:18001").unwrap();
        assert_eq!(addr.host(), "webdc.eu");
        assert_eq!(addr.port(), 18001);
        assert_eq!(addr.to_string(), "webdc.eu:18001");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Address::parse("webdc.eu").is_err());
        assert!(Address::parse("webdc.eu:port").is_err());
        assert!(Address::parse(":18001").is_err());
    }
}
