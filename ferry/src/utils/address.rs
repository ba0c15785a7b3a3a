//! Target address types shared by the protocol front-ends and dialers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A destination host: either a literal IP or an unresolved hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from_str_smart(s: &str) -> Address {
        if let Ok(v4) = Ipv4Addr::from_str(s) {
            return Address::Ipv4(v4);
        }
        // Allow bracketed IPv6 literals as they appear in URLs.
        let trimmed = s.trim_start_matches('[').trim_end_matches(']');
        if let Ok(v6) = Ipv6Addr::from_str(trimmed) {
            return Address::Ipv6(v6);
        }
        Address::Hostname(s.to_string())
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(v4) => Some(IpAddr::V4(*v4)),
            Address::Ipv6(v6) => Some(IpAddr::V6(*v6)),
            Address::Hostname(_) => None,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(v4) => write!(f, "{v4}"),
            Address::Ipv6(v6) => write!(f, "{v6}"),
            Address::Hostname(name) => write!(f, "{name}"),
        }
    }
}

/// An address plus port, the unit the dialers and rules operate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetLocation {
    pub address: Address,
    pub port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self {
            address: Address::from_str_smart(host),
            port,
        }
    }

    /// Parses "host:port" / "[v6]:port". A missing port is an error.
    pub fn parse(s: &str) -> std::io::Result<NetLocation> {
        if let Ok(sa) = SocketAddr::from_str(s) {
            return Ok(NetLocation::new(sa.ip().into(), sa.port()));
        }
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("missing port in address: {s}"),
            )
        })?;
        let port: u16 = port.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid port in address: {s}"),
            )
        })?;
        Ok(NetLocation::from_host_port(host, port))
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for NetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ipv6(v6) => write!(f, "[{v6}]:{}", self.port),
            other => write!(f, "{other}:{}", self.port),
        }
    }
}

impl Serialize for NetLocation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetLocation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NetLocation::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_location() {
        let loc = NetLocation::parse("10.0.0.1:8080").unwrap();
        assert_eq!(loc.address, Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(loc.port, 8080);
    }

    #[test]
    fn parse_hostname_location() {
        let loc = NetLocation::parse("example.com:443").unwrap();
        assert_eq!(loc.address, Address::Hostname("example.com".to_string()));
        assert!(loc.to_socket_addr().is_none());
    }

    #[test]
    fn parse_ipv6_location() {
        let loc = NetLocation::parse("[::1]:53").unwrap();
        assert_eq!(loc.address, Address::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(loc.to_string(), "[::1]:53");
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(NetLocation::parse("example.com").is_err());
    }
}
