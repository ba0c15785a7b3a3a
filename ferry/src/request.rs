//! The per-connection request descriptor produced by the front-ends.

use std::net::IpAddr;

use crate::utils::address::NetLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Socks5,
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Socks5 => write!(f, "SOCKS5"),
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Https => write!(f, "HTTPS"),
        }
    }
}

/// A classified unit of work: one SOCKS CONNECT or one logical HTTP request.
///
/// Front-ends freeze everything except the lazily-filled `ip` and `country`
/// fields, which the rule engine populates on demand while classifying.
#[derive(Debug, Clone)]
pub struct Request {
    pub protocol: Protocol,
    pub location: NetLocation,
    /// Resolved address, filled once the rule engine or dialer needed it.
    pub ip: Option<IpAddr>,
    /// Canonical URL for HTTP(S); host:port for SOCKS.
    pub target: String,
    /// ISO country code, empty until a GEOIP rule forced a lookup.
    pub country: String,
}

impl Request {
    pub fn new(protocol: Protocol, location: NetLocation, target: String) -> Self {
        let ip = location.address.ip();
        Self {
            protocol,
            location,
            ip,
            target,
            country: String::new(),
        }
    }

    pub fn host(&self) -> String {
        self.location.address.to_string()
    }
}
