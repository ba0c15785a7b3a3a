use std::sync::Arc;

use crate::utils::address::NetLocation;

pub const DIRECT_NAME: &str = "DIRECT";
pub const REJECT_NAME: &str = "REJECT";

#[derive(Debug, Clone)]
pub enum ServerKind {
    /// Plain TCP to the destination.
    Direct,
    /// Drop the connection by policy.
    Reject,
    /// HTTP CONNECT upstream, optionally with Basic credentials.
    HttpProxy {
        username: Option<String>,
        password: Option<String>,
    },
    /// SOCKS5 upstream, no-auth.
    Socks5,
    /// Shadowsocks upstream.
    Shadowsocks { method: String, password: String },
}

impl ServerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ServerKind::Direct => "direct",
            ServerKind::Reject => "reject",
            ServerKind::HttpProxy { .. } => "http",
            ServerKind::Socks5 => "socks5",
            ServerKind::Shadowsocks { .. } => "shadowsocks",
        }
    }
}

/// A named upstream. Immutable once the configuration is loaded; mutable
/// health lives in the pool's registry, not here.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub kind: ServerKind,
    /// Where the upstream itself listens. None for direct/reject.
    pub location: Option<NetLocation>,
    pub udp_allowed: bool,
}

impl Server {
    pub fn direct() -> Arc<Server> {
        Arc::new(Server {
            name: DIRECT_NAME.to_string(),
            kind: ServerKind::Direct,
            location: None,
            udp_allowed: false,
        })
    }

    pub fn reject() -> Arc<Server> {
        Arc::new(Server {
            name: REJECT_NAME.to_string(),
            kind: ServerKind::Reject,
            location: None,
            udp_allowed: false,
        })
    }
}
