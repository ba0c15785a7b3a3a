//! TLS interception: on-the-fly leaf issuance from a local CA, the host
//! match list that decides which CONNECT targets get intercepted, and the
//! client-side connector used to reach the real origin.

mod issuer;

pub use issuer::CertIssuer;

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::network::async_stream::AsyncStream;

/// MITM host patterns: exact names plus `*.suffix` wildcards.
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    exact: Vec<String>,
    suffixes: Vec<String>,
}

impl HostMatcher {
    pub fn new(patterns: &[String]) -> HostMatcher {
        let mut matcher = HostMatcher::default();
        for pattern in patterns {
            let pattern = pattern.trim().to_ascii_lowercase();
            if pattern.is_empty() {
                continue;
            }
            if let Some(suffix) = pattern.strip_prefix("*.") {
                matcher.suffixes.push(suffix.to_string());
            } else if pattern == "*" {
                // Match-everything wildcard.
                matcher.suffixes.push(String::new());
            } else {
                matcher.exact.push(pattern);
            }
        }
        matcher
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if self.exact.iter().any(|h| *h == host) {
            return true;
        }
        self.suffixes.iter().any(|suffix| {
            suffix.is_empty()
                || host == *suffix
                || host.ends_with(&format!(".{suffix}"))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty()
    }
}

fn origin_client_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: std::sync::OnceLock<Arc<rustls::ClientConfig>> = std::sync::OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// TLS to the real origin over an already-dialed upstream connection.
pub async fn connect_origin(
    host: &str,
    stream: Box<dyn AsyncStream>,
) -> Result<tokio_rustls::client::TlsStream<Box<dyn AsyncStream>>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::ProtocolViolation(format!("invalid tls server name: {host}")))?;

    let connector = TlsConnector::from(origin_client_config());
    let tls = connector.connect(server_name, stream).await?;
    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_patterns() {
        let matcher = HostMatcher::new(&[
            "api.test".to_string(),
            "*.internal.test".to_string(),
        ]);
        assert!(matcher.matches("api.test"));
        assert!(matcher.matches("API.Test"));
        assert!(!matcher.matches("www.api.test"));
        assert!(matcher.matches("a.internal.test"));
        assert!(matcher.matches("deep.a.internal.test"));
        assert!(!matcher.matches("internal-test.example"));
    }

    #[test]
    fn bare_star_matches_everything() {
        let matcher = HostMatcher::new(&["*".to_string()]);
        assert!(matcher.matches("anything.example"));
    }
}
