//! Leaf certificate synthesis from the configured CA.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::error::{Error, Result};

const CACHE_CAPACITY: usize = 1024;

/// Cached leaves are reissued after a day even though the certificates
/// themselves are valid for a year.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const LEAF_VALIDITY_DAYS: i64 = 365;

struct CachedLeaf {
    config: Arc<ServerConfig>,
    issued_at: Instant,
}

/// Issues and caches per-host leaf certificates signed by the local CA.
pub struct CertIssuer {
    issuer: Issuer<'static, KeyPair>,
    cache: Mutex<LruCache<String, CachedLeaf>>,
}

impl CertIssuer {
    /// Load the CA certificate and key from PEM text. Fatal at startup when
    /// MITM is configured but the material is unusable.
    pub fn from_ca_pem(cert_pem: &str, key_pem: &str) -> Result<CertIssuer> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::ConfigInvalid(format!("bad MITM CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| Error::ConfigInvalid(format!("bad MITM CA certificate: {e}")))?;
        Ok(CertIssuer {
            issuer,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is nonzero"),
            )),
        })
    }

    /// Server config carrying a leaf for `host`, from cache when fresh.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        {
            let mut cache = self.cache.lock();
            if let Some(leaf) = cache.get(&host) {
                if leaf.issued_at.elapsed() < CACHE_TTL {
                    return Ok(leaf.config.clone());
                }
            }
        }

        let config = Arc::new(self.issue(&host)?);
        self.cache.lock().put(
            host,
            CachedLeaf {
                config: config.clone(),
                issued_at: Instant::now(),
            },
        );
        Ok(config)
    }

    fn issue(&self, host: &str) -> Result<ServerConfig> {
        debug!(host, "issuing mitm leaf certificate");

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::ConfigInvalid(format!("leaf key generation failed: {e}")))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| Error::ProtocolViolation(format!("invalid certificate host {host}: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| Error::ProtocolViolation(format!("leaf signing failed: {e}")))?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .map_err(|e| Error::ProtocolViolation(format!("leaf server config failed: {e}")))?;
        Ok(config)
    }

    /// Cache entries currently held, for diagnostics.
    pub fn cached_leaves(&self) -> usize {
        self.cache.lock().len()
    }
}

impl std::fmt::Debug for CertIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertIssuer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, IsCa};

    fn test_ca() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "ferry test ca");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn issues_and_caches_per_host() {
        let (cert_pem, key_pem) = test_ca();
        let issuer = CertIssuer::from_ca_pem(&cert_pem, &key_pem).unwrap();

        let first = issuer.server_config("site.test").unwrap();
        let second = issuer.server_config("site.test").unwrap();
        // Same Arc: the second request was a cache hit.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(issuer.cached_leaves(), 1);

        let other = issuer.server_config("other.test").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(issuer.cached_leaves(), 2);
    }

    #[test]
    fn garbage_ca_material_is_rejected() {
        assert!(CertIssuer::from_ca_pem("not a cert", "not a key").is_err());
    }
}
