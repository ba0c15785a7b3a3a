//! Shared fixtures for front-end tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Document, SharedSnapshot, Snapshot};
use crate::proxy::ProxyContext;
use crate::records::RecordSink;
use crate::resolver::{CachingResolver, ResolvedName, Resolver};
use crate::servers::HealthRegistry;

/// A resolver with no upstream: only static host entries resolve.
pub struct NullResolver;

#[async_trait]
impl Resolver for NullResolver {
    async fn resolve(&self, name: &str) -> std::io::Result<ResolvedName> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no resolver in tests: {name}"),
        ))
    }
}

/// A full proxy context over an in-memory snapshot, with name resolution
/// limited to the provided hosts map.
pub fn test_context(yaml: &str, hosts: HashMap<String, IpAddr>) -> Arc<ProxyContext> {
    let document = Document::load_str(yaml).expect("test configuration parses");
    let snapshot = Snapshot::build(&document, Arc::new(HealthRegistry::default()))
        .expect("test snapshot builds");

    Arc::new(ProxyContext {
        snapshot: SharedSnapshot::new(snapshot),
        resolver: Arc::new(CachingResolver::new(Arc::new(NullResolver), hosts, None)),
        geoip: None,
        records: RecordSink::start(),
        issuer: None,
        resp_files_dir: std::env::temp_dir(),
        dump: None,
        idle_timeout: Duration::from_secs(60),
    })
}
