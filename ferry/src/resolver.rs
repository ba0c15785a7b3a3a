//! Hostname resolution with TTL caching, request coalescing, and negative
//! caching.
//!
//! Lookup order per name: static hosts from the config, then the unexpired
//! cache, then the upstream resolver (configured UDP servers when present,
//! the system resolver otherwise). Concurrent lookups for one name are
//! coalesced behind a per-name lock so at most one upstream query is ever
//! outstanding for it; `clear()` bumps an epoch so lookups that were already
//! in flight cannot repopulate the cache they were purged from.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub const NEGATIVE_TTL: Duration = Duration::from_secs(60);

const STATIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsSource {
    Static,
    Configured,
    System,
}

#[derive(Debug, Clone)]
pub struct ResolvedName {
    pub addresses: Vec<IpAddr>,
    pub ttl: Duration,
    pub source: DnsSource,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> std::io::Result<ResolvedName>;
}

/// Resolver backed by hickory, either from the system configuration or from
/// an explicit UDP server list.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
    source: DnsSource,
}

impl HickoryResolver {
    pub fn from_system() -> std::io::Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Self {
            inner,
            source: DnsSource::System,
        })
    }

    pub fn from_servers(servers: &[SocketAddr]) -> Self {
        let mut config = ResolverConfig::new();
        for server in servers {
            config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
        }
        let inner = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self {
            inner,
            source: DnsSource::Configured,
        }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve(&self, name: &str) -> std::io::Result<ResolvedName> {
        let lookup = self
            .inner
            .lookup_ip(name)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e))?;
        let ttl = lookup
            .valid_until()
            .saturating_duration_since(Instant::now());
        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {name}"),
            ));
        }
        Ok(ResolvedName {
            addresses,
            ttl,
            source: self.source,
        })
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    source: DnsSource,
    expires_at: Instant,
    negative: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    epoch: u64,
}

/// A cache entry snapshot for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct DnsCacheView {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub expires_in_secs: u64,
    pub source: DnsSource,
}

pub struct CachingResolver {
    upstream: Arc<dyn Resolver>,
    hosts: HashMap<String, IpAddr>,
    ttl_override: Option<Duration>,
    state: Mutex<CacheState>,
    // Per-hostname async locks; holding one while querying upstream is what
    // guarantees at-most-one outstanding lookup per name.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CachingResolver {
    pub fn new(
        upstream: Arc<dyn Resolver>,
        hosts: HashMap<String, IpAddr>,
        ttl_override: Option<Duration>,
    ) -> Self {
        Self {
            upstream,
            hosts,
            ttl_override,
            state: Mutex::new(CacheState::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, name: &str) -> Option<CacheEntry> {
        let state = self.state.lock();
        let entry = state.entries.get(name)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.clone())
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn store(&self, name: &str, entry: CacheEntry, epoch: u64) {
        let mut state = self.state.lock();
        // A clear() that happened while we were querying wins.
        if state.epoch != epoch {
            return;
        }
        state.entries.insert(name.to_string(), entry);
    }

    pub async fn resolve(&self, name: &str) -> std::io::Result<ResolvedName> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ResolvedName {
                addresses: vec![ip],
                ttl: STATIC_TTL,
                source: DnsSource::Static,
            });
        }

        if let Some(ip) = self.hosts.get(name) {
            return Ok(ResolvedName {
                addresses: vec![*ip],
                ttl: STATIC_TTL,
                source: DnsSource::Static,
            });
        }

        if let Some(entry) = self.cached(name) {
            return entry_to_result(name, entry);
        }

        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        // Someone else may have resolved it while we waited on the lock.
        if let Some(entry) = self.cached(name) {
            return entry_to_result(name, entry);
        }

        let epoch = self.state.lock().epoch;
        match self.upstream.resolve(name).await {
            Ok(resolved) => {
                let ttl = self.ttl_override.unwrap_or(resolved.ttl).max(Duration::from_secs(1));
                debug!(name, ips = ?resolved.addresses, ttl_secs = ttl.as_secs(), "dns resolved");
                self.store(
                    name,
                    CacheEntry {
                        addresses: resolved.addresses.clone(),
                        source: resolved.source,
                        expires_at: Instant::now() + ttl,
                        negative: false,
                    },
                    epoch,
                );
                Ok(ResolvedName {
                    addresses: resolved.addresses,
                    ttl,
                    source: resolved.source,
                })
            }
            Err(e) => {
                debug!(name, error = %e, "dns resolution failed; caching negative result");
                self.store(
                    name,
                    CacheEntry {
                        addresses: Vec::new(),
                        source: DnsSource::System,
                        expires_at: Instant::now() + NEGATIVE_TTL,
                        negative: true,
                    },
                    epoch,
                );
                Err(e)
            }
        }
    }

    /// First address of a successful resolution.
    pub async fn resolve_one(&self, name: &str) -> std::io::Result<IpAddr> {
        let resolved = self.resolve(name).await?;
        resolved.addresses.into_iter().next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no addresses for {name}"))
        })
    }

    /// Snapshot of unexpired entries for the control plane.
    pub fn entries(&self) -> Vec<DnsCacheView> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at > now && !e.negative)
            .map(|(name, e)| DnsCacheView {
                name: name.clone(),
                addresses: e.addresses.clone(),
                expires_in_secs: e.expires_at.saturating_duration_since(now).as_secs(),
                source: e.source,
            })
            .collect()
    }

    /// Purge everything. In-flight lookups complete but cannot repopulate
    /// entries created before this call's epoch.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.entries.clear();
    }
}

fn entry_to_result(name: &str, entry: CacheEntry) -> std::io::Result<ResolvedName> {
    if entry.negative {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("negative cache entry for {name}"),
        ));
    }
    Ok(ResolvedName {
        addresses: entry.addresses,
        ttl: entry.expires_at.saturating_duration_since(Instant::now()),
        source: entry.source,
    })
}
