//! Server pool, selection groups, and health tracking.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resolver::CachingResolver;
use crate::utils::address::NetLocation;

use super::server::{DIRECT_NAME, REJECT_NAME, Server};

pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_secs(10);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// EWMA weight for the newest latency sample.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    FirstAvailable,
    RoundRobin,
    LowestLatency,
    Random,
}

impl FromStr for SelectPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "first-available" | "first" => Ok(SelectPolicy::FirstAvailable),
            "round-robin" | "rr" => Ok(SelectPolicy::RoundRobin),
            "lowest-latency" | "latency" => Ok(SelectPolicy::LowestLatency),
            "random" => Ok(SelectPolicy::Random),
            other => Err(Error::ConfigInvalid(format!(
                "unknown selection policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub policy: SelectPolicy,
    pub members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self {
            latency_ms: None,
            consecutive_failures: 0,
            backoff: Duration::ZERO,
            retry_at: None,
        }
    }
}

impl ServerHealth {
    fn available(&self) -> bool {
        match self.retry_at {
            None => true,
            Some(at) => at <= Instant::now(),
        }
    }
}

/// Mutable health metrics, kept outside the immutable snapshot so they
/// survive configuration reloads.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    state: Mutex<HashMap<String, ServerHealth>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl HealthRegistry {
    pub fn report_success(&self, name: &str, latency: Duration) {
        let mut state = self.state.lock();
        let health = state.entry(name.to_string()).or_default();
        let sample = latency.as_secs_f64() * 1000.0;
        health.latency_ms = Some(match health.latency_ms {
            None => sample,
            Some(prev) => prev * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA,
        });
        health.consecutive_failures = 0;
        health.backoff = Duration::ZERO;
        health.retry_at = None;
    }

    pub fn report_failure(&self, name: &str) {
        let mut state = self.state.lock();
        let health = state.entry(name.to_string()).or_default();
        health.consecutive_failures += 1;
        health.backoff = if health.backoff.is_zero() {
            BACKOFF_INITIAL
        } else {
            (health.backoff * 2).min(BACKOFF_CAP)
        };
        health.retry_at = Some(Instant::now() + health.backoff);
    }

    pub fn available(&self, name: &str) -> bool {
        self.state
            .lock()
            .get(name)
            .map(ServerHealth::available)
            .unwrap_or(true)
    }

    pub fn latency_ms(&self, name: &str) -> Option<f64> {
        self.state.lock().get(name).and_then(|h| h.latency_ms)
    }

    pub fn snapshot(&self) -> HashMap<String, ServerHealth> {
        self.state.lock().clone()
    }

    fn next_cursor(&self, group: &str, len: usize) -> usize {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(group.to_string()).or_insert(0);
        let position = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        position
    }
}

#[derive(Debug)]
pub struct ServerPool {
    servers: HashMap<String, Arc<Server>>,
    groups: HashMap<String, Group>,
    health: Arc<HealthRegistry>,
}

impl ServerPool {
    pub fn new(
        servers: Vec<Arc<Server>>,
        groups: Vec<Group>,
        health: Arc<HealthRegistry>,
    ) -> Result<Self> {
        let servers: HashMap<String, Arc<Server>> = servers
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let mut group_map = HashMap::new();
        for group in groups {
            if group.members.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "server group {} has no members",
                    group.name
                )));
            }
            for member in &group.members {
                if !servers.contains_key(member) && !is_reserved(member) {
                    return Err(Error::ConfigInvalid(format!(
                        "server group {} references unknown server {member}",
                        group.name
                    )));
                }
            }
            group_map.insert(group.name.clone(), group);
        }
        Ok(Self {
            servers,
            groups: group_map,
            health,
        })
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Whether a rule target name resolves to something in this pool.
    pub fn knows(&self, name: &str) -> bool {
        is_reserved(name) || self.servers.contains_key(name) || self.groups.contains_key(name)
    }

    /// Resolve a name to a concrete server: reserved names produce synthetic
    /// DIRECT/REJECT entries, group names go through the group's policy.
    pub fn get(&self, name: &str) -> Result<Arc<Server>> {
        if name.eq_ignore_ascii_case(DIRECT_NAME) {
            return Ok(Server::direct());
        }
        if name.eq_ignore_ascii_case(REJECT_NAME) {
            return Ok(Server::reject());
        }
        if let Some(server) = self.servers.get(name) {
            return Ok(server.clone());
        }
        if let Some(group) = self.groups.get(name) {
            return self.select(group);
        }
        Err(Error::ConfigInvalid(format!("unknown server: {name}")))
    }

    fn select(&self, group: &Group) -> Result<Arc<Server>> {
        let members = &group.members;
        let chosen = match group.policy {
            SelectPolicy::FirstAvailable => members
                .iter()
                .find(|name| self.health.available(name))
                .unwrap_or(&members[0]),
            SelectPolicy::RoundRobin => {
                let start = self.health.next_cursor(&group.name, members.len());
                let mut pick = &members[start];
                for i in 0..members.len() {
                    let candidate = &members[(start + i) % members.len()];
                    if self.health.available(candidate) {
                        pick = candidate;
                        break;
                    }
                }
                pick
            }
            SelectPolicy::LowestLatency => members
                .iter()
                .filter(|name| self.health.available(name))
                .min_by(|a, b| {
                    let la = self.health.latency_ms(a).unwrap_or(f64::MAX);
                    let lb = self.health.latency_ms(b).unwrap_or(f64::MAX);
                    la.total_cmp(&lb)
                })
                .unwrap_or(&members[0]),
            SelectPolicy::Random => {
                let available: Vec<&String> = members
                    .iter()
                    .filter(|name| self.health.available(name))
                    .collect();
                if available.is_empty() {
                    &members[rand::rng().random_range(0..members.len())]
                } else {
                    available[rand::rng().random_range(0..available.len())]
                }
            }
        };
        debug!(group = %group.name, server = %chosen, "group selection");
        self.get(chosen)
    }

    /// One pass of the health probe over every probeable server.
    pub async fn probe_once(&self, resolver: &CachingResolver) {
        for server in self.servers.values() {
            let Some(location) = &server.location else {
                continue;
            };
            match probe_connect(location, resolver).await {
                Ok(latency) => {
                    self.health.report_success(&server.name, latency);
                }
                Err(e) => {
                    warn!(server = %server.name, error = %e, "health probe failed");
                    self.health.report_failure(&server.name);
                }
            }
        }
    }
}

fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case(DIRECT_NAME) || name.eq_ignore_ascii_case(REJECT_NAME)
}

async fn probe_connect(
    location: &NetLocation,
    resolver: &CachingResolver,
) -> std::io::Result<Duration> {
    let addr = match location.to_socket_addr() {
        Some(addr) => addr,
        None => {
            let ip = resolver.resolve_one(&location.address.to_string()).await?;
            std::net::SocketAddr::new(ip, location.port)
        }
    };
    let start = Instant::now();
    let connect = tokio::net::TcpStream::connect(addr);
    match tokio::time::timeout(PROBE_TIMEOUT, connect).await {
        Ok(Ok(_stream)) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "probe timed out",
        )),
    }
}
