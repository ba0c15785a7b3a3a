//! The immutable view of one configuration epoch.
//!
//! A reload builds a fresh `Snapshot` and swaps it in; connections keep the
//! `Arc` they captured when they were accepted, so nothing rebinds
//! mid-flight.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::http::modify::ModifyPolicy;
use crate::rules::{Rule, RuleTable};
use crate::servers::{Group, HealthRegistry, Server, ServerKind, ServerPool};
use crate::shadowsocks;
use crate::tls::HostMatcher;
use crate::utils::address::NetLocation;

use super::{Document, ServerEntry, ServerKindConfig};

#[derive(Debug)]
pub struct Snapshot {
    pub rules: RuleTable,
    pub pool: ServerPool,
    pub request_policies: Vec<ModifyPolicy>,
    pub response_policies: Vec<ModifyPolicy>,
    pub mitm_hosts: HostMatcher,
}

impl Snapshot {
    /// Validate a parsed document into a runnable snapshot. Health metrics
    /// are shared across epochs so a reload keeps probe history.
    pub fn build(doc: &Document, health: Arc<HealthRegistry>) -> Result<Snapshot> {
        let servers: Vec<Arc<Server>> = doc
            .servers
            .iter()
            .map(convert_server)
            .collect::<Result<_>>()?;

        let groups: Vec<Group> = doc
            .server_groups
            .iter()
            .map(|entry| {
                Ok(Group {
                    name: entry.name.clone(),
                    policy: entry.policy.parse()?,
                    members: entry.servers.clone(),
                })
            })
            .collect::<Result<_>>()?;

        let pool = ServerPool::new(servers, groups, health)?;

        let rules: Vec<Rule> = doc
            .rules
            .iter()
            .map(|line| Rule::parse_line(line))
            .collect::<Result<_>>()?;
        for rule in &rules {
            if !pool.knows(&rule.target) {
                return Err(Error::ConfigInvalid(format!(
                    "rule {rule} references unknown server {}",
                    rule.target
                )));
            }
        }

        let (request_policies, response_policies) = match &doc.http_map {
            None => (Vec::new(), Vec::new()),
            Some(map) => (
                map.req
                    .iter()
                    .map(ModifyPolicy::compile)
                    .collect::<Result<_>>()?,
                map.resp
                    .iter()
                    .map(ModifyPolicy::compile)
                    .collect::<Result<_>>()?,
            ),
        };

        let mitm_hosts = doc
            .mitm
            .as_ref()
            .map(|m| HostMatcher::new(&m.rules))
            .unwrap_or_default();

        Ok(Snapshot {
            rules: RuleTable::new(rules),
            pool,
            request_policies,
            response_policies,
            mitm_hosts,
        })
    }
}

fn convert_server(entry: &ServerEntry) -> Result<Arc<Server>> {
    let location = match (&entry.host, entry.port) {
        (Some(host), Some(port)) => Some(NetLocation::from_host_port(host, port)),
        _ => None,
    };
    let require_location = || {
        location.clone().ok_or_else(|| {
            Error::ConfigInvalid(format!("server {} needs host and port", entry.name))
        })
    };

    let kind = match entry.kind {
        ServerKindConfig::Direct => ServerKind::Direct,
        ServerKindConfig::Reject => ServerKind::Reject,
        ServerKindConfig::Http => {
            require_location()?;
            ServerKind::HttpProxy {
                username: entry.username.clone(),
                password: entry.password.clone(),
            }
        }
        ServerKindConfig::Socks5 => {
            require_location()?;
            ServerKind::Socks5
        }
        ServerKindConfig::Shadowsocks => {
            require_location()?;
            let method = entry.method.clone().ok_or_else(|| {
                Error::ConfigInvalid(format!("shadowsocks server {} needs a method", entry.name))
            })?;
            shadowsocks::check_method(&method)?;
            let password = entry.password.clone().ok_or_else(|| {
                Error::ConfigInvalid(format!("shadowsocks server {} needs a password", entry.name))
            })?;
            ServerKind::Shadowsocks { method, password }
        }
    };

    Ok(Arc::new(Server {
        name: entry.name.clone(),
        kind,
        location,
        udp_allowed: entry.udp_enabled,
    }))
}

/// The swappable reference the proxy reads its snapshot through.
pub struct SharedSnapshot {
    inner: RwLock<Arc<Snapshot>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: Snapshot) -> SharedSnapshot {
        SharedSnapshot {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    pub fn store(&self, snapshot: Snapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }
}

impl std::fmt::Debug for SharedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSnapshot").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Document;

    fn build(yaml: &str) -> Result<Snapshot> {
        let doc = Document::load_str(yaml)?;
        Snapshot::build(&doc, Arc::new(HealthRegistry::default()))
    }

    #[test]
    fn full_document_builds() {
        let snapshot = build(
            r#"
servers:
  - name: ss
    type: shadowsocks
    host: ss.test
    port: 8388
    method: chacha20-ietf-poly1305
    password: pw
rules:
  - DOMAIN-SUFFIX,internal.test,ss
  - FINAL,DIRECT
http_map:
  req:
    - action: UPDATE
      url_rex: '^http://old\.test'
      values:
        - type: URL
          value: 'http://new.test'
"#,
        )
        .unwrap();
        assert_eq!(snapshot.rules.rules().len(), 2);
        assert_eq!(snapshot.request_policies.len(), 1);
        assert!(snapshot.mitm_hosts.is_empty());
    }

    #[test]
    fn rule_referencing_unknown_server_fails() {
        let err = build("rules:\n  - FINAL,nosuch\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn shadowsocks_server_with_unknown_method_fails() {
        let err = build(
            r#"
servers:
  - name: ss
    type: shadowsocks
    host: h.test
    port: 1
    method: rot13
    password: pw
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedCipher(_)));
    }

    #[test]
    fn reload_swaps_epochs_without_disturbing_held_arcs() {
        let shared = SharedSnapshot::new(build("rules:\n  - FINAL,DIRECT\n").unwrap());
        let held = shared.load();
        assert_eq!(held.rules.rules().len(), 1);

        shared.store(build("rules:\n  - DOMAIN,a.test,REJECT\n  - FINAL,DIRECT\n").unwrap());

        // The old epoch is untouched for whoever captured it...
        assert_eq!(held.rules.rules().len(), 1);
        // ...and new captures see the new table.
        assert_eq!(shared.load().rules.rules().len(), 2);
    }
}
