//! Configuration document types and loading.
//!
//! One YAML document (`shuttle.yaml`) declares listeners, upstream servers,
//! selection groups, dispatch rules, HTTP rewrite policies, MITM settings,
//! and DNS behavior. Parsing is strict: unknown fields are rejected so
//! typos fail at startup instead of silently doing nothing.

mod snapshot;

pub use snapshot::{SharedSnapshot, Snapshot};

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_interface() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8081
}

fn default_socks_port() -> u16 {
    8080
}

fn default_controller_port() -> u16 {
    8082
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_geoip_file() -> String {
    "GeoLite2-Country.mmdb".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemProxyMode {
    #[default]
    Auto,
    Manual,
    Off,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_interface")]
    pub http_interface: String,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_interface")]
    pub socks_interface: String,
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,
    #[serde(default = "default_interface")]
    pub controller_interface: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub set_as_system_proxy: SystemProxyMode,
    #[serde(default)]
    pub allow_dump: bool,
    #[serde(default = "default_geoip_file")]
    pub geoip_file: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            http_interface: default_interface(),
            socks_port: default_socks_port(),
            socks_interface: default_interface(),
            controller_port: default_controller_port(),
            controller_interface: default_interface(),
            log_level: default_log_level(),
            set_as_system_proxy: SystemProxyMode::default(),
            allow_dump: false,
            geoip_file: default_geoip_file(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKindConfig {
    Direct,
    Reject,
    Http,
    Socks5,
    Shadowsocks,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: ServerKindConfig,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_true", alias = "udp")]
    pub udp_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GroupEntry {
    pub name: String,
    pub policy: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ModifyAction {
    #[serde(rename = "MOCK")]
    Mock,
    #[serde(rename = "UPDATE")]
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ModifyFieldKind {
    #[serde(rename = "URL")]
    Url,
    #[serde(rename = "HEADER")]
    Header,
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "BODY")]
    Body,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModifyValueEntry {
    #[serde(rename = "type")]
    pub kind: ModifyFieldKind,
    #[serde(default)]
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModifyEntry {
    pub action: ModifyAction,
    pub url_rex: String,
    #[serde(default)]
    pub values: Vec<ModifyValueEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HttpMapConfig {
    #[serde(default)]
    pub req: Vec<ModifyEntry>,
    #[serde(default)]
    pub resp: Vec<ModifyEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MitmConfig {
    pub ca_cert_file: String,
    pub ca_key_file: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    /// Positive-cache TTL override in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub hosts: HashMap<String, IpAddr>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub server_groups: Vec<GroupEntry>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub http_map: Option<HttpMapConfig>,
    #[serde(default)]
    pub mitm: Option<MitmConfig>,
    #[serde(default)]
    pub dns: Option<DnsConfig>,
}

impl Document {
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Document> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ConfigInvalid(format!(
                "cannot read configuration {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Document::load_str(&text)
    }

    pub fn load_str(text: &str) -> Result<Document> {
        serde_yml::from_str(text).map_err(|e| Error::ConfigInvalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
general:
  socks_port: 1080
  http_port: 1087
  log_level: debug
  allow_dump: true
servers:
  - name: tunnel
    type: shadowsocks
    host: ss.example.net
    port: 8388
    method: aes-128-gcm
    password: hunter2
  - name: corp
    type: http
    host: proxy.corp.test
    port: 3128
    username: worker
    password: badge
server_groups:
  - name: auto
    policy: lowest-latency
    servers: [tunnel, corp]
rules:
  - DOMAIN-SUFFIX,corp.test,corp
  - GEOIP,CN,tunnel
  - FINAL,DIRECT
http_map:
  req:
    - action: MOCK
      url_rex: '^https?://api\.test/v1/ping$'
      values:
        - type: STATUS
          value: "418"
        - type: HEADER
          key: X-Mock
          value: "1"
        - type: BODY
          value: ping.txt
dns:
  servers: ["223.5.5.5:53"]
  ttl: 600
  hosts:
    router.lan: 10.0.0.1
mitm:
  ca_cert_file: ca.crt
  ca_key_file: ca.key
  rules: ["*.api.test"]
"#;

    #[test]
    fn sample_document_parses() {
        let doc = Document::load_str(SAMPLE).unwrap();
        assert_eq!(doc.general.socks_port, 1080);
        assert_eq!(doc.general.log_level, "debug");
        assert!(doc.general.allow_dump);
        assert_eq!(doc.servers.len(), 2);
        assert_eq!(doc.servers[0].kind, ServerKindConfig::Shadowsocks);
        assert_eq!(doc.servers[1].username.as_deref(), Some("worker"));
        assert_eq!(doc.server_groups[0].policy, "lowest-latency");
        assert_eq!(doc.rules.len(), 3);
        let map = doc.http_map.unwrap();
        assert_eq!(map.req[0].values.len(), 3);
        let dns = doc.dns.unwrap();
        assert_eq!(dns.ttl, Some(600));
        assert_eq!(dns.hosts.len(), 1);
        assert!(doc.mitm.is_some());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Document::load_str("general:\n  socks_prot: 1080\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let doc = Document::load_str("{}").unwrap();
        assert_eq!(doc.general.socks_port, 8080);
        assert_eq!(doc.general.http_port, 8081);
        assert_eq!(doc.general.idle_timeout_secs, 60);
        assert!(doc.rules.is_empty());
    }
}
