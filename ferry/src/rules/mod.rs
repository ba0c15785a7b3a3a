//! Rule-based dispatch: map a request to the name of the upstream that
//! should carry it.

mod rule;

pub use rule::{Rule, RuleKind};

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geoip::GeoIp;
use crate::request::Request;
use crate::resolver::CachingResolver;

#[derive(Debug, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First-match classification in declaration order.
    ///
    /// DNS happens at most once, and only when an IP-CIDR or GEOIP rule is
    /// actually reached with an unresolved hostname. A failed resolution
    /// skips IP-classified rules rather than failing the request; the
    /// connection will surface the DNS failure itself if the chosen route
    /// needs the address.
    pub async fn classify<'a>(
        &'a self,
        request: &mut Request,
        resolver: &CachingResolver,
        geoip: Option<&Arc<GeoIp>>,
    ) -> Result<&'a Rule> {
        let host = request.host();
        let mut dns_failed = false;

        for rule in &self.rules {
            let matched = match rule.kind {
                RuleKind::Final => true,
                RuleKind::Domain | RuleKind::DomainSuffix | RuleKind::DomainKeyword => {
                    request.location.address.is_hostname() && rule.matches_host(&host)
                }
                RuleKind::IpCidr | RuleKind::Geoip => {
                    if request.ip.is_none() && !dns_failed {
                        match resolver.resolve_one(&host).await {
                            Ok(ip) => request.ip = Some(ip),
                            Err(e) => {
                                debug!(host = %host, error = %e, "resolution failed during rule match");
                                dns_failed = true;
                            }
                        }
                    }
                    match request.ip {
                        None => false,
                        Some(ip) => match rule.kind {
                            RuleKind::IpCidr => rule.contains_ip(ip),
                            RuleKind::Geoip => self.matches_country(rule, ip, request, geoip),
                            _ => unreachable!(),
                        },
                    }
                }
            };

            if matched {
                debug!(rule = %rule, target = %request.target, "rule matched");
                return Ok(rule);
            }
        }

        Err(Error::NoRule(request.target.clone()))
    }

    fn matches_country(
        &self,
        rule: &Rule,
        ip: IpAddr,
        request: &mut Request,
        geoip: Option<&Arc<GeoIp>>,
    ) -> bool {
        if request.country.is_empty() {
            let Some(db) = geoip else {
                warn!("GEOIP rule present but no GeoIP database is loaded");
                return false;
            };
            request.country = db.country(ip).unwrap_or_default();
        }
        !request.country.is_empty() && request.country.eq_ignore_ascii_case(&rule.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Protocol;
    use crate::resolver::{CachingResolver, DnsSource, ResolvedName, Resolver};
    use crate::utils::address::NetLocation;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct FixedResolver(IpAddr);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, _name: &str) -> std::io::Result<ResolvedName> {
            Ok(ResolvedName {
                addresses: vec![self.0],
                ttl: Duration::from_secs(60),
                source: DnsSource::Configured,
            })
        }
    }

    fn resolver() -> CachingResolver {
        CachingResolver::new(
            Arc::new(FixedResolver(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))),
            HashMap::new(),
            None,
        )
    }

    fn request(host: &str, port: u16) -> Request {
        Request::new(
            Protocol::Socks5,
            NetLocation::from_host_port(host, port),
            format!("{host}:{port}"),
        )
    }

    fn rule(kind: RuleKind, pattern: &str, target: &str) -> Rule {
        Rule::new(kind, pattern.to_string(), target.to_string()).unwrap()
    }

    #[tokio::test]
    async fn declaration_order_wins_over_specificity() {
        let table = RuleTable::new(vec![
            rule(RuleKind::DomainSuffix, "example.com", "A"),
            rule(RuleKind::Domain, "api.example.com", "B"),
        ]);

        let mut req = request("api.example.com", 443);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "A");
    }

    #[tokio::test]
    async fn domain_suffix_requires_label_boundary() {
        let table = RuleTable::new(vec![
            rule(RuleKind::DomainSuffix, "example.com", "A"),
            rule(RuleKind::Final, "", "FALLBACK"),
        ]);

        let mut req = request("notexample.com", 80);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "FALLBACK");

        let mut req = request("sub.example.com", 80);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "A");

        let mut req = request("example.com", 80);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "A");
    }

    #[tokio::test]
    async fn keyword_matches_substring() {
        let table = RuleTable::new(vec![rule(RuleKind::DomainKeyword, "tracker", "BLOCKHOLE")]);
        let mut req = request("cdn.tracker-stats.net", 443);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "BLOCKHOLE");
    }

    #[tokio::test]
    async fn cidr_rule_resolves_hostnames_on_demand() {
        let table = RuleTable::new(vec![
            rule(RuleKind::IpCidr, "192.0.2.0/24", "LAN"),
            rule(RuleKind::Final, "", "OTHER"),
        ]);

        let mut req = request("printer.test", 9100);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "LAN");
        assert_eq!(req.ip, Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
    }

    #[tokio::test]
    async fn literal_ip_skips_dns() {
        let table = RuleTable::new(vec![rule(RuleKind::IpCidr, "10.0.0.0/8", "LAN")]);
        let mut req = request("10.1.2.3", 22);
        let matched = table.classify(&mut req, &resolver(), None).await.unwrap();
        assert_eq!(matched.target, "LAN");
    }

    #[tokio::test]
    async fn no_rule_without_final_is_an_error() {
        let table = RuleTable::new(vec![rule(RuleKind::Domain, "only.this", "A")]);
        let mut req = request("something.else", 80);
        let err = table.classify(&mut req, &resolver(), None).await.unwrap_err();
        assert!(matches!(err, Error::NoRule(_)));
    }
}
