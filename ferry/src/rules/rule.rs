use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Domain,
    DomainSuffix,
    DomainKeyword,
    IpCidr,
    Geoip,
    Final,
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DOMAIN" => Ok(RuleKind::Domain),
            "DOMAIN-SUFFIX" => Ok(RuleKind::DomainSuffix),
            "DOMAIN-KEYWORD" => Ok(RuleKind::DomainKeyword),
            "IP-CIDR" => Ok(RuleKind::IpCidr),
            "GEOIP" => Ok(RuleKind::Geoip),
            "FINAL" => Ok(RuleKind::Final),
            other => Err(Error::ConfigInvalid(format!("unknown rule kind: {other}"))),
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::Domain => "DOMAIN",
            RuleKind::DomainSuffix => "DOMAIN-SUFFIX",
            RuleKind::DomainKeyword => "DOMAIN-KEYWORD",
            RuleKind::IpCidr => "IP-CIDR",
            RuleKind::Geoip => "GEOIP",
            RuleKind::Final => "FINAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub pattern: String,
    pub target: String,
    cidr: Option<IpNet>,
}

impl Rule {
    pub fn new(kind: RuleKind, pattern: String, target: String) -> Result<Rule> {
        let cidr = match kind {
            RuleKind::IpCidr => Some(pattern.parse::<IpNet>().map_err(|e| {
                Error::ConfigInvalid(format!("invalid CIDR pattern {pattern}: {e}"))
            })?),
            _ => None,
        };
        if target.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "rule {kind},{pattern} has no target server"
            )));
        }
        Ok(Rule {
            kind,
            pattern,
            target,
            cidr,
        })
    }

    /// Parses the config form `KIND,pattern,target` (`FINAL,target` for the
    /// terminal rule).
    pub fn parse_line(line: &str) -> Result<Rule> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [kind, target] if kind.eq_ignore_ascii_case("FINAL") => {
                Rule::new(RuleKind::Final, String::new(), target.to_string())
            }
            [kind, pattern, target] => Rule::new(
                kind.parse()?,
                pattern.to_string(),
                target.to_string(),
            ),
            _ => Err(Error::ConfigInvalid(format!("malformed rule line: {line}"))),
        }
    }

    pub fn matches_host(&self, host: &str) -> bool {
        match self.kind {
            RuleKind::Domain => host.eq_ignore_ascii_case(&self.pattern),
            RuleKind::DomainSuffix => {
                host.eq_ignore_ascii_case(&self.pattern)
                    || (host.len() > self.pattern.len()
                        && host[..host.len() - self.pattern.len()].ends_with('.')
                        && host[host.len() - self.pattern.len()..]
                            .eq_ignore_ascii_case(&self.pattern))
            }
            RuleKind::DomainKeyword => host.to_ascii_lowercase().contains(&self.pattern.to_ascii_lowercase()),
            _ => false,
        }
    }

    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.cidr.map(|net| net.contains(&ip)).unwrap_or(false)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Final => write!(f, "FINAL,{}", self.target),
            kind => write!(f, "{kind},{},{}", self.pattern, self.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_three_part_line() {
        let rule = Rule::parse_line("DOMAIN-SUFFIX, google.com, PROXY").unwrap();
        assert_eq!(rule.kind, RuleKind::DomainSuffix);
        assert_eq!(rule.pattern, "google.com");
        assert_eq!(rule.target, "PROXY");
    }

    #[test]
    fn parse_final_line() {
        let rule = Rule::parse_line("FINAL,DIRECT").unwrap();
        assert_eq!(rule.kind, RuleKind::Final);
        assert_eq!(rule.target, "DIRECT");
    }

    #[test]
    fn bad_cidr_is_config_error() {
        assert!(Rule::parse_line("IP-CIDR,999.0.0.0/8,DIRECT").is_err());
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(Rule::parse_line("DOMAIN").is_err());
    }
}
