//! Bypass policy
//!
//! Decides whether a destination is blocked before any outbound dial.
//! The default [`BypassSet`] compiles a list of textual rules once:
//!
//! * `example.com` matches that host on any port
//! * `example.com:443` matches that host on one port
//! * `*.example.com` and `.example.com` match the domain and its subdomains
//! * `10.0.0.0/8`, `fd00::/8` match addresses inside the network
//!
//! In whitelist mode the result is inverted: everything not matched is
//! bypassed. An empty rule set never bypasses anything.

use std::net::IpAddr;

use ipnet::IpNet;
use log::debug;

use crate::common::split_host_port;

/// Destination filter consulted by the dispatcher after address decoding
#[cfg_attr(test, mockall::automock)]
pub trait Bypass: Send + Sync {
    /// Whether the canonical `host:port` destination must not be relayed
    fn contains(&self, addr: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Host { host: String, port: Option<u16> },
    Suffix(String),
    Network(IpNet),
}

impl Matcher {
    fn parse(rule: &str) -> Option<Self> {
        let rule = rule.trim();
        if rule.is_empty() {
            return None;
        }

        if let Ok(net) = rule.parse::<IpNet>() {
            return Some(Matcher::Network(net));
        }
        if let Some(domain) = rule.strip_prefix("*.").or_else(|| rule.strip_prefix('.')) {
            return Some(Matcher::Suffix(domain.to_ascii_lowercase()));
        }

        let (host, port) = split_host_port(rule);
        Some(Matcher::Host {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>, port: Option<u16>) -> bool {
        match self {
            Matcher::Host { host: rule_host, port: rule_port } => {
                let host_eq = match (ip, rule_host.parse::<IpAddr>()) {
                    (Some(ip), Ok(rule_ip)) => ip == rule_ip,
                    _ => rule_host.eq_ignore_ascii_case(host),
                };
                host_eq && rule_port.map_or(true, |p| Some(p) == port)
            }
            Matcher::Suffix(domain) => {
                let host = host.to_ascii_lowercase();
                host == *domain
                    || host
                        .strip_suffix(domain.as_str())
                        .map_or(false, |head| head.ends_with('.'))
            }
            Matcher::Network(net) => ip.map_or(false, |ip| net.contains(&ip)),
        }
    }
}

/// Rule-list bypass
#[derive(Debug, Clone, Default)]
pub struct BypassSet {
    matchers: Vec<Matcher>,
    whitelist: bool,
}

impl BypassSet {
    /// Compile `rules`; blank entries are skipped.
    ///
    /// With `whitelist` set, only destinations matching a rule are allowed.
    pub fn new<I, S>(rules: I, whitelist: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers = rules
            .into_iter()
            .filter_map(|r| Matcher::parse(r.as_ref()))
            .collect::<Vec<_>>();
        debug!(
            "Bypass compiled {} rule(s), whitelist={}",
            matchers.len(),
            whitelist
        );
        Self { matchers, whitelist }
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }
}

impl Bypass for BypassSet {
    fn contains(&self, addr: &str) -> bool {
        if self.matchers.is_empty() {
            return false;
        }

        let (host, port) = split_host_port(addr);
        let ip = host.parse::<IpAddr>().ok();
        let matched = self.matchers.iter().any(|m| m.matches(host, ip, port));
        matched != self.whitelist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_never_bypasses() {
        assert!(!BypassSet::default().contains("example.com:80"));
        assert!(!BypassSet::new(Vec::<String>::new(), true).contains("example.com:80"));
        assert!(BypassSet::new(["", "  "], false).is_empty());
    }

    #[test]
    fn test_exact_host() {
        let set = BypassSet::new(["Example.com", "10.0.0.1"], false);
        assert!(set.contains("example.com:80"));
        assert!(set.contains("EXAMPLE.COM:443"));
        assert!(!set.contains("www.example.com:80"));
        assert!(set.contains("10.0.0.1:53"));
        assert!(!set.contains("10.0.0.2:53"));
    }

    #[test]
    fn test_host_with_port() {
        let set = BypassSet::new(["example.com:443", "[::1]:22"], false);
        assert!(set.contains("example.com:443"));
        assert!(!set.contains("example.com:80"));
        assert!(set.contains("[::1]:22"));
        assert!(!set.contains("[::1]:23"));
    }

    #[test]
    fn test_domain_suffix() {
        let set = BypassSet::new(["*.example.com", ".test.org"], false);
        assert!(set.contains("example.com:80"));
        assert!(set.contains("a.b.example.com:80"));
        assert!(!set.contains("badexample.com:80"));
        assert!(set.contains("www.test.org:8080"));
        assert!(!set.contains("test.org.evil:80"));
    }

    #[test]
    fn test_cidr() {
        let set = BypassSet::new(["192.168.0.0/16", "2001:db8::/32"], false);
        assert!(set.contains("192.168.1.1:80"));
        assert!(!set.contains("10.0.0.1:80"));
        assert!(set.contains("[2001:db8::1]:443"));
        assert!(!set.contains("[2001:db9::1]:443"));
        assert!(!set.contains("example.com:80"));
    }

    #[test]
    fn test_whitelist_inverts() {
        let set = BypassSet::new(["*.allowed.net"], true);
        assert!(!set.contains("api.allowed.net:443"));
        assert!(set.contains("example.com:80"));
        assert_eq!(set.len(), 1);
    }
}
