// Egress gate for direct-splice targets. A `(host, port)` pair must pass
// the hostname allow-list, the resolved-IP allow-list, and the port
// allow-list before any backend socket is opened. All three lists default
// to deny-all.
use cidr::IpCidr;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::dns::DnsResolver;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("target host {0} is not in the allowed host list")]
    HostNotAllowed(String),
    #[error("target port {0} is not in the allowed port list")]
    PortNotAllowed(u16),
    #[error("resolved address {0} is not in the allowed IP list")]
    IpNotAllowed(IpAddr),
    #[error("dns resolution failed for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct BrokerProxyValidator {
    allowed_hosts: Vec<String>,
    allowed_ips: Vec<IpCidr>,
    allowed_ports: Vec<RangeInclusive<u16>>,
    resolver: Arc<dyn DnsResolver>,
}

impl BrokerProxyValidator {
    /// Build from the comma-separated config strings. Empty strings mean
    /// deny-all for that dimension.
    pub fn from_config(
        allowed_host_names: &str,
        allowed_ip_addresses: &str,
        allowed_target_ports: &str,
        resolver: Arc<dyn DnsResolver>,
    ) -> Result<Self> {
        let allowed_hosts = split_csv(allowed_host_names)
            .map(str::to_string)
            .collect();
        let mut allowed_ips = Vec::new();
        for item in split_csv(allowed_ip_addresses) {
            // Bare addresses are accepted as /32 (or /128) networks.
            let cidr: IpCidr = item
                .parse()
                .or_else(|_| item.parse::<IpAddr>().map(IpCidr::new_host))
                .with_context(|| format!("parse allowed IP entry: {item}"))?;
            allowed_ips.push(cidr);
        }
        let mut allowed_ports = Vec::new();
        for item in split_csv(allowed_target_ports) {
            allowed_ports.push(parse_port_range(item)?);
        }
        Ok(Self {
            allowed_hosts,
            allowed_ips,
            allowed_ports,
            resolver,
        })
    }

    /// Validate a target and return its resolved addresses in connect order.
    pub async fn validate(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, EgressError> {
        if !self
            .allowed_hosts
            .iter()
            .any(|pattern| wildcard_match(pattern, host))
        {
            return Err(EgressError::HostNotAllowed(host.to_string()));
        }
        if !self.allowed_ports.iter().any(|range| range.contains(&port)) {
            return Err(EgressError::PortNotAllowed(port));
        }
        let ips = self
            .resolver
            .resolve(host)
            .await
            .map_err(|source| EgressError::Resolve {
                host: host.to_string(),
                source,
            })?;
        for ip in &ips {
            if !self.allowed_ips.iter().any(|cidr| cidr.contains(ip)) {
                return Err(EgressError::IpNotAllowed(*ip));
            }
        }
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

fn split_csv(input: &str) -> impl Iterator<Item = &str> {
    input
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn parse_port_range(item: &str) -> Result<RangeInclusive<u16>> {
    if let Some((low, high)) = item.split_once('-') {
        let low: u16 = low
            .trim()
            .parse()
            .with_context(|| format!("parse port range start: {item}"))?;
        let high: u16 = high
            .trim()
            .parse()
            .with_context(|| format!("parse port range end: {item}"))?;
        if low > high {
            anyhow::bail!("port range is inverted: {item}");
        }
        Ok(low..=high)
    } else {
        let port: u16 = item
            .parse()
            .with_context(|| format!("parse port: {item}"))?;
        Ok(port..=port)
    }
}

/// Glob match with `*` as the only metacharacter.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let (mut p_idx, mut v_idx) = (0usize, 0usize);
    let (mut star_idx, mut match_idx) = (None, 0usize);
    let pattern_bytes = pattern.as_bytes();
    let value_bytes = value.as_bytes();

    while v_idx < value_bytes.len() {
        if p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == b'*' {
            star_idx = Some(p_idx);
            match_idx = v_idx;
            p_idx += 1;
            continue;
        }

        if p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == value_bytes[v_idx] {
            p_idx += 1;
            v_idx += 1;
            continue;
        }

        if let Some(star) = star_idx {
            p_idx = star + 1;
            match_idx += 1;
            v_idx = match_idx;
            continue;
        }

        return false;
    }

    while p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == b'*' {
        p_idx += 1;
    }

    p_idx == pattern_bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedResolver(Vec<IpAddr>);

    #[async_trait]
    impl DnsResolver for FixedResolver {
        async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            if self.0.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses",
                ));
            }
            Ok(self.0.clone())
        }
    }

    fn validator(hosts: &str, ips: &str, ports: &str, resolved: &[&str]) -> BrokerProxyValidator {
        let resolver = Arc::new(FixedResolver(
            resolved.iter().map(|ip| ip.parse().unwrap()).collect(),
        ));
        BrokerProxyValidator::from_config(hosts, ips, ports, resolver).expect("validator")
    }

    #[tokio::test]
    async fn deny_all_by_default() {
        let validator = validator("", "", "", &["10.0.0.1"]);
        let err = validator.validate("broker-a", 6650).await.expect_err("deny");
        assert!(matches!(err, EgressError::HostNotAllowed(_)));
    }

    #[tokio::test]
    async fn all_three_policies_must_pass() {
        let validator = validator("broker-*", "10.0.0.0/8", "6650-6660", &["10.1.2.3"]);
        let addrs = validator.validate("broker-a", 6650).await.expect("allow");
        assert_eq!(addrs, vec!["10.1.2.3:6650".parse().unwrap()]);

        let err = validator
            .validate("db.internal", 6650)
            .await
            .expect_err("host");
        assert!(matches!(err, EgressError::HostNotAllowed(_)));

        let err = validator.validate("broker-a", 9999).await.expect_err("port");
        assert!(matches!(err, EgressError::PortNotAllowed(9999)));
    }

    #[tokio::test]
    async fn every_resolved_ip_must_be_allowed() {
        let validator = validator(
            "broker-*",
            "10.0.0.0/8",
            "6650",
            &["10.1.2.3", "192.168.0.1"],
        );
        let err = validator.validate("broker-a", 6650).await.expect_err("ip");
        assert!(matches!(err, EgressError::IpNotAllowed(ip) if ip == "192.168.0.1".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn bare_ip_entries_act_as_host_networks() {
        let validator = validator("*", "10.1.2.3", "6650", &["10.1.2.3"]);
        assert!(validator.validate("broker-a", 6650).await.is_ok());
    }

    #[tokio::test]
    async fn dns_failure_surfaces_as_resolve_error() {
        let validator = validator("*", "0.0.0.0/0", "1-65535", &[]);
        let err = validator.validate("gone.example", 6650).await.expect_err("dns");
        assert!(matches!(err, EgressError::Resolve { .. }));
    }

    #[test]
    fn wildcard_match_basics() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("broker-*", "broker-a"));
        assert!(wildcard_match("broker-a.*", "broker-a.cluster.local"));
        assert!(!wildcard_match("broker-a.*", "broker-b.example"));
        assert!(wildcard_match("*.internal", "cache.internal"));
        assert!(!wildcard_match("*.internal", "cache.external"));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("", ""));
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!(parse_port_range("6650").unwrap(), 6650..=6650);
        assert_eq!(parse_port_range("6650-6660").unwrap(), 6650..=6660);
        assert!(parse_port_range("6660-6650").is_err());
        assert!(parse_port_range("harbor").is_err());
    }
}
