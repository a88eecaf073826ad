// Broker service URLs: `pulsar://host:port` and `pulsar+ssl://host:port`.
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

pub const DEFAULT_SERVICE_PORT: u16 = 6650;
pub const DEFAULT_SERVICE_PORT_TLS: u16 = 6651;

/// Parsed broker target. Egress validation and outbound connects work on
/// the `(host, port)` pair; `tls` selects the backend handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerUrl {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "pulsar+ssl" } else { "pulsar" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

impl FromStr for BrokerUrl {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidUrl(input.to_string()))?;
        let tls = match scheme {
            "pulsar" => false,
            "pulsar+ssl" => true,
            _ => return Err(Error::InvalidUrl(input.to_string())),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidUrl(input.to_string()))?;
                (host, port)
            }
            None => (
                rest,
                if tls {
                    DEFAULT_SERVICE_PORT_TLS
                } else {
                    DEFAULT_SERVICE_PORT
                },
            ),
        };
        if host.is_empty() {
            return Err(Error::InvalidUrl(input.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain() {
        let url: BrokerUrl = "pulsar://broker-a:6650".parse().expect("parse");
        assert_eq!(url.host, "broker-a");
        assert_eq!(url.port, 6650);
        assert!(!url.tls);
        assert_eq!(url.to_string(), "pulsar://broker-a:6650");
    }

    #[test]
    fn parse_tls_with_default_port() {
        let url: BrokerUrl = "pulsar+ssl://broker-a".parse().expect("parse");
        assert_eq!(url.port, DEFAULT_SERVICE_PORT_TLS);
        assert!(url.tls);
    }

    #[test]
    fn parse_ignores_trailing_slash() {
        let url: BrokerUrl = "pulsar://broker-a:6650/".parse().expect("parse");
        assert_eq!(url.authority(), "broker-a:6650");
    }

    #[test]
    fn rejects_foreign_schemes_and_bad_ports() {
        assert!(BrokerUrl::from_str("http://broker-a:80").is_err());
        assert!(BrokerUrl::from_str("pulsar://broker-a:notaport").is_err());
        assert!(BrokerUrl::from_str("pulsar://:6650").is_err());
    }
}
