// Fully qualified topic names of the form `persistent://tenant/namespace/topic`.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicDomain {
    Persistent,
    NonPersistent,
}

impl TopicDomain {
    fn scheme(self) -> &'static str {
        match self {
            TopicDomain::Persistent => "persistent",
            TopicDomain::NonPersistent => "non-persistent",
        }
    }
}

/// Parsed topic name. The proxy only ever needs the pieces for authorization
/// scoping and per-topic stats keys; it never rewrites topic names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    pub domain: TopicDomain,
    pub tenant: String,
    pub namespace: String,
    pub topic: String,
}

impl TopicName {
    /// Key used for stats registries and authorization resources.
    pub fn qualified(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.domain.scheme(),
            self.tenant,
            self.namespace,
            self.topic
        )
    }
}

impl FromStr for TopicName {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidTopic(input.to_string()))?;
        let domain = match scheme {
            "persistent" => TopicDomain::Persistent,
            "non-persistent" => TopicDomain::NonPersistent,
            _ => return Err(Error::InvalidTopic(input.to_string())),
        };
        let mut parts = rest.splitn(3, '/');
        let tenant = parts.next().unwrap_or_default();
        let namespace = parts.next().unwrap_or_default();
        let topic = parts.next().unwrap_or_default();
        if tenant.is_empty() || namespace.is_empty() || topic.is_empty() {
            return Err(Error::InvalidTopic(input.to_string()));
        }
        Ok(Self {
            domain,
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            topic: topic.to_string(),
        })
    }
}
