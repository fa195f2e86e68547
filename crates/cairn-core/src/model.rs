//! Membership Model
//!
//! Addresses, the local member entry that gets registered, and the nodes
//! returned by enumeration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Network address of a cluster node (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error parsing a [`NodeAddress`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node address {input:?}: {reason}")]
pub struct AddressParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| AddressParseError {
            input: s.to_string(),
            reason,
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| err("missing port"))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| err("unterminated IPv6 bracket"))?,
            None => host,
        };
        if host.is_empty() {
            return Err(err("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.to_string()
    }
}

impl From<std::net::SocketAddr> for NodeAddress {
    fn from(value: std::net::SocketAddr) -> Self {
        Self::new(value.ip().to_string(), value.port())
    }
}

/// The local process's registrable identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub address: NodeAddress,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MemberEntry {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stable directory identity; depends only on the address.
    ///
    /// `{host}_{port}` with every host byte outside `[A-Za-z0-9.-]` written as
    /// `%XX`, so the id is safe as a key segment and distinct addresses never
    /// share one. [`MemberEntry::parse_id`] reverses it.
    pub fn id(&self) -> String {
        let mut id = String::with_capacity(self.address.host().len() + 6);
        for byte in self.address.host().bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
                id.push(byte as char);
            } else {
                id.push_str(&format!("%{byte:02X}"));
            }
        }
        id.push('_');
        id.push_str(&self.address.port().to_string());
        id
    }

    /// Address encoded in a member id, if `id` is well formed
    pub fn parse_id(id: &str) -> Option<NodeAddress> {
        let (host, port) = id.rsplit_once('_')?;
        let port = port.parse::<u16>().ok()?;

        let mut bytes = Vec::with_capacity(host.len());
        let mut rest = host.as_bytes();
        while let Some((&first, tail)) = rest.split_first() {
            if first == b'%' {
                let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
                rest = &tail[2..];
            } else {
                bytes.push(first);
                rest = tail;
            }
        }
        let host = String::from_utf8(bytes).ok()?;
        (!host.is_empty()).then(|| NodeAddress::new(host, port))
    }
}

/// A peer returned by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredNode {
    pub address: NodeAddress,
    pub healthy: bool,
    /// Service name the node was found under
    pub service: String,
}

impl DiscoveredNode {
    pub fn new(address: NodeAddress, healthy: bool, service: impl Into<String>) -> Self {
        Self {
            address,
            healthy,
            service: service.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr: NodeAddress = "10.0.0.1:2552".parse().unwrap();
        assert_eq!(addr.host(), "10.0.0.1");
        assert_eq!(addr.port(), 2552);
        assert_eq!(addr.to_string(), "10.0.0.1:2552");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: NodeAddress = "[fd00::1]:9000".parse().unwrap();
        assert_eq!(addr.host(), "fd00::1");
        assert_eq!(addr.to_string(), "[fd00::1]:9000");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("no-port".parse::<NodeAddress>().is_err());
        assert!(":9000".parse::<NodeAddress>().is_err());
        assert!("host:99999".parse::<NodeAddress>().is_err());
        assert!("[fd00::1:9000".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_member_id_is_address_derived() {
        let a = MemberEntry::new(NodeAddress::new("10.0.0.1", 2552));
        let b = MemberEntry::new(NodeAddress::new("10.0.0.1", 2552)).with_metadata("role", "web");
        assert_eq!(a.id(), "10.0.0.1_2552");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_member_id_keeps_addresses_apart() {
        let dotted = MemberEntry::new(NodeAddress::new("10.0.0.1", 2552));
        let underscored = MemberEntry::new(NodeAddress::new("10_0_0_1", 2552));
        assert_ne!(dotted.id(), underscored.id());
        assert_eq!(underscored.id(), "10%5F0%5F0%5F1_2552");

        let v6 = MemberEntry::new(NodeAddress::new("fd00::1", 9000));
        assert_eq!(v6.id(), "fd00%3A%3A1_9000");
        assert!(!v6.id().contains('/'));

        for entry in [dotted, underscored, v6] {
            assert_eq!(MemberEntry::parse_id(&entry.id()), Some(entry.address.clone()));
        }
        assert_eq!(MemberEntry::parse_id("no-port"), None);
        assert_eq!(MemberEntry::parse_id("bad%zz_80"), None);
    }

    #[test]
    fn test_address_serde_as_string() {
        let node = DiscoveredNode::new(NodeAddress::new("web-1", 80), true, "web");
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"web-1:80\""));
        let back: DiscoveredNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
