//! The access control list: an ordered set of address prefixes with an
//! allow or deny action, evaluated before a packet reaches the protocol.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetParseError {
    #[error("invalid address in subnet")]
    Address,
    #[error("invalid prefix length in subnet")]
    PrefixLength,
}

/// An address prefix in CIDR notation; a bare address means a full-length
/// prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpSubnet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpSubnet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = match self.prefix_len {
                    0 => 0,
                    len => u32::MAX << (32 - len as u32),
                };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = match self.prefix_len {
                    0 => 0,
                    len => u128::MAX << (128 - len as u32),
                };
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpSubnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| SubnetParseError::Address)?;
                let len: u8 = len.parse().map_err(|_| SubnetParseError::PrefixLength)?;
                (addr, len)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| SubnetParseError::Address)?;
                let len = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, len)
            }
        };

        let max_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max_len {
            return Err(SubnetParseError::PrefixLength);
        }

        Ok(IpSubnet {
            addr,
            prefix_len: len,
        })
    }
}

impl<'de> Deserialize<'de> for IpSubnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AccessEntry {
    pub subnet: IpSubnet,
    pub action: AccessAction,
}

/// First match in the ordered list wins; an address matching nothing is
/// allowed.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    entries: Vec<AccessEntry>,
}

impl IpFilter {
    pub fn new(entries: &[AccessEntry]) -> Self {
        Self {
            entries: entries.to_vec(),
        }
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        for entry in &self.entries {
            if entry.subnet.contains(addr) {
                return entry.action == AccessAction::Allow;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> IpSubnet {
        s.parse().unwrap()
    }

    #[test]
    fn subnet_parsing() {
        assert_eq!(
            subnet("10.0.0.0/8"),
            IpSubnet {
                addr: "10.0.0.0".parse().unwrap(),
                prefix_len: 8
            }
        );
        // a bare address is a host prefix
        assert_eq!(subnet("10.1.2.3").prefix_len, 32);
        assert_eq!(subnet("::1").prefix_len, 128);

        assert!("10.0.0.0/33".parse::<IpSubnet>().is_err());
        assert!("fe80::/129".parse::<IpSubnet>().is_err());
        assert!("not-an-address/8".parse::<IpSubnet>().is_err());
    }

    #[test]
    fn subnet_membership() {
        let net = subnet("10.0.0.0/8");
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.1.2.3".parse().unwrap()));
        // address families never match each other
        assert!(!net.contains("::1".parse().unwrap()));

        let everything = subnet("0.0.0.0/0");
        assert!(everything.contains("203.0.113.7".parse().unwrap()));

        let host = subnet("192.0.2.1/32");
        assert!(host.contains("192.0.2.1".parse().unwrap()));
        assert!(!host.contains("192.0.2.2".parse().unwrap()));

        let v6 = subnet("2001:db8::/32");
        assert!(v6.contains("2001:db8::42".parse().unwrap()));
        assert!(!v6.contains("2001:db9::42".parse().unwrap()));
    }

    #[test]
    fn first_match_wins() {
        let filter = IpFilter::new(&[
            AccessEntry {
                subnet: subnet("10.1.0.0/16"),
                action: AccessAction::Allow,
            },
            AccessEntry {
                subnet: subnet("10.0.0.0/8"),
                action: AccessAction::Deny,
            },
        ]);

        assert!(filter.is_allowed("10.1.2.3".parse().unwrap()));
        assert!(!filter.is_allowed("10.2.2.3".parse().unwrap()));
        // no match: default allow
        assert!(filter.is_allowed("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn empty_filter_allows_everything() {
        let filter = IpFilter::new(&[]);
        assert!(filter.is_allowed("203.0.113.7".parse().unwrap()));
    }
}
