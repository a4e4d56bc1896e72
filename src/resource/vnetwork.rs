// src/resource/vnetwork.rs
//! Virtual networks and their CIDR address blocks

use crate::utils::errors::{PlatformError, Result};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// IPv4 address block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Build a block, clearing any host bits of `address`
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(PlatformError::InvalidParameter(format!(
                "Prefix length {} exceeds 32",
                prefix
            )));
        }
        let network = Ipv4Addr::from(u32::from(address) & Self::mask(prefix));
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask(self.prefix))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix) == u32::from(self.network)
    }

    /// Assignable host addresses, in ascending order
    ///
    /// Network and broadcast addresses are excluded for blocks larger
    /// than /31.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network) as u64;
        let size = 1u64 << (32 - self.prefix as u32);
        let (start, end) = if self.prefix >= 31 {
            (first, first + size)
        } else {
            (first + 1, first + size - 1)
        };
        (start..end).map(|a| Ipv4Addr::from(a as u32))
    }

    pub fn is_host(&self, address: Ipv4Addr) -> bool {
        if !self.contains(address) {
            return false;
        }
        if self.prefix >= 31 {
            return true;
        }
        let broadcast = u32::from(self.network) | !Self::mask(self.prefix);
        address != self.network && u32::from(address) != broadcast
    }
}

impl FromStr for Cidr {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PlatformError::InvalidParameter(format!("Invalid CIDR block '{}'", s));
        let (address, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = address.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        Cidr::new(address, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One node's attachment to a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkMember {
    pub iface: String,
    pub address: Ipv4Addr,
}

/// Named address block that virtual interfaces attach to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VNetwork {
    pub name: String,
    pub address: Cidr,

    /// Node name -> attached interface
    pub members: BTreeMap<String, NetworkMember>,
}

impl VNetwork {
    pub fn new(name: impl Into<String>, address: Cidr) -> Self {
        Self {
            name: name.into(),
            address,
            members: BTreeMap::new(),
        }
    }

    /// Parse `address` as a CIDR block and build an empty network
    pub fn parse(name: impl Into<String>, address: &str) -> Result<Self> {
        Ok(Self::new(name, address.parse()?))
    }

    pub fn has_member(&self, vnode: &str) -> bool {
        self.members.contains_key(vnode)
    }

    pub fn is_address_taken(&self, address: Ipv4Addr) -> bool {
        self.members.values().any(|m| m.address == address)
    }

    /// Lowest host address not yet assigned to a member
    pub fn next_free_address(&self) -> Option<Ipv4Addr> {
        self.address.hosts().find(|a| !self.is_address_taken(*a))
    }
}
