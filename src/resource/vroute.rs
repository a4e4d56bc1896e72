// src/resource/vroute.rs
//! Virtual routes between networks

use serde::Serialize;
use std::fmt;

/// Forwarding path from one network to another through a gateway node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VRoute {
    pub source: String,
    pub destination: String,
    pub gateway: String,
}

impl VRoute {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            gateway: gateway.into(),
        }
    }

    /// Whether the route touches `vnetwork` at either end
    pub fn references_network(&self, vnetwork: &str) -> bool {
        self.source == vnetwork || self.destination == vnetwork
    }
}

impl fmt::Display for VRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} via {}", self.source, self.destination, self.gateway)
    }
}
