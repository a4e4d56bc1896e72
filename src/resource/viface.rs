// src/resource/viface.rs
//! Virtual network interfaces

use crate::runtime::limitation::Limitation;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Interface owned by a virtual node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VIface {
    /// Host-wide id, bounded by `max_ifaces`
    pub id: u32,

    /// Name inside the node (e.g. "if0")
    pub name: String,

    /// Traffic shaping has been installed
    pub limited: bool,

    /// Network this interface is attached to
    pub vnetwork: Option<String>,

    /// Address within the attached network
    pub address: Option<Ipv4Addr>,

    /// Requested shaping, applied once by the orchestrator
    pub limitation: Option<Limitation>,
}

impl VIface {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            limited: false,
            vnetwork: None,
            address: None,
            limitation: None,
        }
    }

    /// Host-side forwarding device backing this interface
    pub fn device(&self) -> String {
        format!("ifb{}", self.id)
    }

    pub fn is_attached(&self) -> bool {
        self.vnetwork.is_some()
    }

    /// Forget network membership and shaping state
    pub(crate) fn detach(&mut self) {
        self.vnetwork = None;
        self.address = None;
        self.limited = false;
    }
}
