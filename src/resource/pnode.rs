// src/resource/pnode.rs
//! Physical nodes
//!
//! One per physical host. Created at platform start from the host's
//! default address and moved from `Init` to `Running` once, when the
//! remote daemon has been bootstrapped.

use crate::utils::errors::{PlatformError, Result};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use tracing::debug;

/// Physical node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PNodeStatus {
    Init,
    Running,
}

/// One physical core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PCore {
    pub id: usize,

    /// Virtual node pinned to this core
    pub owner: Option<String>,
}

/// Physical CPU of a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PCpu {
    pub cores: Vec<PCore>,
}

impl PCpu {
    pub fn new(count: usize) -> Self {
        Self {
            cores: (0..count).map(|id| PCore { id, owner: None }).collect(),
        }
    }

    pub fn free_cores(&self) -> usize {
        self.cores.iter().filter(|c| c.owner.is_none()).count()
    }

    /// Pin `count` free cores to `owner`; all or nothing
    pub fn allocate(&mut self, owner: &str, count: usize) -> Result<Vec<usize>> {
        let free: Vec<usize> = self
            .cores
            .iter()
            .filter(|c| c.owner.is_none())
            .map(|c| c.id)
            .take(count)
            .collect();

        if free.len() < count {
            return Err(PlatformError::CapacityExceeded(format!(
                "{} physical cores requested for '{}', {} free",
                count,
                owner,
                self.free_cores()
            )));
        }

        for id in &free {
            self.cores[*id].owner = Some(owner.to_string());
        }
        Ok(free)
    }

    /// Unpin every core held by `owner`; returns how many were freed
    pub fn release(&mut self, owner: &str) -> usize {
        let mut freed = 0;
        for core in &mut self.cores {
            if core.owner.as_deref() == Some(owner) {
                core.owner = None;
                freed += 1;
            }
        }
        freed
    }
}

/// Physical host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PNode {
    pub address: String,
    pub ssh_user: String,
    pub ssh_key: PathBuf,
    pub status: PNodeStatus,
    pub cpu: PCpu,
}

impl PNode {
    pub fn new(address: impl Into<String>, cores: usize) -> Self {
        Self {
            address: address.into(),
            ssh_user: "root".to_string(),
            ssh_key: PathBuf::from("/root/.ssh/id_rsa"),
            status: PNodeStatus::Init,
            cpu: PCpu::new(cores),
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        self.ssh_user = user.into();
        self.ssh_key = key.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == PNodeStatus::Running
    }
}

/// Address of the interface carrying the default route
///
/// Connecting a UDP socket sends nothing but makes the kernel pick the
/// outgoing interface. Falls back to loopback on hosts without a route.
pub fn default_address() -> IpAddr {
    let detected = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match detected {
        Ok(ip) => ip,
        Err(e) => {
            debug!("No default route ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
