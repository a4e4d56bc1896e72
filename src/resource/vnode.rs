// src/resource/vnode.rs
//! Virtual nodes
//!
//! A node starts life as a `VNodeSpec` (name + image URI). Only once its
//! filesystem has been provisioned does it become a `VNode` that the
//! platform graph will hold, so the graph never contains a node without a
//! usable root filesystem.

use crate::resource::viface::VIface;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Unresolved node request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VNodeSpec {
    pub name: String,

    /// Root filesystem image URI (path or `file://` URI)
    pub image: String,
}

impl VNodeSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }

    /// Bind the spec to its materialized root filesystem
    pub fn resolve(self, path: PathBuf) -> VNode {
        VNode {
            filesystem: Filesystem {
                image: self.image,
                path,
            },
            name: self.name,
            vifaces: Vec::new(),
            vcpu: None,
            gateway: false,
            status: VNodeStatus::Created,
            created_at: Utc::now(),
        }
    }
}

/// Materialized root filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filesystem {
    pub image: String,
    pub path: PathBuf,
}

/// Node lifecycle as seen by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VNodeStatus {
    Created,
    Running,
    Stopped,
}

/// One virtual core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VCore {
    pub id: usize,

    /// Physical core this virtual core is pinned to; `None` when floating
    pub pcore: Option<usize>,
}

/// Virtual CPU assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VCpu {
    pub cores: Vec<VCore>,

    /// Cores pinned one-to-one onto physical cores
    pub linked: bool,
}

impl VCpu {
    /// Physical cores reserved by a linked assignment
    pub fn pinned_cores(&self) -> Vec<usize> {
        self.cores.iter().filter_map(|c| c.pcore).collect()
    }
}

/// Provisioned virtual node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VNode {
    pub name: String,
    pub filesystem: Filesystem,
    pub vifaces: Vec<VIface>,
    pub vcpu: Option<VCpu>,

    /// Forwards traffic between the networks it is attached to
    pub gateway: bool,
    pub status: VNodeStatus,
    pub created_at: DateTime<Utc>,
}

impl VNode {
    pub fn get_viface(&self, name: &str) -> Option<&VIface> {
        self.vifaces.iter().find(|i| i.name == name)
    }

    pub fn get_viface_mut(&mut self, name: &str) -> Option<&mut VIface> {
        self.vifaces.iter_mut().find(|i| i.name == name)
    }

    /// Interface attached to `vnetwork`, if any
    pub fn viface_on(&self, vnetwork: &str) -> Option<&VIface> {
        self.vifaces
            .iter()
            .find(|i| i.vnetwork.as_deref() == Some(vnetwork))
    }

    pub fn is_running(&self) -> bool {
        self.status == VNodeStatus::Running
    }
}
