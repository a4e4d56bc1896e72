// src/resource/mod.rs
//! Platform resources
//!
//! - **PNode**: physical host and its cores
//! - **VNode**: virtual node (provisioned from a `VNodeSpec`)
//! - **VIface**: interface owned by a virtual node
//! - **VNetwork**: named CIDR block interfaces attach to
//! - **VRoute**: forwarding path between two networks via a gateway node
//! - **VPlatform**: the graph holding all of the above

pub mod pnode;
pub mod viface;
pub mod vnetwork;
pub mod vnode;
pub mod vplatform;
pub mod vroute;

pub use pnode::{PCore, PCpu, PNode, PNodeStatus};
pub use viface::VIface;
pub use vnetwork::{Cidr, NetworkMember, VNetwork};
pub use vnode::{Filesystem, VCore, VCpu, VNode, VNodeSpec, VNodeStatus};
pub use vplatform::{VNetworkRemoval, VPlatform};
pub use vroute::VRoute;

use crate::utils::errors::ResourceKind;

/// Reference to a destroyable resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Physical hosts are never destroyed through the orchestrator
    PNode(String),
    VNode(String),
    VNetwork(String),
    VRoute(VRoute),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::PNode(_) => ResourceKind::PNode,
            Resource::VNode(_) => ResourceKind::VNode,
            Resource::VNetwork(_) => ResourceKind::VNetwork,
            Resource::VRoute(_) => ResourceKind::VRoute,
        }
    }
}
