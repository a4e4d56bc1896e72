// src/resource/vplatform.rs
//! Virtual platform graph
//!
//! In-memory registry of virtual nodes, networks and routes. The graph
//! enforces the structural invariants itself (unique names, consistent
//! node/network membership, valid gateway topology); lifecycle side effects
//! belong to the orchestrator.
//!
//! There is no internal locking: the orchestrator is the single writer.

use crate::resource::viface::VIface;
use crate::resource::vnetwork::{NetworkMember, VNetwork};
use crate::resource::vnode::VNode;
use crate::resource::vroute::VRoute;
use crate::utils::errors::{PlatformError, ResourceKind, Result};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// What a network removal detached, for cascading cleanup by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct VNetworkRemoval {
    pub vnetwork: VNetwork,

    /// (node, interface) pairs that were attached
    pub members: Vec<(String, String)>,

    /// Routes that referenced the network
    pub vroutes: Vec<VRoute>,
}

/// Registry of virtual resources
#[derive(Debug, Default)]
pub struct VPlatform {
    vnodes: BTreeMap<String, VNode>,
    vnetworks: BTreeMap<String, VNetwork>,
    vroutes: Vec<VRoute>,
}

impl VPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- nodes ----

    pub fn add_vnode(&mut self, vnode: VNode) -> Result<()> {
        if self.vnodes.contains_key(&vnode.name) {
            return Err(PlatformError::duplicate(ResourceKind::VNode, &vnode.name));
        }
        debug!("Registering vnode {}", vnode.name);
        self.vnodes.insert(vnode.name.clone(), vnode);
        Ok(())
    }

    pub fn has_vnode(&self, name: &str) -> bool {
        self.vnodes.contains_key(name)
    }

    pub fn get_vnode(&self, name: &str) -> Option<&VNode> {
        self.vnodes.get(name)
    }

    pub fn get_vnode_mut(&mut self, name: &str) -> Option<&mut VNode> {
        self.vnodes.get_mut(name)
    }

    /// Look a node up, failing with `ResourceNotFound`
    pub fn vnode(&self, name: &str) -> Result<&VNode> {
        self.vnodes
            .get(name)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VNode, name))
    }

    fn vnode_mut(&mut self, name: &str) -> Result<&mut VNode> {
        self.vnodes
            .get_mut(name)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VNode, name))
    }

    pub fn vnodes(&self) -> impl Iterator<Item = &VNode> {
        self.vnodes.values()
    }

    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Unregister a node, detaching its interfaces and dropping the routes
    /// it was gateway for
    pub fn remove_vnode(&mut self, name: &str) -> Result<VNode> {
        let mut vnode = self
            .vnodes
            .remove(name)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VNode, name))?;

        for network in self.vnetworks.values_mut() {
            network.members.remove(name);
        }
        for iface in &mut vnode.vifaces {
            iface.detach();
        }

        let before = self.vroutes.len();
        self.vroutes.retain(|r| r.gateway != name);
        if self.vroutes.len() != before {
            info!("Dropped {} routes gatewayed by {}", before - self.vroutes.len(), name);
        }

        debug!("Unregistered vnode {}", name);
        Ok(vnode)
    }

    // ---- interfaces ----

    /// Whether any node holds an interface with `id`
    pub fn is_viface_id_used(&self, id: u32) -> bool {
        self.vnodes
            .values()
            .flat_map(|n| n.vifaces.iter())
            .any(|i| i.id == id)
    }

    /// All interfaces with their owning node
    pub fn vifaces(&self) -> impl Iterator<Item = (&VNode, &VIface)> {
        self.vnodes
            .values()
            .flat_map(|n| n.vifaces.iter().map(move |i| (n, i)))
    }

    pub fn add_viface(&mut self, vnode: &str, iface: VIface) -> Result<()> {
        if self.is_viface_id_used(iface.id) {
            return Err(PlatformError::duplicate(
                ResourceKind::VIface,
                format!("id {}", iface.id),
            ));
        }
        let node = self.vnode_mut(vnode)?;
        if node.get_viface(&iface.name).is_some() {
            return Err(PlatformError::duplicate(
                ResourceKind::VIface,
                format!("{}.{}", vnode, iface.name),
            ));
        }
        node.vifaces.push(iface);
        Ok(())
    }

    pub fn get_viface(&self, vnode: &str, iface: &str) -> Result<&VIface> {
        self.vnode(vnode)?
            .get_viface(iface)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VIface, format!("{}.{}", vnode, iface)))
    }

    pub fn get_viface_mut(&mut self, vnode: &str, iface: &str) -> Result<&mut VIface> {
        self.vnode_mut(vnode)?
            .get_viface_mut(iface)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VIface, format!("{}.{}", vnode, iface)))
    }

    /// Detach then unregister an interface
    pub fn remove_viface(&mut self, vnode: &str, iface: &str) -> Result<VIface> {
        self.detach_viface(vnode, iface)?;
        let node = self.vnode_mut(vnode)?;
        let index = node
            .vifaces
            .iter()
            .position(|i| i.name == iface)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VIface, format!("{}.{}", vnode, iface)))?;
        Ok(node.vifaces.remove(index))
    }

    /// Attach an interface to a network and return its address
    ///
    /// Allocates the lowest free host address when `address` is `None`.
    pub fn attach_viface(
        &mut self,
        vnode: &str,
        iface: &str,
        vnetwork: &str,
        address: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let current = self.get_viface(vnode, iface)?;
        if let Some(attached) = &current.vnetwork {
            return Err(PlatformError::InvalidState(format!(
                "{}.{} is already attached to {}",
                vnode, iface, attached
            )));
        }

        let network = self
            .vnetworks
            .get_mut(vnetwork)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VNetwork, vnetwork))?;

        if network.has_member(vnode) {
            return Err(PlatformError::InvalidState(format!(
                "{} already has an interface on {}",
                vnode, vnetwork
            )));
        }

        let address = match address {
            Some(address) => {
                if !network.address.is_host(address) {
                    return Err(PlatformError::InvalidParameter(format!(
                        "{} is not a host address of {}",
                        address, network.address
                    )));
                }
                if network.is_address_taken(address) {
                    return Err(PlatformError::duplicate(ResourceKind::VIface, address.to_string()));
                }
                address
            }
            None => network.next_free_address().ok_or_else(|| {
                PlatformError::CapacityExceeded(format!("No free address left in {}", vnetwork))
            })?,
        };

        network.members.insert(
            vnode.to_string(),
            NetworkMember {
                iface: iface.to_string(),
                address,
            },
        );

        let viface = self.get_viface_mut(vnode, iface)?;
        viface.vnetwork = Some(vnetwork.to_string());
        viface.address = Some(address);

        info!("Attached {}.{} to {} as {}", vnode, iface, vnetwork, address);
        Ok(address)
    }

    /// Detach an interface from its network; returns the network it left
    pub fn detach_viface(&mut self, vnode: &str, iface: &str) -> Result<Option<String>> {
        let viface = self.get_viface_mut(vnode, iface)?;
        let left = viface.vnetwork.clone();
        viface.detach();

        if let Some(name) = &left {
            if let Some(network) = self.vnetworks.get_mut(name) {
                network.members.remove(vnode);
            }
            debug!("Detached {}.{} from {}", vnode, iface, name);
        }
        Ok(left)
    }

    // ---- networks ----

    pub fn add_vnetwork(&mut self, vnetwork: VNetwork) -> Result<()> {
        if self.vnetworks.contains_key(&vnetwork.name) {
            return Err(PlatformError::duplicate(ResourceKind::VNetwork, &vnetwork.name));
        }
        let overlap = self.vnetworks.values().find(|n| {
            n.address.contains(vnetwork.address.network())
                || vnetwork.address.contains(n.address.network())
        });
        if let Some(overlap) = overlap {
            return Err(PlatformError::InvalidParameter(format!(
                "{} ({}) overlaps {} ({})",
                vnetwork.name, vnetwork.address, overlap.name, overlap.address
            )));
        }
        debug!("Registering vnetwork {} ({})", vnetwork.name, vnetwork.address);
        self.vnetworks.insert(vnetwork.name.clone(), vnetwork);
        Ok(())
    }

    pub fn get_vnetwork(&self, name: &str) -> Option<&VNetwork> {
        self.vnetworks.get(name)
    }

    pub fn vnetworks(&self) -> impl Iterator<Item = &VNetwork> {
        self.vnetworks.values()
    }

    /// Unregister a network, detaching every member and dropping the
    /// routes that reference it
    pub fn remove_vnetwork(&mut self, name: &str) -> Result<VNetworkRemoval> {
        let mut vnetwork = self
            .vnetworks
            .remove(name)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VNetwork, name))?;

        let members: Vec<(String, String)> = vnetwork
            .members
            .iter()
            .map(|(node, member)| (node.clone(), member.iface.clone()))
            .collect();

        for (node, iface) in &members {
            if let Some(viface) = self
                .vnodes
                .get_mut(node)
                .and_then(|n| n.get_viface_mut(iface))
            {
                viface.detach();
            }
        }
        vnetwork.members.clear();

        let (vroutes, kept): (Vec<VRoute>, Vec<VRoute>) = std::mem::take(&mut self.vroutes)
            .into_iter()
            .partition(|r| r.references_network(name));
        self.vroutes = kept;
        for route in &vroutes {
            self.refresh_gateway(&route.gateway);
        }
        // Members may have lost their only routed network
        for (node, _) in &members {
            self.refresh_gateway(node);
        }

        debug!("Unregistered vnetwork {} ({} members)", name, members.len());
        Ok(VNetworkRemoval {
            vnetwork,
            members,
            vroutes,
        })
    }

    // ---- routes ----

    /// Register a route after checking its topology
    pub fn add_vroute(&mut self, vroute: VRoute) -> Result<()> {
        if vroute.source == vroute.destination {
            return Err(PlatformError::InvalidParameter(format!(
                "Route source and destination are both {}",
                vroute.source
            )));
        }
        for network in [&vroute.source, &vroute.destination] {
            if !self.vnetworks.contains_key(network) {
                return Err(PlatformError::not_found(ResourceKind::VNetwork, network));
            }
        }
        let gateway = self.vnode(&vroute.gateway)?;
        for network in [&vroute.source, &vroute.destination] {
            if gateway.viface_on(network).is_none() {
                return Err(PlatformError::InvalidParameter(format!(
                    "Gateway {} is not attached to {}",
                    vroute.gateway, network
                )));
            }
        }
        if self.get_vroute(&vroute.source, &vroute.destination).is_some() {
            return Err(PlatformError::duplicate(
                ResourceKind::VRoute,
                format!("{} -> {}", vroute.source, vroute.destination),
            ));
        }

        if let Some(node) = self.vnodes.get_mut(&vroute.gateway) {
            node.gateway = true;
        }
        info!("Adding route {}", vroute);
        self.vroutes.push(vroute);
        Ok(())
    }

    pub fn get_vroute(&self, source: &str, destination: &str) -> Option<&VRoute> {
        self.vroutes
            .iter()
            .find(|r| r.source == source && r.destination == destination)
    }

    pub fn vroutes(&self) -> &[VRoute] {
        &self.vroutes
    }

    /// Unregister a route; the gateway leaves gateway mode when it no
    /// longer forwards for any route
    pub fn remove_vroute(&mut self, vroute: &VRoute) -> Result<VRoute> {
        let index = self
            .vroutes
            .iter()
            .position(|r| r == vroute)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VRoute, vroute.to_string()))?;
        let removed = self.vroutes.remove(index);
        self.refresh_gateway(&removed.gateway);
        info!("Removed route {}", removed);
        Ok(removed)
    }

    fn refresh_gateway(&mut self, vnode: &str) {
        let still_gateway = self.vroutes.iter().any(|r| r.gateway == vnode);
        if let Some(node) = self.vnodes.get_mut(vnode) {
            node.gateway = still_gateway;
        }
    }
}
