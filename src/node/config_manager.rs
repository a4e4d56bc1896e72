// src/node/config_manager.rs
//! Configuration manager for the virtual platform
//!
//! The single writer of the platform graph. Every lifecycle operation
//! validates against the graph, mutates it, and drives the container,
//! shell and limiter collaborators to realize the change on the host.
//!
//! # Architecture
//!
//! ```text
//! ConfigManager
//! ├─ PNode          (this host: address, cores, bootstrap status)
//! ├─ VPlatform      (vnodes, vnetworks, vroutes)
//! ├─ Containers     (vnode name -> bound container)
//! └─ Collaborators  (shell, filesystem, container factory, limiter)
//!           │
//!           └─ batch operations fan out through a SlidingWindow
//!              (pool_size workers, optional semaphore gate)
//! ```
//!
//! Mutating calls are not internally synchronized: callers serialize
//! operations on the same resource.

use crate::observability::METRIC_VNODES;
use crate::resource::pnode::{default_address, PNode, PNodeStatus};
use crate::resource::viface::VIface;
use crate::resource::vnetwork::VNetwork;
use crate::resource::vnode::{VCore, VCpu, VNode, VNodeSpec, VNodeStatus};
use crate::resource::vplatform::{VNetworkRemoval, VPlatform};
use crate::resource::vroute::VRoute;
use crate::resource::Resource;
use crate::runtime::bootstrap::NodeBootstrap;
use crate::runtime::container::{Container, ContainerFactory, ContainerState, LxcContainerFactory};
use crate::runtime::filesystem::{FilesystemProvider, LocalFileManager};
use crate::runtime::limitation::{Limitation, NetworkLimiter, TrafficShaper};
use crate::runtime::shell::{Shell, ShellOutput, SystemShell};
use crate::sync::semaphore::Semaphore;
use crate::sync::sliding_window::{SlidingWindow, TaskResult, TaskStatus, WorkItem};
use crate::utils::config::PlatformConfig;
use crate::utils::errors::{PlatformError, ResourceKind, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External collaborators used by the manager
#[derive(Clone)]
pub struct Collaborators {
    pub shell: Arc<dyn Shell>,
    pub filesystem: Arc<dyn FilesystemProvider>,
    pub containers: Arc<dyn ContainerFactory>,
    pub limiter: Arc<dyn NetworkLimiter>,
}

impl Collaborators {
    /// Default Linux collaborators rooted at the configured directories
    pub fn system(config: &PlatformConfig) -> Self {
        let shell: Arc<dyn Shell> = Arc::new(SystemShell::new());
        Self {
            filesystem: Arc::new(LocalFileManager::new(
                config.node.cache_dir.clone(),
                Arc::clone(&shell),
            )),
            containers: Arc::new(LxcContainerFactory::new(
                config.node.container_dir.clone(),
                Arc::clone(&shell),
            )),
            limiter: Arc::new(TrafficShaper::new(Arc::clone(&shell))),
            shell,
        }
    }
}

/// Orchestrator owning the platform graph
pub struct ConfigManager {
    config: PlatformConfig,
    pnode: PNode,
    vplatform: VPlatform,

    /// Container bound to each virtual node
    containers: HashMap<String, Arc<dyn Container>>,

    shell: Arc<dyn Shell>,
    filesystem: Arc<dyn FilesystemProvider>,
    container_factory: Arc<dyn ContainerFactory>,
    limiter: Arc<dyn NetworkLimiter>,

    /// Cap on simultaneous batch items beneath the pool size
    gate: Option<Arc<Semaphore>>,
}

impl ConfigManager {
    /// Create a manager, first stopping `orphans` left by a previous run
    pub fn new(config: PlatformConfig, collaborators: Collaborators, orphans: &[String]) -> Result<Self> {
        config.validate()?;

        let address = match &config.node.address {
            Some(address) => address.clone(),
            None => default_address().to_string(),
        };
        let pnode = PNode::new(address, config.node.core_count())
            .with_credentials(config.node.ssh_user.clone(), config.node.ssh_key.clone());

        if !orphans.is_empty() {
            info!("Stopping {} leftover containers", orphans.len());
        }
        collaborators.containers.stop_all(orphans)?;

        let gate = config
            .runtime
            .max_parallel_commands
            .map(|n| Arc::new(Semaphore::named("batch_gate", n)));

        info!(
            "Config manager ready on {} ({} cores)",
            pnode.address,
            pnode.cpu.cores.len()
        );

        Ok(Self {
            config,
            pnode,
            vplatform: VPlatform::new(),
            containers: HashMap::new(),
            shell: collaborators.shell,
            filesystem: collaborators.filesystem,
            container_factory: collaborators.containers,
            limiter: collaborators.limiter,
            gate,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn pnode(&self) -> &PNode {
        &self.pnode
    }

    pub fn vplatform(&self) -> &VPlatform {
        &self.vplatform
    }

    pub fn get_vnode(&self, name: &str) -> Option<&VNode> {
        self.vplatform.get_vnode(name)
    }

    pub fn get_container(&self, name: &str) -> Option<Arc<dyn Container>> {
        self.containers.get(name).cloned()
    }

    fn container(&self, name: &str) -> Result<Arc<dyn Container>> {
        self.get_container(name)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::Container, name))
    }

    fn record_vnode_count(&self) {
        metrics::gauge!(METRIC_VNODES).set(self.vplatform.vnode_count() as f64);
    }

    // ---- physical node ----

    /// Launch the daemon on this node; only the first call does anything
    pub fn pnode_init(&mut self, bootstrap: &dyn NodeBootstrap) -> Result<()> {
        if self.pnode.status == PNodeStatus::Running {
            debug!("Physical node {} already running", self.pnode.address);
            return Ok(());
        }
        bootstrap.bootstrap(&self.pnode)?;
        self.pnode.status = PNodeStatus::Running;
        info!("Physical node {} running", self.pnode.address);
        Ok(())
    }

    // ---- virtual nodes ----

    /// Provision a node's filesystem, bind a container and register it
    pub fn vnode_add(&mut self, spec: VNodeSpec) -> Result<&VNode> {
        if !is_valid_vnode_name(&spec.name) {
            return Err(PlatformError::InvalidParameter(format!(
                "Invalid vnode name '{}'",
                spec.name
            )));
        }
        if self.vplatform.has_vnode(&spec.name) {
            return Err(PlatformError::duplicate(ResourceKind::VNode, &spec.name));
        }

        info!("Adding vnode {} from {}", spec.name, spec.image);
        let archive = self.filesystem.download(&spec.image)?;
        let rootfs = self
            .filesystem
            .extract(&archive, &self.config.node.rootfs_dir.join(&spec.name))?;

        let name = spec.name.clone();
        let vnode = spec.resolve(rootfs);
        let container = match self.container_factory.create(&vnode) {
            Ok(container) => container,
            Err(e) => {
                if let Err(cleanup) = self.filesystem.remove(&vnode.filesystem.path) {
                    warn!("Failed to remove rootfs of {}: {}", name, cleanup);
                }
                return Err(e);
            }
        };

        self.vplatform.add_vnode(vnode)?;
        self.containers.insert(name.clone(), container);
        self.record_vnode_count();

        self.vplatform.vnode(&name)
    }

    /// Unregister a node and destroy its container
    ///
    /// Removing an absent node, or one without a container, is not an error.
    pub fn vnode_remove(&mut self, name: &str) -> Result<()> {
        match self.vplatform.get_vnode(name) {
            Some(vnode) => {
                for iface in vnode.vifaces.iter().filter(|i| i.limited) {
                    if let Err(e) = self.limiter.clear(iface) {
                        warn!("Failed to clear limitation on {}.{}: {}", name, iface.name, e);
                    }
                }
                self.vplatform.remove_vnode(name)?;
                self.pnode.cpu.release(name);
                info!("Removed vnode {}", name);
            }
            None => debug!("Vnode {} not registered", name),
        }

        let result = match self.containers.remove(name) {
            Some(container) => container.destroy(),
            None => Ok(()),
        };
        self.record_vnode_count();
        result
    }

    /// Configure then start the node's container
    ///
    /// Starting a node that is already running does nothing.
    pub fn vnode_start(&mut self, name: &str) -> Result<()> {
        let vnode = self.vplatform.vnode(name)?;
        let container = self.container(name)?;

        if container.state() == ContainerState::Running {
            info!("Vnode {} already running", name);
            return Ok(());
        }

        container.configure(vnode)?;
        container.start()?;

        if let Some(vnode) = self.vplatform.get_vnode_mut(name) {
            vnode.status = VNodeStatus::Running;
        }
        info!("Started vnode {}", name);

        if self.config.runtime.limit_on_start {
            self.vnode_limit(name)?;
        }
        Ok(())
    }

    /// Re-apply the node's setup to its container without restarting it
    pub fn vnode_reconfigure(&mut self, name: &str) -> Result<()> {
        let vnode = self.vplatform.vnode(name)?;
        self.container(name)?.reconfigure(vnode)?;
        debug!("Reconfigured vnode {}", name);
        Ok(())
    }

    pub fn vnode_stop(&mut self, name: &str) -> Result<()> {
        self.vplatform.vnode(name)?;
        self.container(name)?.stop()?;

        if let Some(vnode) = self.vplatform.get_vnode_mut(name) {
            vnode.status = VNodeStatus::Stopped;
        }
        info!("Stopped vnode {}", name);
        Ok(())
    }

    /// Run a command inside a node
    pub fn vnode_execute(&self, name: &str, command: &str) -> Result<ShellOutput> {
        self.vplatform.vnode(name)?;
        self.container(name)?.execute(command)
    }

    /// Start many nodes in parallel; results are keyed by node name
    pub fn vnodes_start(&mut self, names: &[String]) -> HashMap<String, TaskResult> {
        let results = self.run_batch(names, |vnode, container| {
            if container.state() == ContainerState::Running {
                return Ok(());
            }
            container.configure(&vnode)?;
            container.start()
        });
        self.mark_status(&results, VNodeStatus::Running);

        if self.config.runtime.limit_on_start {
            for (name, result) in &results {
                if result.is_success() {
                    if let Err(e) = self.vnode_limit(name) {
                        warn!("Failed to limit {}: {}", name, e);
                    }
                }
            }
        }
        results
    }

    /// Stop many nodes in parallel; results are keyed by node name
    pub fn vnodes_stop(&mut self, names: &[String]) -> HashMap<String, TaskResult> {
        let results = self.run_batch(names, |_vnode, container| container.stop());
        self.mark_status(&results, VNodeStatus::Stopped);
        results
    }

    fn run_batch<F>(&self, names: &[String], op: F) -> HashMap<String, TaskResult>
    where
        F: Fn(VNode, Arc<dyn Container>) -> Result<()> + Send + Sync + Clone + 'static,
    {
        let mut window = SlidingWindow::new(self.config.runtime.pool_size);
        if let Some(gate) = &self.gate {
            window = window.with_gate(Arc::clone(gate));
        }

        let mut rejected = HashMap::new();
        let mut queued = HashSet::new();
        for name in names {
            // One item per node, or two workers would race on its container
            if !queued.insert(name.as_str()) {
                continue;
            }
            let target = self
                .vplatform
                .vnode(name)
                .cloned()
                .and_then(|vnode| Ok((vnode, self.container(name)?)));

            match target {
                Ok((vnode, container)) => {
                    let op = op.clone();
                    window.add(WorkItem::call(move || op(vnode, container)), Some(name.clone()));
                }
                Err(e) => {
                    rejected.insert(
                        name.clone(),
                        TaskResult {
                            status: TaskStatus::Failed,
                            output: None,
                            error: Some(e.to_string()),
                        },
                    );
                }
            }
        }

        window.run();
        let mut results = window.results();
        results.extend(rejected);
        results
    }

    fn mark_status(&mut self, results: &HashMap<String, TaskResult>, status: VNodeStatus) {
        for (name, result) in results {
            if result.is_success() {
                if let Some(vnode) = self.vplatform.get_vnode_mut(name) {
                    vnode.status = status;
                }
            } else {
                warn!("Batch operation on {} failed: {:?}", name, result.error);
            }
        }
    }

    // ---- CPU ----

    /// Give a node `count` virtual cores
    ///
    /// Linked cores are pinned one-to-one on free physical cores; floating
    /// cores may run anywhere on the host.
    pub fn vcpu_attach(&mut self, name: &str, count: usize, linked: bool) -> Result<()> {
        let vnode = self.vplatform.vnode(name)?;
        if vnode.vcpu.is_some() {
            return Err(PlatformError::InvalidState(format!(
                "{} already has a virtual CPU",
                name
            )));
        }
        if count == 0 {
            return Err(PlatformError::InvalidParameter(
                "A virtual CPU needs at least one core".to_string(),
            ));
        }

        let cores: Vec<VCore> = if linked {
            self.pnode
                .cpu
                .allocate(name, count)?
                .into_iter()
                .enumerate()
                .map(|(id, pcore)| VCore {
                    id,
                    pcore: Some(pcore),
                })
                .collect()
        } else {
            let available = self.pnode.cpu.cores.len();
            if count > available {
                return Err(PlatformError::CapacityExceeded(format!(
                    "{} virtual cores requested, host has {}",
                    count, available
                )));
            }
            (0..count).map(|id| VCore { id, pcore: None }).collect()
        };

        if let Some(vnode) = self.vplatform.get_vnode_mut(name) {
            vnode.vcpu = Some(VCpu { cores, linked });
        }
        info!("Attached {} {} cores to {}", count, if linked { "linked" } else { "floating" }, name);
        Ok(())
    }

    pub fn vcpu_detach(&mut self, name: &str) -> Result<()> {
        let vnode = self
            .vplatform
            .get_vnode_mut(name)
            .ok_or_else(|| PlatformError::not_found(ResourceKind::VNode, name))?;
        vnode.vcpu = None;
        let freed = self.pnode.cpu.release(name);
        debug!("Detached vcpu from {} ({} physical cores freed)", name, freed);
        Ok(())
    }

    // ---- interfaces ----

    /// Bring up the host-side device backing `iface`
    pub fn viface_add(&self, iface: &VIface) -> Result<()> {
        if iface.id >= self.config.node.max_ifaces {
            return Err(PlatformError::CapacityExceeded(format!(
                "Maximum number of interfaces ({}) reached",
                self.config.node.max_ifaces
            )));
        }
        self.shell
            .run(&format!("ip link set dev {} up", iface.device()))?;
        Ok(())
    }

    /// Create an interface on a node with the lowest free id
    pub fn viface_create(&mut self, vnode: &str, iface: &str) -> Result<u32> {
        let node = self.vplatform.vnode(vnode)?;
        if node.get_viface(iface).is_some() {
            return Err(PlatformError::duplicate(
                ResourceKind::VIface,
                format!("{}.{}", vnode, iface),
            ));
        }

        let max = self.config.node.max_ifaces;
        let id = (0..max)
            .find(|id| !self.vplatform.is_viface_id_used(*id))
            .unwrap_or(max);

        let viface = VIface::new(id, iface);
        self.viface_add(&viface)?;
        self.vplatform.add_viface(vnode, viface)?;
        info!("Created interface {}.{} (id {})", vnode, iface, id);
        Ok(id)
    }

    /// Attach an interface to a network, allocating an address if needed
    pub fn viface_attach(
        &mut self,
        vnode: &str,
        iface: &str,
        vnetwork: &str,
        address: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        self.vplatform.attach_viface(vnode, iface, vnetwork, address)
    }

    /// Detach an interface from its network and drop its shaping
    pub fn viface_detach(&mut self, vnode: &str, iface: &str) -> Result<()> {
        let viface = self.vplatform.get_viface(vnode, iface)?;
        if viface.limited {
            self.limiter.clear(viface)?;
        }
        self.vplatform.detach_viface(vnode, iface)?;
        Ok(())
    }

    /// Detach an interface, take its device down and unregister it
    pub fn viface_remove(&mut self, vnode: &str, iface: &str) -> Result<VIface> {
        self.viface_detach(vnode, iface)?;
        let removed = self.vplatform.remove_viface(vnode, iface)?;

        let output = self
            .shell
            .execute(&format!("ip link set dev {} down", removed.device()))?;
        if !output.success() {
            debug!("Device {} already down", removed.device());
        }
        info!("Removed interface {}.{}", vnode, iface);
        Ok(removed)
    }

    /// Record the shaping to install on an interface
    pub fn viface_limit(&mut self, vnode: &str, iface: &str, limitation: Limitation) -> Result<()> {
        limitation.validate()?;
        let viface = self.vplatform.get_viface_mut(vnode, iface)?;
        if viface.limited {
            return Err(PlatformError::InvalidState(format!(
                "{}.{} is already limited; detach it first",
                vnode, iface
            )));
        }
        viface.limitation = Some(limitation);
        Ok(())
    }

    /// Install shaping on every attached, not yet limited interface of a
    /// node that has a limitation; returns how many were limited
    pub fn vnode_limit(&mut self, name: &str) -> Result<usize> {
        let pending: Vec<String> = self
            .vplatform
            .vnode(name)?
            .vifaces
            .iter()
            .filter(|i| i.is_attached() && !i.limited && i.limitation.is_some())
            .map(|i| i.name.clone())
            .collect();

        for iface in &pending {
            self.limiter.apply(self.vplatform.get_viface(name, iface)?)?;
            self.vplatform.get_viface_mut(name, iface)?.limited = true;
        }

        if !pending.is_empty() {
            info!("Limited {} interfaces on {}", pending.len(), name);
        }
        Ok(pending.len())
    }

    // ---- networks ----

    pub fn vnetwork_add(&mut self, vnetwork: VNetwork) -> Result<()> {
        info!("Adding vnetwork {} ({})", vnetwork.name, vnetwork.address);
        self.vplatform.add_vnetwork(vnetwork)
    }

    /// Remove a network, returning what was attached to it
    pub fn vnetwork_remove(&mut self, name: &str) -> Result<VNetworkRemoval> {
        let limited: Vec<VIface> = self
            .vplatform
            .vifaces()
            .filter(|(_, i)| i.limited && i.vnetwork.as_deref() == Some(name))
            .map(|(_, i)| i.clone())
            .collect();
        for iface in &limited {
            if let Err(e) = self.limiter.clear(iface) {
                warn!("Failed to clear limitation on {}: {}", iface.name, e);
            }
        }

        let removal = self.vplatform.remove_vnetwork(name)?;
        info!(
            "Removed vnetwork {} ({} members, {} routes)",
            name,
            removal.members.len(),
            removal.vroutes.len()
        );
        Ok(removal)
    }

    // ---- routes ----

    pub fn vroute_add(&mut self, vroute: VRoute) -> Result<()> {
        self.vplatform.add_vroute(vroute)
    }

    pub fn vroute_remove(&mut self, vroute: &VRoute) -> Result<VRoute> {
        self.vplatform.remove_vroute(vroute)
    }

    /// Add a route between every pair of networks that share a node
    ///
    /// The first node by name attached to both networks becomes the
    /// gateway. Pairs that already have a route are left alone.
    pub fn vroute_complete(&mut self) -> Result<Vec<VRoute>> {
        let networks: Vec<String> = self.vplatform.vnetworks().map(|n| n.name.clone()).collect();

        let mut candidates = Vec::new();
        for source in &networks {
            for destination in &networks {
                if source == destination
                    || self.vplatform.get_vroute(source, destination).is_some()
                {
                    continue;
                }
                let gateway = self
                    .vplatform
                    .vnodes()
                    .find(|n| n.viface_on(source).is_some() && n.viface_on(destination).is_some());
                if let Some(gateway) = gateway {
                    candidates.push(VRoute::new(source.as_str(), destination.as_str(), gateway.name.as_str()));
                }
            }
        }

        for route in &candidates {
            self.vplatform.add_vroute(route.clone())?;
        }
        info!("Route completion added {} routes", candidates.len());
        Ok(candidates)
    }

    // ---- generic ----

    /// Remove any resource through its kind-specific operation
    pub fn destroy(&mut self, resource: Resource) -> Result<()> {
        match resource {
            Resource::VNode(name) => self.vnode_remove(&name),
            Resource::VNetwork(name) => self.vnetwork_remove(&name).map(|_| ()),
            Resource::VRoute(route) => self.vroute_remove(&route).map(|_| ()),
            Resource::PNode(address) => {
                debug!("Ignoring destroy of physical node {}", address);
                Ok(())
            }
        }
    }

    /// Destroy every route, network and node; the first error is returned
    /// after everything has been attempted
    pub fn teardown(&mut self) -> Result<()> {
        let mut resources: Vec<Resource> = self
            .vplatform
            .vroutes()
            .iter()
            .cloned()
            .map(Resource::VRoute)
            .collect();
        resources.extend(self.vplatform.vnetworks().map(|n| Resource::VNetwork(n.name.clone())));
        resources.extend(self.vplatform.vnodes().map(|n| Resource::VNode(n.name.clone())));

        info!("Tearing down {} resources", resources.len());
        let mut first_error = None;
        for resource in resources {
            let kind = resource.kind();
            if let Err(e) = self.destroy(resource) {
                // Routes vanish with their networks; that is expected
                if kind == ResourceKind::VRoute && e.is_not_found() {
                    continue;
                }
                warn!("Teardown of {} failed: {}", kind, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- reporting ----

    pub fn vnode_info(&self, name: &str) -> Result<Value> {
        Ok(serde_json::to_value(self.vplatform.vnode(name)?)?)
    }

    /// Every node, keyed by name
    pub fn vnodes_info(&self) -> Result<Value> {
        let mut map = Map::new();
        for vnode in self.vplatform.vnodes() {
            map.insert(vnode.name.clone(), serde_json::to_value(vnode)?);
        }
        Ok(Value::Object(map))
    }

    pub fn pnode_info(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.pnode)?)
    }
}

/// A node name must be a single plain path component, since it names the
/// node's rootfs directory
fn is_valid_vnode_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{
        CountingBootstrap, FakeContainerFactory, FakeFilesystem, RecordingShell,
    };
    use std::sync::atomic::Ordering;

    struct Harness {
        manager: ConfigManager,
        shell: Arc<RecordingShell>,
        filesystem: Arc<FakeFilesystem>,
        factory: Arc<FakeContainerFactory>,
    }

    fn harness_with(config: PlatformConfig) -> Harness {
        let shell = RecordingShell::new();
        let filesystem = FakeFilesystem::new();
        let factory = FakeContainerFactory::new();
        let collaborators = Collaborators {
            shell: shell.clone(),
            filesystem: filesystem.clone(),
            containers: factory.clone(),
            limiter: Arc::new(TrafficShaper::new(shell.clone())),
        };
        let manager = ConfigManager::new(config, collaborators, &[]).unwrap();
        Harness {
            manager,
            shell,
            filesystem,
            factory,
        }
    }

    fn harness() -> Harness {
        let mut config = PlatformConfig::default();
        config.node.address = Some("10.1.1.1".to_string());
        config.node.physical_cores = Some(4);
        config.node.max_ifaces = 8;
        config.runtime.pool_size = 4;
        harness_with(config)
    }

    fn spec(name: &str) -> VNodeSpec {
        VNodeSpec::new(name, "rootfs.tar.gz")
    }

    /// Two networks, two nodes on net-a, "gw" on both
    fn topology(h: &mut Harness) {
        let m = &mut h.manager;
        m.vnetwork_add(VNetwork::parse("net-a", "10.0.8.0/24").unwrap()).unwrap();
        m.vnetwork_add(VNetwork::parse("net-b", "10.0.9.0/24").unwrap()).unwrap();
        for name in ["n1", "n2", "gw"] {
            m.vnode_add(spec(name)).unwrap();
            m.viface_create(name, "if0").unwrap();
            m.viface_attach(name, "if0", "net-a", None).unwrap();
        }
        m.viface_create("gw", "if1").unwrap();
        m.viface_attach("gw", "if1", "net-b", None).unwrap();
    }

    #[test]
    fn test_new_stops_orphans_once() {
        let factory = FakeContainerFactory::new();
        let shell = RecordingShell::new();
        let collaborators = Collaborators {
            shell: shell.clone(),
            filesystem: FakeFilesystem::new(),
            containers: factory.clone(),
            limiter: Arc::new(TrafficShaper::new(shell)),
        };
        let orphans = vec!["old1".to_string(), "old2".to_string()];
        let mut config = PlatformConfig::default();
        config.node.address = Some("10.1.1.1".to_string());

        let manager = ConfigManager::new(config, collaborators, &orphans).unwrap();
        assert_eq!(*factory.stopped_orphans.lock(), orphans);
        assert_eq!(manager.pnode().address, "10.1.1.1");
        assert_eq!(manager.pnode().status, PNodeStatus::Init);
    }

    #[test]
    fn test_pnode_init_runs_once() {
        let mut h = harness();
        let bootstrap = CountingBootstrap::default();

        h.manager.pnode_init(&bootstrap).unwrap();
        h.manager.pnode_init(&bootstrap).unwrap();

        assert_eq!(bootstrap.calls.load(Ordering::SeqCst), 1);
        assert!(h.manager.pnode().is_running());
    }

    #[test]
    fn test_vnode_add_binds_container() {
        let mut h = harness();
        let vnode = h.manager.vnode_add(spec("n1")).unwrap();

        assert_eq!(vnode.filesystem.path, std::path::PathBuf::from("/tmp/rootfs/n1"));
        assert_eq!(vnode.status, VNodeStatus::Created);
        assert!(h.manager.get_container("n1").is_some());
        assert_eq!(h.factory.created_for("n1").len(), 1);
    }

    #[test]
    fn test_vnode_add_duplicate_leaves_graph_unchanged() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();

        let err = h.manager.vnode_add(spec("n1")).unwrap_err();
        assert!(matches!(
            err,
            PlatformError::DuplicateResource {
                kind: ResourceKind::VNode,
                ..
            }
        ));
        assert_eq!(h.manager.vplatform().vnode_count(), 1);
        assert_eq!(h.factory.created.lock().len(), 1);
        assert_eq!(h.filesystem.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_vnode_add_unavailable_image_registers_nothing() {
        let mut h = harness();
        h.filesystem.make_unavailable("broken.tar");

        let err = h
            .manager
            .vnode_add(VNodeSpec::new("n1", "broken.tar"))
            .unwrap_err();
        assert!(matches!(err, PlatformError::UnavailableDependency(_)));
        assert!(h.manager.get_vnode("n1").is_none());
        assert!(h.manager.get_container("n1").is_none());
        assert!(h.factory.created.lock().is_empty());
    }

    #[test]
    fn test_vnode_add_rejects_bad_names() {
        let mut h = harness();
        for name in ["", ".", "..", "../etc", "a/b", "n1/", "./n1"] {
            let err = h.manager.vnode_add(spec(name)).unwrap_err();
            assert!(
                matches!(err, PlatformError::InvalidParameter(_)),
                "{:?} was accepted",
                name
            );
        }
        assert_eq!(h.manager.vplatform().vnode_count(), 0);
        assert_eq!(h.filesystem.downloads.load(Ordering::SeqCst), 0);

        h.manager.vnode_add(spec("n1.local")).unwrap();
    }

    #[test]
    fn test_vnode_add_container_failure_removes_rootfs() {
        let mut h = harness();
        h.factory.refuse("n1");

        assert!(h.manager.vnode_add(spec("n1")).is_err());
        assert!(h.manager.get_vnode("n1").is_none());
        assert!(h.manager.get_container("n1").is_none());
        assert_eq!(
            *h.filesystem.removed.lock(),
            vec![std::path::PathBuf::from("/tmp/rootfs/n1")]
        );
    }

    #[test]
    fn test_vnode_remove_is_idempotent() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();
        let container = h.factory.created_for("n1").remove(0);

        h.manager.vnode_remove("n1").unwrap();
        assert!(h.manager.get_vnode("n1").is_none());
        assert!(h.manager.get_container("n1").is_none());
        assert_eq!(container.state(), ContainerState::Destroyed);

        // Already gone: still fine
        h.manager.vnode_remove("n1").unwrap();
        h.manager.vnode_remove("never-existed").unwrap();
    }

    #[test]
    fn test_start_twice_keeps_single_container() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();

        h.manager.vnode_start("n1").unwrap();
        h.manager.vnode_start("n1").unwrap();

        let created = h.factory.created_for("n1");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].state(), ContainerState::Running);
        assert_eq!(*created[0].calls.lock(), vec!["configure", "start"]);
        assert!(h.manager.get_vnode("n1").unwrap().is_running());
    }

    #[test]
    fn test_start_stop_restart() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();

        h.manager.vnode_start("n1").unwrap();
        h.manager.vnode_stop("n1").unwrap();
        assert_eq!(h.manager.get_vnode("n1").unwrap().status, VNodeStatus::Stopped);

        h.manager.vnode_start("n1").unwrap();
        let container = h.factory.created_for("n1").remove(0);
        assert_eq!(
            *container.calls.lock(),
            vec!["configure", "start", "stop", "configure", "start"]
        );
    }

    #[test]
    fn test_operations_on_unknown_vnode() {
        let mut h = harness();
        assert!(h.manager.vnode_start("ghost").unwrap_err().is_not_found());
        assert!(h.manager.vnode_stop("ghost").unwrap_err().is_not_found());
        assert!(h.manager.vnode_reconfigure("ghost").unwrap_err().is_not_found());
        assert!(h.manager.vnode_execute("ghost", "ls").unwrap_err().is_not_found());
    }

    #[test]
    fn test_reconfigure_and_execute() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();
        h.manager.vnode_start("n1").unwrap();
        h.manager.vnode_reconfigure("n1").unwrap();

        let output = h.manager.vnode_execute("n1", "hostname").unwrap();
        assert_eq!(output.stdout, "ran hostname");

        let container = h.factory.created_for("n1").remove(0);
        assert!(container.calls.lock().contains(&"reconfigure".to_string()));
    }

    #[test]
    fn test_viface_add_rejects_id_at_capacity() {
        let h = harness();
        let iface = VIface::new(8, "if0");

        let err = h.manager.viface_add(&iface).unwrap_err();
        assert!(matches!(err, PlatformError::CapacityExceeded(_)));
        assert!(h.shell.commands().is_empty());

        h.manager.viface_add(&VIface::new(7, "if0")).unwrap();
        assert_eq!(h.shell.commands(), vec!["ip link set dev ifb7 up".to_string()]);
    }

    #[test]
    fn test_viface_create_allocates_ids_until_capacity() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();

        for i in 0..8 {
            assert_eq!(h.manager.viface_create("n1", &format!("if{}", i)).unwrap(), i);
        }
        let err = h.manager.viface_create("n1", "if8").unwrap_err();
        assert!(matches!(err, PlatformError::CapacityExceeded(_)));
        assert!(h.manager.viface_create("n1", "if0").is_err());

        // Freed ids are reused
        h.manager.viface_remove("n1", "if3").unwrap();
        assert_eq!(h.manager.viface_create("n1", "if3b").unwrap(), 3);
    }

    #[test]
    fn test_limitation_applied_once() {
        let mut h = harness();
        topology(&mut h);
        h.manager
            .viface_limit("n1", "if0", Limitation::default().with_bandwidth(1024))
            .unwrap();

        assert_eq!(h.manager.vnode_limit("n1").unwrap(), 1);
        assert_eq!(h.manager.vnode_limit("n1").unwrap(), 0);

        let tc: Vec<_> = h
            .shell
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("tc qdisc replace"))
            .collect();
        assert_eq!(tc.len(), 1);
        assert!(h.manager.vplatform().get_viface("n1", "if0").unwrap().limited);

        // Cannot change shaping while limited
        assert!(h
            .manager
            .viface_limit("n1", "if0", Limitation::default().with_latency(5))
            .is_err());

        // Detach resets the flag, reattach allows a new limitation
        h.manager.viface_detach("n1", "if0").unwrap();
        assert!(!h.manager.vplatform().get_viface("n1", "if0").unwrap().limited);
        h.manager.viface_attach("n1", "if0", "net-a", None).unwrap();
        assert_eq!(h.manager.vnode_limit("n1").unwrap(), 1);
    }

    #[test]
    fn test_limit_on_start() {
        let mut config = PlatformConfig::default();
        config.node.address = Some("10.1.1.1".to_string());
        config.runtime.limit_on_start = true;
        let mut h = harness_with(config);
        topology(&mut h);
        h.manager
            .viface_limit("n2", "if0", Limitation::default().with_latency(10))
            .unwrap();

        h.manager.vnode_start("n2").unwrap();
        assert!(h.manager.vplatform().get_viface("n2", "if0").unwrap().limited);
    }

    #[test]
    fn test_self_route_rejected() {
        let mut h = harness();
        topology(&mut h);

        let err = h
            .manager
            .vroute_add(VRoute::new("net-a", "net-a", "n1"))
            .unwrap_err();
        assert!(matches!(err, PlatformError::InvalidParameter(_)));
        assert!(h.manager.vplatform().vroutes().is_empty());
        assert!(!h.manager.get_vnode("n1").unwrap().gateway);
    }

    #[test]
    fn test_route_through_gateway() {
        let mut h = harness();
        topology(&mut h);

        let route = VRoute::new("net-a", "net-b", "gw");
        h.manager.vroute_add(route.clone()).unwrap();
        assert!(h.manager.get_vnode("gw").unwrap().gateway);

        // n1 is not on net-b
        assert!(h.manager.vroute_add(VRoute::new("net-b", "net-a", "n1")).is_err());

        h.manager.destroy(Resource::VRoute(route)).unwrap();
        assert!(!h.manager.get_vnode("gw").unwrap().gateway);
    }

    #[test]
    fn test_vroute_complete() {
        let mut h = harness();
        topology(&mut h);
        h.manager.vroute_add(VRoute::new("net-a", "net-b", "gw")).unwrap();

        let added = h.manager.vroute_complete().unwrap();
        assert_eq!(added, vec![VRoute::new("net-b", "net-a", "gw")]);
        assert_eq!(h.manager.vplatform().vroutes().len(), 2);
        assert!(h.manager.vroute_complete().unwrap().is_empty());
    }

    #[test]
    fn test_vnetwork_remove_reports_members() {
        let mut h = harness();
        topology(&mut h);
        h.manager.vroute_add(VRoute::new("net-a", "net-b", "gw")).unwrap();

        let removal = h.manager.vnetwork_remove("net-a").unwrap();
        let mut nodes: Vec<_> = removal.members.iter().map(|(n, _)| n.as_str()).collect();
        nodes.sort();
        assert_eq!(nodes, vec!["gw", "n1", "n2"]);
        assert_eq!(removal.vroutes.len(), 1);
        assert!(h.manager.vplatform().get_vnetwork("net-a").is_none());
        assert!(!h.manager.vplatform().get_viface("n1", "if0").unwrap().is_attached());
    }

    #[test]
    fn test_destroy_dispatch() {
        let mut h = harness();
        topology(&mut h);

        h.manager.destroy(Resource::VNetwork("net-b".to_string())).unwrap();
        assert!(h.manager.vplatform().get_vnetwork("net-b").is_none());

        h.manager.destroy(Resource::VNode("n2".to_string())).unwrap();
        assert!(h.manager.get_vnode("n2").is_none());

        h.manager.destroy(Resource::PNode("10.1.1.1".to_string())).unwrap();
        assert_eq!(h.manager.vplatform().vnode_count(), 2);

        assert!(h
            .manager
            .destroy(Resource::VNetwork("net-b".to_string()))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_vcpu_attach_linked_and_floating() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();
        h.manager.vnode_add(spec("n2")).unwrap();
        h.manager.vnode_add(spec("n3")).unwrap();

        h.manager.vcpu_attach("n1", 3, true).unwrap();
        let vcpu = h.manager.get_vnode("n1").unwrap().vcpu.clone().unwrap();
        assert_eq!(vcpu.pinned_cores(), vec![0, 1, 2]);
        assert!(h.manager.vcpu_attach("n1", 1, true).is_err());

        // Only one physical core left to pin
        let err = h.manager.vcpu_attach("n2", 2, true).unwrap_err();
        assert!(matches!(err, PlatformError::CapacityExceeded(_)));

        // Floating cores do not reserve physical ones
        h.manager.vcpu_attach("n3", 4, false).unwrap();
        assert!(h.manager.vcpu_attach("n2", 5, false).is_err());

        h.manager.vnode_remove("n1").unwrap();
        assert_eq!(h.manager.pnode().cpu.free_cores(), 4);
        h.manager.vcpu_attach("n2", 2, true).unwrap();
        h.manager.vcpu_detach("n2").unwrap();
        assert_eq!(h.manager.pnode().cpu.free_cores(), 4);
    }

    #[test]
    fn test_vnodes_start_in_parallel() {
        let mut h = harness();
        let names: Vec<String> = (0..10).map(|i| format!("n{}", i)).collect();
        for name in &names {
            h.manager.vnode_add(spec(name)).unwrap();
        }

        let mut requested = names.clone();
        requested.push("ghost".to_string());
        let results = h.manager.vnodes_start(&requested);

        assert_eq!(results.len(), 11);
        assert_eq!(results["ghost"].status, TaskStatus::Failed);
        for name in &names {
            assert!(results[name].is_success(), "{} failed", name);
            assert!(h.manager.get_vnode(name).unwrap().is_running());
            assert_eq!(h.factory.created_for(name).len(), 1);
        }

        let results = h.manager.vnodes_stop(&names);
        assert!(results.values().all(|r| r.is_success()));
        assert!(h
            .manager
            .vplatform()
            .vnodes()
            .all(|n| n.status == VNodeStatus::Stopped));
    }

    #[test]
    fn test_vnodes_start_ignores_repeated_names() {
        let mut h = harness();
        h.manager.vnode_add(spec("n1")).unwrap();

        let names = vec!["n1".to_string(); 4];
        let results = h.manager.vnodes_start(&names);

        assert_eq!(results.len(), 1);
        assert!(results["n1"].is_success());
        assert!(h.manager.get_vnode("n1").unwrap().is_running());

        let container = h.factory.created_for("n1").remove(0);
        assert_eq!(*container.calls.lock(), vec!["configure", "start"]);
    }

    #[test]
    fn test_teardown_removes_everything() {
        let mut h = harness();
        topology(&mut h);
        h.manager.vroute_add(VRoute::new("net-a", "net-b", "gw")).unwrap();
        h.manager.vnode_start("n1").unwrap();

        h.manager.teardown().unwrap();
        assert_eq!(h.manager.vplatform().vnode_count(), 0);
        assert_eq!(h.manager.vplatform().vnetworks().count(), 0);
        assert!(h.manager.vplatform().vroutes().is_empty());
        assert!(h
            .factory
            .created
            .lock()
            .iter()
            .all(|c| c.state() == ContainerState::Destroyed));
    }

    #[test]
    fn test_info_reports() {
        let mut h = harness();
        topology(&mut h);

        let all = h.manager.vnodes_info().unwrap();
        assert_eq!(all.as_object().unwrap().len(), 3);
        assert_eq!(all["gw"]["vifaces"][1]["address"], "10.0.9.1");

        let n1 = h.manager.vnode_info("n1").unwrap();
        assert_eq!(n1["status"], "Created");
        assert_eq!(n1["vifaces"][0]["vnetwork"], "net-a");

        let pnode = h.manager.pnode_info().unwrap();
        assert_eq!(pnode["status"], "Init");
    }
}
