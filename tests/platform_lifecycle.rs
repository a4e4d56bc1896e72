// tests/platform_lifecycle.rs
//! End-to-end platform scenarios through the public API

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vplatform_engine::resource::pnode::PNode;
use vplatform_engine::resource::{VIface, VNode};
use vplatform_engine::runtime::{
    Container, ContainerFactory, ContainerState, FilesystemProvider, Limitation, NetworkLimiter,
    NodeBootstrap, Shell, ShellOutput,
};
use vplatform_engine::sync::TaskStatus;
use vplatform_engine::{
    Collaborators, ConfigManager, PlatformConfig, PlatformError, Resource, Result, VNetwork,
    VNodeSpec, VRoute,
};

#[derive(Default)]
struct LogShell {
    log: Mutex<Vec<String>>,
}

impl Shell for LogShell {
    fn execute(&self, command: &str) -> Result<ShellOutput> {
        self.log.lock().push(command.to_string());
        Ok(ShellOutput {
            command: command.to_string(),
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct DirFilesystem;

impl FilesystemProvider for DirFilesystem {
    fn download(&self, image: &str) -> Result<PathBuf> {
        if image.starts_with("missing") {
            return Err(PlatformError::UnavailableDependency(image.to_string()));
        }
        Ok(PathBuf::from(image))
    }

    fn extract(&self, _archive: &Path, dest: &Path) -> Result<PathBuf> {
        Ok(dest.to_path_buf())
    }

    fn remove(&self, _root: &Path) -> Result<()> {
        Ok(())
    }
}

struct MemContainer {
    name: String,
    state: Mutex<ContainerState>,
}

impl Container for MemContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    fn configure(&self, _vnode: &VNode) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.transition(ContainerState::Configured)?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.transition(ContainerState::Running)?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ContainerState::Running {
            *state = ContainerState::Stopped;
        }
        Ok(())
    }

    fn reconfigure(&self, _vnode: &VNode) -> Result<()> {
        self.state.lock().ensure_alive()
    }

    fn destroy(&self) -> Result<()> {
        *self.state.lock() = ContainerState::Destroyed;
        Ok(())
    }

    fn execute(&self, command: &str) -> Result<ShellOutput> {
        Ok(ShellOutput {
            command: command.to_string(),
            status: Some(0),
            stdout: self.name.clone(),
            stderr: String::new(),
        })
    }
}

#[derive(Default)]
struct MemFactory {
    created: Mutex<HashMap<String, Vec<Arc<MemContainer>>>>,
}

impl MemFactory {
    fn count(&self, name: &str) -> usize {
        self.created.lock().get(name).map_or(0, |c| c.len())
    }

    fn state(&self, name: &str) -> Option<ContainerState> {
        self.created
            .lock()
            .get(name)
            .and_then(|c| c.last().map(|c| c.state()))
    }
}

impl ContainerFactory for MemFactory {
    fn create(&self, vnode: &VNode) -> Result<Arc<dyn Container>> {
        let container = Arc::new(MemContainer {
            name: vnode.name.clone(),
            state: Mutex::new(ContainerState::Created),
        });
        self.created
            .lock()
            .entry(vnode.name.clone())
            .or_default()
            .push(Arc::clone(&container));
        Ok(container)
    }

    fn stop_all(&self, _orphans: &[String]) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CountingLimiter {
    applied: Mutex<Vec<String>>,
}

impl NetworkLimiter for CountingLimiter {
    fn apply(&self, iface: &VIface) -> Result<()> {
        self.applied.lock().push(iface.device());
        Ok(())
    }

    fn clear(&self, _iface: &VIface) -> Result<()> {
        Ok(())
    }
}

struct NoopBootstrap;

impl NodeBootstrap for NoopBootstrap {
    fn bootstrap(&self, _pnode: &PNode) -> Result<()> {
        Ok(())
    }
}

struct Platform {
    manager: ConfigManager,
    shell: Arc<LogShell>,
    factory: Arc<MemFactory>,
    limiter: Arc<CountingLimiter>,
}

fn platform() -> Platform {
    let mut config = PlatformConfig::default();
    config.node.address = Some("192.168.0.10".to_string());
    config.node.physical_cores = Some(2);
    config.runtime.pool_size = 3;
    config.runtime.max_parallel_commands = Some(2);

    let shell = Arc::new(LogShell::default());
    let factory = Arc::new(MemFactory::default());
    let limiter = Arc::new(CountingLimiter::default());
    let collaborators = Collaborators {
        shell: shell.clone(),
        filesystem: Arc::new(DirFilesystem),
        containers: factory.clone(),
        limiter: limiter.clone(),
    };

    let mut manager = ConfigManager::new(config, collaborators, &[]).unwrap();
    manager.pnode_init(&NoopBootstrap).unwrap();

    Platform {
        manager,
        shell,
        factory,
        limiter,
    }
}

#[test]
fn test_two_networks_routed_through_gateway() {
    let mut p = platform();
    let m = &mut p.manager;

    m.vnetwork_add(VNetwork::parse("front", "10.10.0.0/24").unwrap()).unwrap();
    m.vnetwork_add(VNetwork::parse("back", "10.20.0.0/24").unwrap()).unwrap();

    for name in ["web", "router", "db"] {
        m.vnode_add(VNodeSpec::new(name, "debian.tar.gz")).unwrap();
    }
    m.viface_create("web", "eth0").unwrap();
    m.viface_create("router", "eth0").unwrap();
    m.viface_create("router", "eth1").unwrap();
    m.viface_create("db", "eth0").unwrap();

    let web = m.viface_attach("web", "eth0", "front", None).unwrap();
    m.viface_attach("router", "eth0", "front", None).unwrap();
    m.viface_attach("router", "eth1", "back", None).unwrap();
    let db = m
        .viface_attach("db", "eth0", "back", Some("10.20.0.50".parse().unwrap()))
        .unwrap();
    assert_eq!(web.to_string(), "10.10.0.1");
    assert_eq!(db.to_string(), "10.20.0.50");

    let added = m.vroute_complete().unwrap();
    assert_eq!(added.len(), 2);
    assert!(added.iter().all(|r| r.gateway == "router"));
    assert!(m.get_vnode("router").unwrap().gateway);
    assert!(!m.get_vnode("web").unwrap().gateway);

    // Each interface brought up its device once
    let ups = p
        .shell
        .log
        .lock()
        .iter()
        .filter(|c| c.starts_with("ip link set dev ifb") && c.ends_with(" up"))
        .count();
    assert_eq!(ups, 4);
}

#[test]
fn test_batch_start_limits_and_teardown() {
    let mut p = platform();
    let names: Vec<String> = (0..6).map(|i| format!("node{}", i)).collect();

    p.manager
        .vnetwork_add(VNetwork::parse("lan", "172.16.0.0/16").unwrap())
        .unwrap();
    for name in &names {
        p.manager.vnode_add(VNodeSpec::new(name, "alpine.tar")).unwrap();
        p.manager.viface_create(name, "eth0").unwrap();
        p.manager.viface_attach(name, "eth0", "lan", None).unwrap();
        p.manager
            .viface_limit(name, "eth0", Limitation::default().with_bandwidth(10_000).with_latency(20))
            .unwrap();
    }

    let results = p.manager.vnodes_start(&names);
    assert_eq!(results.len(), 6);
    assert!(results.values().all(|r| r.status == TaskStatus::Succeeded));
    for name in &names {
        assert_eq!(p.factory.count(name), 1);
        assert_eq!(p.factory.state(name), Some(ContainerState::Running));
        assert_eq!(p.manager.vnode_limit(name).unwrap(), 1);
        assert_eq!(p.manager.vnode_limit(name).unwrap(), 0);
    }
    assert_eq!(p.limiter.applied.lock().len(), 6);

    let output = p.manager.vnode_execute("node3", "hostname").unwrap();
    assert_eq!(output.stdout, "node3");

    p.manager.teardown().unwrap();
    assert_eq!(p.manager.vplatform().vnode_count(), 0);
    for name in &names {
        assert_eq!(p.factory.state(name), Some(ContainerState::Destroyed));
    }
}

#[test]
fn test_failures_leave_graph_consistent() {
    let mut p = platform();
    let m = &mut p.manager;

    let err = m.vnode_add(VNodeSpec::new("a", "missing.tar")).unwrap_err();
    assert!(matches!(err, PlatformError::UnavailableDependency(_)));
    assert!(m.get_vnode("a").is_none());

    m.vnode_add(VNodeSpec::new("a", "ok.tar")).unwrap();
    assert!(m.vnode_add(VNodeSpec::new("a", "ok.tar")).is_err());
    assert_eq!(p.factory.count("a"), 1);

    m.vnetwork_add(VNetwork::parse("net", "10.0.0.0/24").unwrap()).unwrap();
    assert!(m
        .vnetwork_add(VNetwork::parse("overlap", "10.0.0.128/25").unwrap())
        .is_err());
    assert!(matches!(
        m.vroute_add(VRoute::new("net", "net", "a")).unwrap_err(),
        PlatformError::InvalidParameter(_)
    ));

    // Linked CPU beyond the host's two cores
    let err = m.vcpu_attach("a", 3, true).unwrap_err();
    assert!(matches!(err, PlatformError::CapacityExceeded(_)));
    assert!(m.get_vnode("a").unwrap().vcpu.is_none());

    m.vnode_start("a").unwrap();
    m.vnode_start("a").unwrap();
    assert_eq!(p.factory.count("a"), 1);

    m.destroy(Resource::VNode("a".to_string())).unwrap();
    m.destroy(Resource::VNode("a".to_string())).unwrap();
    assert_eq!(p.factory.state("a"), Some(ContainerState::Destroyed));
}
