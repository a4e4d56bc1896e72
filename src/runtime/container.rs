// src/runtime/container.rs
//! Containers realizing virtual nodes
//!
//! Each virtual node is bound to exactly one container for its whole
//! lifetime. The default implementation drives LXC:
//! - Namespaces and root filesystem from a generated config file
//! - CPU pinning (cgroup cpuset) from the node's linked vcores
//! - One veth per attached interface
//!
//! # Lifecycle
//!
//! ```text
//! Created ──configure──► Configured ──start──► Running ──stop──► Stopped
//!    ▲                                                             │
//!    └──────────────────────── configure ◄─────────────────────────┘
//! (any) ──destroy──► Destroyed
//! ```

use crate::resource::vnode::VNode;
use crate::runtime::shell::{quote, Shell, ShellOutput};
use crate::utils::errors::{PlatformError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerState {
    Created,
    Configured,
    Running,
    Stopped,
    Destroyed,
}

impl ContainerState {
    /// Validate a transition and return the resulting state
    pub fn transition(self, to: ContainerState) -> Result<ContainerState> {
        use ContainerState::*;

        let allowed = match (self, to) {
            (_, Destroyed) => true,
            (Destroyed, _) => false,
            (Created | Configured | Stopped, Configured) => true,
            (Configured | Running, Running) => true,
            (Running | Stopped, Stopped) => true,
            _ => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(PlatformError::InvalidState(format!(
                "container cannot go from {:?} to {:?}",
                self, to
            )))
        }
    }

    /// Fail when the container has been destroyed
    pub fn ensure_alive(self) -> Result<()> {
        if self == ContainerState::Destroyed {
            Err(PlatformError::InvalidState("container is destroyed".to_string()))
        } else {
            Ok(())
        }
    }
}

/// OS-level isolation boundary for one virtual node
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ContainerState;

    /// Apply the node's current setup (filesystem, interfaces, CPU)
    fn configure(&self, vnode: &VNode) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Re-apply setup in place after a topology change
    fn reconfigure(&self, vnode: &VNode) -> Result<()>;

    fn destroy(&self) -> Result<()>;

    /// Run a command inside the container
    fn execute(&self, command: &str) -> Result<ShellOutput>;
}

/// Creates containers and cleans up after previous runs
pub trait ContainerFactory: Send + Sync {
    fn create(&self, vnode: &VNode) -> Result<Arc<dyn Container>>;

    /// Stop containers left behind by a previous process lifetime
    fn stop_all(&self, orphans: &[String]) -> Result<()>;
}

/// LXC container configured from a generated file
pub struct LxcContainer {
    name: String,
    config_path: PathBuf,
    shell: Arc<dyn Shell>,
    state: Mutex<ContainerState>,
}

impl LxcContainer {
    pub fn new(name: impl Into<String>, config_dir: &Path, shell: Arc<dyn Shell>) -> Self {
        let name = name.into();
        Self {
            config_path: config_dir.join(format!("{}.conf", name)),
            name,
            shell,
            state: Mutex::new(ContainerState::Created),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Render the LXC configuration for `vnode`
    pub fn render_config(vnode: &VNode) -> String {
        let mut config = String::new();
        let _ = writeln!(config, "lxc.utsname = {}", vnode.name);
        let _ = writeln!(config, "lxc.rootfs = {}", vnode.filesystem.path.display());

        if let Some(vcpu) = &vnode.vcpu {
            let pinned = vcpu.pinned_cores();
            if !pinned.is_empty() {
                let cpus: Vec<String> = pinned.iter().map(|c| c.to_string()).collect();
                let _ = writeln!(config, "lxc.cgroup.cpuset.cpus = {}", cpus.join(","));
            }
        }

        for iface in &vnode.vifaces {
            let _ = writeln!(config, "lxc.network.type = veth");
            let _ = writeln!(config, "lxc.network.name = {}", iface.name);
            let _ = writeln!(config, "lxc.network.flags = up");
            if let Some(address) = iface.address {
                let _ = writeln!(config, "lxc.network.ipv4 = {}", address);
            }
        }

        config
    }

    fn write_config(&self, vnode: &VNode) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.config_path, Self::render_config(vnode))?;
        debug!("Wrote container config {:?}", self.config_path);
        Ok(())
    }
}

impl Container for LxcContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    fn configure(&self, vnode: &VNode) -> Result<()> {
        let mut state = self.state.lock();
        let next = state.transition(ContainerState::Configured)?;
        self.write_config(vnode)?;
        *state = next;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ContainerState::Running {
            debug!("Container {} already running", self.name);
            return Ok(());
        }
        let next = state.transition(ContainerState::Running)?;
        self.shell.run(&format!(
            "lxc-start -d -n {} -f {}",
            quote(&self.name),
            quote(&self.config_path.to_string_lossy())
        ))?;
        *state = next;
        info!("Container {} started", self.name);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ContainerState::Running {
            debug!("Container {} not running ({:?})", self.name, *state);
            return Ok(());
        }
        self.shell.run(&format!("lxc-stop -n {}", quote(&self.name)))?;
        *state = ContainerState::Stopped;
        info!("Container {} stopped", self.name);
        Ok(())
    }

    fn reconfigure(&self, vnode: &VNode) -> Result<()> {
        let state = self.state.lock();
        state.ensure_alive()?;
        self.write_config(vnode)?;
        if *state == ContainerState::Running {
            // Network settings are re-read by the init inside the container
            self.shell.run(&format!(
                "lxc-attach -n {} -- /etc/init.d/networking restart",
                quote(&self.name)
            ))?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ContainerState::Destroyed {
            return Ok(());
        }
        if *state == ContainerState::Running {
            let output = self
                .shell
                .execute(&format!("lxc-stop -k -n {}", quote(&self.name)))?;
            if !output.success() {
                warn!("Failed to kill container {}: {}", self.name, output.stderr.trim());
            }
        }
        if let Err(e) = fs::remove_file(&self.config_path) {
            debug!("No config to remove for {}: {}", self.name, e);
        }
        *state = ContainerState::Destroyed;
        info!("Container {} destroyed", self.name);
        Ok(())
    }

    fn execute(&self, command: &str) -> Result<ShellOutput> {
        let state = self.state();
        if state != ContainerState::Running {
            return Err(PlatformError::InvalidState(format!(
                "container {} is {:?}, not running",
                self.name, state
            )));
        }
        self.shell.execute(&format!(
            "lxc-attach -n {} -- sh -c {}",
            quote(&self.name),
            quote(command)
        ))
    }
}

/// Factory for `LxcContainer`s
pub struct LxcContainerFactory {
    config_dir: PathBuf,
    shell: Arc<dyn Shell>,
}

impl LxcContainerFactory {
    pub fn new(config_dir: impl Into<PathBuf>, shell: Arc<dyn Shell>) -> Self {
        Self {
            config_dir: config_dir.into(),
            shell,
        }
    }

    /// Names of containers whose configs survive from a previous run
    pub fn leftover_containers(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("conf") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }
}

impl ContainerFactory for LxcContainerFactory {
    fn create(&self, vnode: &VNode) -> Result<Arc<dyn Container>> {
        debug!("Creating container for {}", vnode.name);
        Ok(Arc::new(LxcContainer::new(
            vnode.name.clone(),
            &self.config_dir,
            Arc::clone(&self.shell),
        )))
    }

    fn stop_all(&self, orphans: &[String]) -> Result<()> {
        for name in orphans {
            let output = self.shell.execute(&format!("lxc-stop -k -n {}", quote(name)))?;
            if output.success() {
                info!("Stopped leftover container {}", name);
            } else {
                debug!("Leftover container {} was not running", name);
            }
            let _ = fs::remove_file(self.config_dir.join(format!("{}.conf", name)));
        }
        Ok(())
    }
}
