// src/runtime/testing.rs
//! In-memory collaborators for unit tests

use crate::resource::pnode::PNode;
use crate::resource::vnode::VNode;
use crate::runtime::bootstrap::NodeBootstrap;
use crate::runtime::container::{Container, ContainerFactory, ContainerState};
use crate::runtime::filesystem::FilesystemProvider;
use crate::runtime::shell::{Shell, ShellOutput};
use crate::utils::errors::{PlatformError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shell that records commands and fails the ones it is told to
#[derive(Default)]
pub struct RecordingShell {
    pub commands: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `pattern` exit with status 1
    pub fn fail_on(&self, pattern: &str) {
        self.failing.lock().push(pattern.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl Shell for RecordingShell {
    fn execute(&self, command: &str) -> Result<ShellOutput> {
        self.commands.lock().push(command.to_string());
        let failed = self.failing.lock().iter().any(|p| command.contains(p));
        Ok(ShellOutput {
            command: command.to_string(),
            status: Some(if failed { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if failed { "forced failure".to_string() } else { String::new() },
        })
    }
}

/// Filesystem provider that resolves images without touching the disk
#[derive(Default)]
pub struct FakeFilesystem {
    pub downloads: AtomicUsize,
    pub removed: Mutex<Vec<PathBuf>>,
    unavailable: Mutex<HashSet<String>>,
}

impl FakeFilesystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn make_unavailable(&self, image: &str) {
        self.unavailable.lock().insert(image.to_string());
    }
}

impl FilesystemProvider for FakeFilesystem {
    fn download(&self, image: &str) -> Result<PathBuf> {
        if self.unavailable.lock().contains(image) {
            return Err(PlatformError::UnavailableDependency(format!("cannot fetch {}", image)));
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from("/cache").join(image))
    }

    fn extract(&self, _archive: &Path, dest: &Path) -> Result<PathBuf> {
        Ok(dest.to_path_buf())
    }

    fn remove(&self, root: &Path) -> Result<()> {
        self.removed.lock().push(root.to_path_buf());
        Ok(())
    }
}

/// Container whose transitions are only recorded
pub struct FakeContainer {
    name: String,
    state: Mutex<ContainerState>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeContainer {
    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

impl Container for FakeContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    fn configure(&self, _vnode: &VNode) -> Result<()> {
        self.record("configure");
        let mut state = self.state.lock();
        *state = state.transition(ContainerState::Configured)?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.record("start");
        let mut state = self.state.lock();
        *state = state.transition(ContainerState::Running)?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop");
        let mut state = self.state.lock();
        if *state == ContainerState::Running {
            *state = ContainerState::Stopped;
        }
        Ok(())
    }

    fn reconfigure(&self, _vnode: &VNode) -> Result<()> {
        self.record("reconfigure");
        self.state.lock().ensure_alive()
    }

    fn destroy(&self) -> Result<()> {
        self.record("destroy");
        *self.state.lock() = ContainerState::Destroyed;
        Ok(())
    }

    fn execute(&self, command: &str) -> Result<ShellOutput> {
        self.record(&format!("execute {}", command));
        Ok(ShellOutput {
            command: command.to_string(),
            status: Some(0),
            stdout: format!("ran {}", command),
            stderr: String::new(),
        })
    }
}

/// Factory handing out `FakeContainer`s and keeping them for inspection
#[derive(Default)]
pub struct FakeContainerFactory {
    pub created: Mutex<Vec<Arc<FakeContainer>>>,
    pub stopped_orphans: Mutex<Vec<String>>,
    refused: Mutex<HashSet<String>>,
}

impl FakeContainerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `create` fails for the node named `name`
    pub fn refuse(&self, name: &str) {
        self.refused.lock().insert(name.to_string());
    }

    pub fn created_for(&self, name: &str) -> Vec<Arc<FakeContainer>> {
        self.created
            .lock()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }
}

impl ContainerFactory for FakeContainerFactory {
    fn create(&self, vnode: &VNode) -> Result<Arc<dyn Container>> {
        if self.refused.lock().contains(&vnode.name) {
            return Err(PlatformError::InvalidState(format!(
                "cannot create container for {}",
                vnode.name
            )));
        }
        let container = Arc::new(FakeContainer {
            name: vnode.name.clone(),
            state: Mutex::new(ContainerState::Created),
            calls: Mutex::new(Vec::new()),
        });
        self.created.lock().push(Arc::clone(&container));
        Ok(container)
    }

    fn stop_all(&self, orphans: &[String]) -> Result<()> {
        self.stopped_orphans.lock().extend(orphans.iter().cloned());
        Ok(())
    }
}

/// Bootstrap that only counts invocations
#[derive(Default)]
pub struct CountingBootstrap {
    pub calls: AtomicUsize,
}

impl NodeBootstrap for CountingBootstrap {
    fn bootstrap(&self, _pnode: &PNode) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
