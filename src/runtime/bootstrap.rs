// src/runtime/bootstrap.rs
//! Remote bootstrap of physical nodes

use crate::resource::pnode::PNode;
use crate::runtime::shell::{quote, Shell};
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::info;

/// Starts the platform daemon on a physical node
pub trait NodeBootstrap: Send + Sync {
    fn bootstrap(&self, pnode: &PNode) -> Result<()>;
}

/// Launches the daemon over a single `ssh` invocation
pub struct SshBootstrap {
    shell: Arc<dyn Shell>,
    daemon_path: String,
}

impl SshBootstrap {
    pub fn new(shell: Arc<dyn Shell>, daemon_path: impl Into<String>) -> Self {
        Self {
            shell,
            daemon_path: daemon_path.into(),
        }
    }

    pub fn command(&self, pnode: &PNode) -> String {
        let remote = format!("{} >/dev/null 2>&1 &", self.daemon_path);
        format!(
            "ssh -i {} -o BatchMode=yes {}@{} {}",
            quote(&pnode.ssh_key.to_string_lossy()),
            pnode.ssh_user,
            pnode.address,
            quote(&remote)
        )
    }
}

impl NodeBootstrap for SshBootstrap {
    fn bootstrap(&self, pnode: &PNode) -> Result<()> {
        info!("Bootstrapping daemon on {}", pnode.address);
        self.shell.run(&self.command(pnode))?;
        Ok(())
    }
}
