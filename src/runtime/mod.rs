// src/runtime/mod.rs
//! Collaborators the orchestrator drives
//!
//! Each concern sits behind a trait with a default Linux implementation:
//!
//! - **Shell**: command execution (`SystemShell`)
//! - **Filesystem**: image fetch and extraction (`LocalFileManager`)
//! - **Container**: per-node isolation boundary (`LxcContainer`)
//! - **Limitation**: interface traffic shaping (`TrafficShaper`)
//! - **Bootstrap**: remote daemon launch (`SshBootstrap`)

pub mod bootstrap;
pub mod container;
pub mod filesystem;
pub mod limitation;
pub mod shell;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{NodeBootstrap, SshBootstrap};
pub use container::{Container, ContainerFactory, ContainerState, LxcContainer, LxcContainerFactory};
pub use filesystem::{FilesystemProvider, LocalFileManager};
pub use limitation::{Limitation, NetworkLimiter, TrafficShaper};
pub use shell::{Shell, ShellOutput, SystemShell};
