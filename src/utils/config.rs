// src/utils/config.rs
//! Engine configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. Optional config file (`VPLATFORM_CONFIG` or an explicit path)
//! 3. Environment variables: `VPLATFORM_<SECTION>__<KEY>`
//!    (e.g. `VPLATFORM_RUNTIME__POOL_SIZE=16`)

use crate::utils::errors::{PlatformError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "VPLATFORM_CONFIG";

/// Maximum number of virtual interfaces per physical host
pub const MAX_IFACES: u32 = 64;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub node: NodeConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

/// Physical node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Where virtual node root filesystems are extracted
    pub rootfs_dir: PathBuf,

    /// Where downloaded image archives are cached
    pub cache_dir: PathBuf,

    /// Where generated container configurations are written
    pub container_dir: PathBuf,

    /// Upper bound (exclusive) on interface ids
    pub max_ifaces: u32,

    /// Physical cores available for virtual CPU binding (detected when unset)
    pub physical_cores: Option<usize>,

    /// Administrative SSH user for bootstrap
    pub ssh_user: String,

    /// Administrative SSH key for bootstrap
    pub ssh_key: PathBuf,

    /// Override for the detected default address
    pub address: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rootfs_dir: PathBuf::from("/tmp/rootfs"),
            cache_dir: PathBuf::from("/tmp/vplatform/cache"),
            container_dir: PathBuf::from("/tmp/vplatform/containers"),
            max_ifaces: MAX_IFACES,
            physical_cores: None,
            ssh_user: "root".to_string(),
            ssh_key: PathBuf::from("/root/.ssh/id_rsa"),
            address: None,
        }
    }
}

impl NodeConfig {
    /// Configured core count, or the host's available parallelism
    pub fn core_count(&self) -> usize {
        self.physical_cores.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Concurrency settings for batch operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of workers in the sliding-window runner
    pub pool_size: usize,

    /// Cap on simultaneous shell commands beneath the pool size
    pub max_parallel_commands: Option<usize>,

    /// Apply interface limitations automatically on `vnode_start`
    pub limit_on_start: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            max_parallel_commands: None,
            limit_on_start: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PlatformConfig {
    /// Load configuration from `VPLATFORM_CONFIG` (if set) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an optional file plus the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: PlatformConfig = builder
            .add_source(
                Environment::with_prefix("VPLATFORM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PlatformError::Config(format!("Failed to load configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| PlatformError::Config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.runtime.pool_size == 0 {
            return Err(PlatformError::Config("pool_size cannot be 0".to_string()));
        }
        if self.runtime.max_parallel_commands == Some(0) {
            return Err(PlatformError::Config(
                "max_parallel_commands cannot be 0".to_string(),
            ));
        }
        if self.node.max_ifaces == 0 {
            return Err(PlatformError::Config("max_ifaces cannot be 0".to_string()));
        }
        if self.node.physical_cores == Some(0) {
            return Err(PlatformError::Config("physical_cores cannot be 0".to_string()));
        }
        Ok(())
    }
}
