// src/runtime/limitation.rs
//! Network limitation for virtual interfaces
//!
//! Provides traffic shaping on a per-interface basis:
//! - Bandwidth (kbit/s)
//! - Latency (ms)
//!
//! Limitations are installed at most once per interface; the interface's
//! `limited` flag is the guard and only a detach resets it.

use crate::resource::viface::VIface;
use crate::runtime::shell::Shell;
use crate::utils::errors::{PlatformError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Traffic-shaping parameters for one interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    /// Bandwidth cap in kbit/s
    /// Example: 10240 = 10 Mbit/s
    pub bandwidth_kbps: Option<u32>,

    /// Added one-way latency in milliseconds
    pub latency_ms: Option<u32>,
}

impl Limitation {
    /// No shaping at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_bandwidth(mut self, kbps: u32) -> Self {
        self.bandwidth_kbps = Some(kbps);
        self
    }

    pub fn with_latency(mut self, ms: u32) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.bandwidth_kbps.is_none() && self.latency_ms.is_none()
    }

    /// Validate limitation values
    pub fn validate(&self) -> Result<()> {
        if let Some(bandwidth) = self.bandwidth_kbps {
            if bandwidth == 0 {
                return Err(PlatformError::InvalidParameter(
                    "Bandwidth cannot be 0".to_string(),
                ));
            }
            if bandwidth > 100_000_000 {
                return Err(PlatformError::InvalidParameter(
                    "Bandwidth cannot exceed 100 Gbit/s".to_string(),
                ));
            }
        }

        if let Some(latency) = self.latency_ms {
            if latency > 60_000 {
                return Err(PlatformError::InvalidParameter(
                    "Latency cannot exceed 60 s".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Installs traffic-shaping rules for an interface
pub trait NetworkLimiter: Send + Sync {
    /// Apply `iface.limitation` to the interface
    fn apply(&self, iface: &VIface) -> Result<()>;

    /// Remove any shaping from the interface
    fn clear(&self, iface: &VIface) -> Result<()>;
}

/// `tc`/netem limiter acting on the interface's host-side forwarding device
pub struct TrafficShaper {
    shell: Arc<dyn Shell>,
}

impl TrafficShaper {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }
}

impl NetworkLimiter for TrafficShaper {
    fn apply(&self, iface: &VIface) -> Result<()> {
        let limitation = match &iface.limitation {
            Some(limitation) if !limitation.is_unlimited() => limitation,
            _ => {
                debug!("No limitation to apply on {}", iface.name);
                return Ok(());
            }
        };

        let mut command = format!("tc qdisc replace dev {} root netem", iface.device());
        if let Some(latency) = limitation.latency_ms {
            command.push_str(&format!(" delay {}ms", latency));
        }
        if let Some(bandwidth) = limitation.bandwidth_kbps {
            command.push_str(&format!(" rate {}kbit", bandwidth));
        }

        debug!("Limiting {}: {:?}", iface.name, limitation);
        self.shell.run(&command)?;
        Ok(())
    }

    fn clear(&self, iface: &VIface) -> Result<()> {
        let command = format!("tc qdisc del dev {} root", iface.device());
        // No qdisc installed is not an error worth surfacing
        let output = self.shell.execute(&command)?;
        if !output.success() {
            debug!("No shaping to clear on {}", iface.device());
        }
        Ok(())
    }
}
