// src/observability.rs
//! Logging and metrics setup
//!
//! `RUST_LOG` overrides the configured filter. Metrics go through the
//! `metrics` facade; installing an exporter is left to the embedding process.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{PlatformError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Gauge: number of virtual nodes registered in the platform
pub const METRIC_VNODES: &str = "vplatform_vnodes_total";

/// Counter: work items executed by sliding-window runners
pub const METRIC_RUNNER_TASKS: &str = "vplatform_runner_tasks_total";

/// Gauge: units currently held on admission semaphores
pub const METRIC_SEMAPHORE_USED: &str = "vplatform_semaphore_used";

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PlatformError::Config(format!("Invalid log filter '{}': {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| PlatformError::Config(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!("Tracing initialized");
    Ok(())
}
