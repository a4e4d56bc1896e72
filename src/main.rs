// src/main.rs
//! Virtual Platform Daemon
//!
//! Runs on a physical node: stops containers left by a previous run, holds
//! the platform graph, and tears every virtual resource down on shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use vplatform_engine::observability::init_tracing;
use vplatform_engine::runtime::container::LxcContainerFactory;
use vplatform_engine::runtime::shell::SystemShell;
use vplatform_engine::{Collaborators, ConfigManager, PlatformConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it carries the logging settings
    let config = PlatformConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Starting vplatformd v{}", vplatform_engine::VERSION);
    info!("Configuration loaded: {:?}", config);

    let collaborators = Collaborators::system(&config);
    let orphans = LxcContainerFactory::new(
        config.node.container_dir.clone(),
        Arc::new(SystemShell::new()),
    )
    .leftover_containers();

    let mut manager = ConfigManager::new(config, collaborators, &orphans)?;
    info!(
        "Physical node {} ready with {} free cores",
        manager.pnode().address,
        manager.pnode().cpu.free_cores()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    // Teardown shells out and blocks; keep it off the async workers
    let result = tokio::task::spawn_blocking(move || manager.teardown()).await?;
    match result {
        Ok(()) => {
            info!("Platform torn down");
            Ok(())
        }
        Err(e) => {
            error!("Teardown error: {}", e);
            Err(e.into())
        }
    }
}
