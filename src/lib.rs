// src/lib.rs
//! Virtual Platform Engine Library
//!
//! Emulates a distributed platform on one physical host: virtual nodes run
//! in containers, joined by virtual networks and routes, with optional
//! traffic shaping on their interfaces.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **sync**: Admission semaphore and bounded sliding-window task runner
//! - **resource**: Resource graph (nodes, interfaces, networks, routes)
//! - **runtime**: Shell, filesystem, container, limiter and bootstrap collaborators
//! - **node**: Configuration orchestrator driving the graph and collaborators
//! - **observability**: Tracing setup and metric names
//! - **utils**: Errors and configuration loading

pub mod node;
pub mod observability;
pub mod resource;
pub mod runtime;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use node::{Collaborators, ConfigManager};
pub use resource::{Resource, VNetwork, VNodeSpec, VRoute};
pub use sync::{Semaphore, SlidingWindow};
pub use utils::config::PlatformConfig;
pub use utils::errors::{PlatformError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
