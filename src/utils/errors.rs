// src/utils/errors.rs
//! Error types for the virtual platform engine
//!
//! Structural violations (duplicate names, missing resources, exhausted
//! capacity) are reported synchronously as typed errors. Nothing in the
//! engine retries on its own.

use std::fmt;

/// Kind of resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    PNode,
    VNode,
    VIface,
    VNetwork,
    VRoute,
    Container,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::PNode => "physical node",
            ResourceKind::VNode => "virtual node",
            ResourceKind::VIface => "virtual interface",
            ResourceKind::VNetwork => "virtual network",
            ResourceKind::VRoute => "virtual route",
            ResourceKind::Container => "container",
        };
        f.write_str(name)
    }
}

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Name collision on add
    #[error("{kind} '{name}' already exists")]
    DuplicateResource { kind: ResourceKind, name: String },

    /// Operation on an absent name or reference
    #[error("{kind} '{name}' not found")]
    ResourceNotFound { kind: ResourceKind, name: String },

    /// A fixed-size pool (interfaces, cores, semaphore units) is exhausted
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Low-level command failure
    #[error("Command '{command}' failed with status {status:?}: {stderr}")]
    ShellExecution {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Filesystem image fetch or extraction failure
    #[error("Unavailable dependency: {0}")]
    UnavailableDependency(String),

    /// Malformed argument (bad CIDR, self-route, invalid limitation)
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Transition not allowed from the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlatformError {
    pub fn duplicate(kind: ResourceKind, name: impl Into<String>) -> Self {
        PlatformError::DuplicateResource {
            kind,
            name: name.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        PlatformError::ResourceNotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for errors reporting a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::ResourceNotFound { .. })
    }
}

/// Engine Result type
pub type Result<T> = std::result::Result<T, PlatformError>;
