// src/node/mod.rs
//! Platform orchestration
//!
//! `ConfigManager` owns the resource graph of one physical node and turns
//! lifecycle requests (add, start, limit, route, remove) into graph
//! mutations plus container and shell side effects.

pub mod config_manager;

pub use config_manager::{Collaborators, ConfigManager};
