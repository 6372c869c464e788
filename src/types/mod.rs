//! Core types for the routing core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SessionId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the node, network and routes

mod config;
mod errors;
mod ids;

pub use config::{Config, NetConfig, ObservabilityConfig, Role, ServerConfig};
pub use errors::{Error, Result};
pub use ids::SessionId;
