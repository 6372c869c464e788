//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and overridden from the command line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::protocol::packet::MAX_BODY_LEN;
use crate::protocol::route::RouteInfo;
use crate::types::{Error, Result};
use crate::validation::{validate_non_empty, validate_positive};

/// Cluster role of this node. Selects which session table connections land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Terminates client connections.
    #[default]
    Frontend,
    /// Serves internal routes for other nodes.
    Backend,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Frontend => f.write_str("frontend"),
            Role::Backend => f.write_str("backend"),
        }
    }
}

/// Global node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server identity and bind address.
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection handling configuration.
    #[serde(default)]
    pub net: NetConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Route dictionary for compressed routes: code -> "server.service.method".
    #[serde(default)]
    pub routes: BTreeMap<u16, String>,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.server.server_type, "server.server_type")?;
        if self.server.server_type.contains('.') {
            return Err(Error::validation("server.server_type cannot contain '.'"));
        }
        validate_non_empty(&self.server.listen_addr, "server.listen_addr")?;

        let net = &self.net;
        validate_positive(net.packet_queue_capacity, "net.packet_queue_capacity")?;
        validate_positive(net.outbound_queue_capacity, "net.outbound_queue_capacity")?;
        validate_positive(net.read_buffer_size, "net.read_buffer_size")?;
        validate_positive(net.max_connections, "net.max_connections")?;
        if net.max_body_bytes > MAX_BODY_LEN {
            return Err(Error::validation(format!(
                "net.max_body_bytes cannot exceed {}",
                MAX_BODY_LEN
            )));
        }
        // Reported to peers in whole seconds.
        if net.heartbeat_interval.as_secs() == 0 {
            return Err(Error::validation(
                "net.heartbeat_interval must be at least one second",
            ));
        }
        if net.heartbeat_timeout < net.heartbeat_interval {
            return Err(Error::validation(
                "net.heartbeat_timeout must be at least net.heartbeat_interval",
            ));
        }
        if net.heartbeat_sweep_interval.is_zero() {
            return Err(Error::validation("net.heartbeat_sweep_interval must be positive"));
        }

        for (code, route) in &self.routes {
            RouteInfo::parse(route)
                .map_err(|e| Error::validation(format!("routes[{}]: {}", code, e)))?;
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server type of this node; routes whose first segment matches are local.
    pub server_type: String,

    /// Role of this node in the cluster.
    #[serde(default)]
    pub role: Role,

    /// TCP bind address.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_type: "connector".to_string(),
            role: Role::Frontend,
            listen_addr: "127.0.0.1:3250".to_string(),
        }
    }
}

/// Per-connection limits, queue sizes and liveness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Bounded packet queue between the read loop and the connection worker.
    pub packet_queue_capacity: usize,

    /// Bounded queue of encoded frames waiting for the socket writer.
    pub outbound_queue_capacity: usize,

    /// Scratch buffer size for a single socket read.
    pub read_buffer_size: usize,

    /// Largest accepted packet body. A header declaring more fails the
    /// connection before the body is buffered, so this also bounds the read
    /// accumulator at one packet.
    pub max_body_bytes: usize,

    /// Maximum concurrent TCP connections. Connections beyond this limit
    /// are refused.
    pub max_connections: usize,

    /// Heartbeat interval reported to peers in the handshake reply.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which a session is considered dead.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// How often the liveness sweep runs.
    #[serde(with = "humantime_serde")]
    pub heartbeat_sweep_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            packet_queue_capacity: 256,
            outbound_queue_capacity: 256,
            read_buffer_size: 512,
            max_body_bytes: 1024 * 1024,
            max_connections: 10_000,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
