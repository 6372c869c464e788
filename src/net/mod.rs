//! TCP transport: accept loop, per-connection pipeline and dispatch.

pub mod connection;
pub mod dispatch;
pub mod forward;
pub mod heartbeat;
pub mod server;

pub use forward::{NoopForwarder, RemoteForwarder};
pub use heartbeat::HeartbeatMonitor;
pub use server::Server;
