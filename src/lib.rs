//! # Meshgate - Message-Routing Core
//!
//! Routing core of a multi-node real-time application server:
//! - Length-delimited packet framing over raw TCP
//! - Message envelope codec (request/notify/response/push, varint ids, route codes)
//! - Per-connection ordered processing with parallel connections
//! - Session registry for frontend and backend sessions
//! - Handler registry keyed by `server.service.method` routes
//!
//! ## Architecture
//!
//! ```text
//!   socket bytes ─▶ packet framer ─▶ per-connection queue ─▶ worker
//!                                                              │
//!                          handshake / heartbeat / data ◀──────┘
//!                                                      │
//!                                message codec ◀───────┘
//!                                      │
//!                 route == this server type? ──yes──▶ handler registry
//!                                      │
//!                                      no ──▶ remote forwarder
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod handler;
pub mod net;
pub mod node;
pub mod protocol;
pub mod session;
pub mod types;

// Internal utilities
pub mod observability;
pub mod validation;

pub use handler::{Component, HandlerRegistry, MethodTable};
pub use net::{RemoteForwarder, Server};
pub use node::NodeContext;
pub use session::{SessionHandle, SessionRegistry, SessionStatus};
pub use types::{Config, Error, Result, Role};
