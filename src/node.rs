//! Node context: the shared state every connection of this node works against.

use std::fmt;
use std::sync::Arc;

use crate::handler::HandlerRegistry;
use crate::net::forward::{NoopForwarder, RemoteForwarder};
use crate::protocol::{RouteDict, RouteInfo};
use crate::session::SessionRegistry;
use crate::types::{Config, Error, Result};

/// Everything a connection needs, passed explicitly instead of living in globals.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub handlers: Arc<HandlerRegistry>,
    pub routes: Arc<RouteDict>,
    pub forwarder: Arc<dyn RemoteForwarder>,
}

impl NodeContext {
    /// Build a session registry matching `config`. Create it before the
    /// handlers so components can capture it for pushes and responses.
    pub fn session_registry(config: &Config) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            config.server.role,
            config.net.heartbeat_timeout,
        ))
    }

    /// Validate `config` and freeze the handler registry.
    pub fn new(
        config: Config,
        sessions: Arc<SessionRegistry>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        if sessions.role() != config.server.role {
            return Err(Error::validation(format!(
                "session registry role {} does not match configured role {}",
                sessions.role(),
                config.server.role
            )));
        }
        let routes = RouteDict::from_config(&config.routes)?;
        Ok(Self {
            config: Arc::new(config),
            sessions,
            handlers: Arc::new(handlers),
            routes: Arc::new(routes),
            forwarder: Arc::new(NoopForwarder),
        })
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn RemoteForwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Whether `route` is served by this node's server type.
    pub fn is_local(&self, route: &RouteInfo) -> bool {
        route.server == self.config.server.server_type
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("server_type", &self.config.server.server_type)
            .field("role", &self.config.server.role)
            .field("handlers", &self.handlers)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}
