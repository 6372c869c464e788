//! Remote forwarding seam.
//!
//! When a route names another server type the message leaves this node. How it
//! travels is up to the injected forwarder; the core only makes the decision.

use async_trait::async_trait;

use crate::protocol::{Message, RouteInfo};
use crate::session::SessionHandle;
use crate::types::Result;

/// Hands a resolved message to whatever transport reaches the owning node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteForwarder: Send + Sync {
    async fn forward(&self, session: &SessionHandle, route: &RouteInfo, message: Message) -> Result<()>;
}

/// Default forwarder: records the decision and drops the message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopForwarder;

#[async_trait]
impl RemoteForwarder for NoopForwarder {
    async fn forward(&self, session: &SessionHandle, route: &RouteInfo, message: Message) -> Result<()> {
        tracing::debug!(
            "no remote forwarder: dropping {:?} for {} from session {}",
            message.kind,
            route,
            session.id()
        );
        Ok(())
    }
}
