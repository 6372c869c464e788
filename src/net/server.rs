//! TCP server: accept loop handing each connection its own tasks.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::net::connection::handle_connection;
use crate::net::heartbeat::HeartbeatMonitor;
use crate::node::NodeContext;
use crate::types::Result;

/// Front door of a node: accepts connections and runs them against the context.
#[derive(Debug)]
pub struct Server {
    ctx: NodeContext,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Bind the configured address and serve until shut down.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.ctx.config.server.listen_addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener until shut down.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        let net = &self.ctx.config.net;
        let conn_semaphore = Arc::new(Semaphore::new(net.max_connections));
        tracing::info!(
            "{} server '{}' listening on {} (max_connections={})",
            self.ctx.config.server.role,
            self.ctx.config.server.server_type,
            listener.local_addr()?,
            net.max_connections,
        );
        self.ctx.handlers.dump();

        let mut monitor = HeartbeatMonitor::new(
            self.ctx.sessions.clone(),
            net.heartbeat_sweep_interval,
        );
        let monitor_task = monitor.start();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };

                    // Acquire connection permit (refuse when at capacity).
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                net.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("connection from {} (active={})",
                        peer,
                        net.max_connections - conn_semaphore.available_permits(),
                    );
                    let ctx = self.ctx.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(handle_connection(stream, peer, ctx, cancel, permit));
                }
            }
        }

        monitor.stop();
        if let Err(e) = monitor_task.await {
            tracing::error!("heartbeat monitor failed: {}", e);
        }
        let closed = self.ctx.sessions.close_all();
        tracing::info!("closed {} sessions on shutdown", closed);
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
