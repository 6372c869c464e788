//! Meshgate node server - main entry point.
//!
//! Loads configuration, applies command-line overrides and serves the
//! configured address until Ctrl-C.

use clap::Parser;
use meshgate::{Config, HandlerRegistry, NodeContext, Role, Server};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "meshgate-server", about = "Message-routing node server")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "MESHGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the server type this node serves.
    #[arg(long)]
    server_type: Option<String>,

    /// Override the cluster role.
    #[arg(long, value_parser = parse_role)]
    role: Option<Role>,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw {
        "frontend" => Ok(Role::Frontend),
        "backend" => Ok(Role::Backend),
        other => Err(format!("unknown role '{}' (expected frontend or backend)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(server_type) = args.server_type {
        config.server.server_type = server_type;
    }
    if let Some(role) = args.role {
        config.server.role = role;
    }

    meshgate::observability::init_tracing(&config.observability);

    let sessions = NodeContext::session_registry(&config);
    // The stock binary serves no components of its own.
    let handlers = HandlerRegistry::new();
    tracing::warn!("no handlers registered; local routes will be dropped");
    let ctx = NodeContext::new(config, sessions, handlers)?;

    let server = Server::new(ctx);
    let stop = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stop.cancel(),
            Err(e) => tracing::error!("ctrl-c handler failed: {}", e),
        }
    });

    server.serve().await?;
    Ok(())
}
