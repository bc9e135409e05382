//! Tunnel Stack Server
//!
//! The PASSIVE peer:
//! - Waits for a peer on the configured endpoint
//! - Negotiates protection and security as the responder
//! - Echoes every package back as `{"echo": package}`
//!
//! Peers are served one at a time; when a peer leaves the server listens
//! again.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tunnel_stack::config::{generate_example_config, Config, ServerConfig};
use tunnel_stack::protocol::Role;
use tunnel_stack::transport::{ConnectionId, ConnectionState, Endpoint, TransportError, TransportLayer};
use tunnel_stack::{CommunicationLayer, ModuleSet};

/// How long one listen attempt waits for a peer before re-arming
const ACCEPT_WINDOW: Duration = Duration::from_secs(60);

/// How long one receive waits before the connection is checked again
const RECEIVE_WINDOW: Duration = Duration::from_secs(1);

/// Tunnel Stack Server - PASSIVE peer that echoes packages
#[derive(Parser, Debug)]
#[command(name = "stack-server")]
#[command(about = "Tunnel Stack Server - negotiates sessions and echoes packages")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    write_config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    address: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.write_config {
        generate_example_config()
            .save(path)
            .with_context(|| format!("Failed to write example config to {}", path))?;
        println!("Example configuration written to {}", path);
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_deref().unwrap_or(&config.logging.level))
        .init();

    let mut server = config.server.clone().unwrap_or_default();
    if let Some(address) = args.address {
        server.address = address;
    }
    if let Some(port) = args.port {
        server.port = port;
    }

    let modules = ModuleSet::standard();
    let transport = Arc::new(TransportLayer::new(
        modules.transport.clone(),
        config.transport.clone(),
    ));
    let communication = CommunicationLayer::new(transport, modules, config.negotiation.clone());

    info!("Tunnel Stack Server v{}", tunnel_stack::VERSION);

    tokio::select! {
        result = serve(&communication, &server) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            for id in communication.session_ids().await {
                communication.stop_session(id).await.ok();
            }
            for connection in communication.transport().connection_ids().await {
                communication.transport().disconnect(connection).await.ok();
            }
            Ok(())
        }
    }
}

/// Accept peers one after another
async fn serve(communication: &CommunicationLayer, server: &ServerConfig) -> Result<()> {
    let endpoint = Endpoint::new(server.address.clone(), server.port);
    let transport = communication.transport();

    loop {
        info!("Listening on {} ({})", endpoint, server.transport_module);
        let connection = match transport
            .receive_connection(&server.transport_module, &endpoint, ACCEPT_WINDOW)
            .await
        {
            Ok(connection) => connection,
            Err(TransportError::Timeout) => {
                debug!("No peer within {:?}, listening again", ACCEPT_WINDOW);
                continue;
            }
            Err(e) => return Err(e).context("Failed to listen"),
        };

        if let Err(e) = handle_connection(communication, connection).await {
            warn!("Connection {} ended: {:#}", connection, e);
        }

        communication.reap().await;
        transport.disconnect(connection).await.ok();
    }
}

/// Negotiate a session on `connection` and echo until the peer leaves
async fn handle_connection(
    communication: &CommunicationLayer,
    connection: ConnectionId,
) -> Result<()> {
    let session = communication
        .create_session(connection, Role::Passive)
        .await
        .context("Session negotiation failed")?;

    loop {
        match communication.receive(session, Some(RECEIVE_WINDOW)).await? {
            Some(package) => {
                info!("Received {}", serde_json::Value::Object(package.clone()));
                if let Err(e) = communication
                    .send_message(session, &json!({ "echo": package }))
                    .await
                {
                    error!("Echo failed: {}", e);
                }
            }
            None => {
                let state = communication.transport().state(connection).await?;
                if state != ConnectionState::Established {
                    info!("Peer left (connection {})", state);
                    break;
                }
            }
        }
    }

    communication.stop_session(session).await?;
    Ok(())
}
