//! Tunnel Stack Client
//!
//! The ACTIVE peer:
//! - Connects to the configured server
//! - Negotiates protection and security as the initiator
//! - Sends `{"cmd":"ping"}`, or each JSON object given on the command line,
//!   and prints the reply to each

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tunnel_stack::config::{generate_example_config, Config};
use tunnel_stack::framing::Package;
use tunnel_stack::protocol::Role;
use tunnel_stack::transport::{Endpoint, TransportLayer};
use tunnel_stack::{CommunicationLayer, ModuleSet};

/// Tunnel Stack Client - ACTIVE peer that sends packages
#[derive(Parser, Debug)]
#[command(name = "stack-client")]
#[command(about = "Tunnel Stack Client - negotiates a session and sends packages")]
#[command(version)]
struct Args {
    /// JSON objects to send; defaults to {"cmd":"ping"}
    messages: Vec<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    write_config: Option<String>,

    /// Server address (overrides config)
    #[arg(short, long)]
    address: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 10)]
    reply_timeout: u64,

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

    let messages = parse_messages(&args.messages)?;

    let mut client = config.client.clone().unwrap_or_default();
    if let Some(address) = args.address {
        client.address = address;
    }
    if let Some(port) = args.port {
        client.port = port;
    }

    let modules = ModuleSet::standard();
    let transport = Arc::new(TransportLayer::new(
        modules.transport.clone(),
        config.transport.clone(),
    ));
    let communication =
        CommunicationLayer::new(transport.clone(), modules, config.negotiation.clone());

    info!("Tunnel Stack Client v{}", tunnel_stack::VERSION);

    let endpoint = Endpoint::new(client.address.clone(), client.port);
    let connection = transport
        .connect(&client.transport_module, &endpoint)
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let outcome = exchange(
        &communication,
        connection,
        &messages,
        Duration::from_secs(args.reply_timeout),
    )
    .await;

    transport.disconnect(connection).await.ok();
    outcome
}

/// Parse every argument as a JSON object
fn parse_messages(arguments: &[String]) -> Result<Vec<Package>> {
    if arguments.is_empty() {
        let mut ping = Package::new();
        ping.insert("cmd".to_string(), json!("ping"));
        return Ok(vec![ping]);
    }

    arguments
        .iter()
        .map(|argument| {
            match serde_json::from_str::<Value>(argument)
                .with_context(|| format!("Not valid JSON: {}", argument))?
            {
                Value::Object(package) => Ok(package),
                _ => Err(anyhow!("Not a JSON object: {}", argument)),
            }
        })
        .collect()
}

/// Negotiate a session, send every message and print each reply
async fn exchange(
    communication: &CommunicationLayer,
    connection: tunnel_stack::transport::ConnectionId,
    messages: &[Package],
    reply_timeout: Duration,
) -> Result<()> {
    let session = communication
        .create_session(connection, Role::Active)
        .await
        .context("Session negotiation failed")?;

    for message in messages {
        communication
            .send(session, message)
            .await
            .context("Failed to send package")?;

        match communication.receive(session, Some(reply_timeout)).await? {
            Some(reply) => println!("{}", Value::Object(reply)),
            None => warn!("No reply within {:?}", reply_timeout),
        }
    }

    communication.stop_session(session).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages() {
        let default = parse_messages(&[]).unwrap();
        assert_eq!(Value::Object(default[0].clone()), json!({"cmd": "ping"}));

        let parsed = parse_messages(&[r#"{"cmd":"status","n":1}"#.to_string()]).unwrap();
        assert_eq!(parsed[0]["n"], json!(1));

        assert!(parse_messages(&["[1,2]".to_string()]).is_err());
        assert!(parse_messages(&["{oops".to_string()]).is_err());
    }
}
