//! # Tunnel Stack
//!
//! A negotiated, layered tunneling stack. Two peers, an ACTIVE initiator and
//! a PASSIVE responder, stack pluggable layers on top of one raw connection,
//! agree at runtime on the algorithm each layer uses, and then exchange
//! JSON packages over the result.
//!
//! ## Features
//!
//! - **Runtime negotiation** of every layer from a static module registry
//! - **HTTP mimicry** with Content-Length driven reassembly
//! - **RSA-2048-OAEP handshake** promoted to **AES-256-GCM**
//! - **Residual-preserving module swaps**: no buffered byte is lost when a
//!   layer changes algorithm mid-stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Datapackage Layer                   │
//! │       (JSON packages, 6-byte delimiter framing)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Security Layer                     │
//! │   (RSA key exchange, promotion to AES-256-GCM)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Protection Layer                    │
//! │        (HTTP request mimicry, transparent)           │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │          (connection table, TCP/IP module)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every layer exposes the same [`channel::Channel`] surface to the one
//! above it, and every buffering stage runs as its own background task.

pub mod channel;
pub mod config;
pub mod framing;
pub mod pipeline;
pub mod protection;
pub mod protocol;
pub mod registry;
pub mod security;
pub mod session;
pub mod transport;

pub use config::Config;
pub use registry::ModuleSet;
pub use session::{CommunicationLayer, Session};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Protection error: {0}")]
    Protection(#[from] protection::ProtectionError),

    #[error("Security error: {0}")]
    Security(#[from] security::SecurityError),

    #[error("Framing error: {0}")]
    Framing(#[from] framing::FramingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unknown session: {0}")]
    UnknownSession(uuid::Uuid),

    #[error("Session {0} is stopped")]
    SessionStopped(uuid::Uuid),

    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_errors_convert() {
        let error: Error = transport::TransportError::NotConnected.into();
        assert!(matches!(error, Error::Transport(_)));

        let error: Error = security::SecurityError::Truncated(3).into();
        assert!(matches!(error, Error::Security(security::SecurityError::Truncated(3))));

        let id = uuid::Uuid::new_v4();
        assert_eq!(
            Error::SessionStopped(id).to_string(),
            format!("Session {} is stopped", id)
        );
        assert_eq!(Error::ConnectionClosed.to_string(), "Connection closed");
    }
}
