//! Transport layer
//!
//! A [`Transport`] is one point-to-point byte link. The [`TransportLayer`]
//! owns every live transport, addresses it by an integer [`ConnectionId`]
//! and exposes the whole table as a [`Channel`] to the layers above.
//!
//! Only TCP/IP is implemented. Other links (serial, Bluetooth) plug in by
//! implementing [`Transport`] and registering a factory.

mod connection;
mod tcp;

pub use connection::{ConnectionState, StateCell};
pub use tcp::TcpTransport;

use crate::channel::Channel;
use crate::registry::{ModuleRegistry, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identifier of a connection in the [`TransportLayer`]
pub type ConnectionId = u64;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Already listening")]
    AlreadyListening,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Unknown transport module: {0}")]
    UnknownModule(String),

    #[error("Timeout")]
    Timeout,
}

/// Network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IPv4 address, IPv6 address (contains ':') or host name
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Resolve to a socket address.
    ///
    /// Addresses containing ':' are IPv6 literals; anything else is an IPv4
    /// literal or a host name resolved to its first IPv4 address.
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        if self.address.contains(':') {
            let ip: Ipv6Addr = self
                .address
                .trim_matches(|c| c == '[' || c == ']')
                .parse()
                .map_err(|_| TransportError::InvalidAddress(self.address.clone()))?;
            return Ok(SocketAddr::new(IpAddr::V6(ip), self.port));
        }
        if let Ok(ip) = self.address.parse::<Ipv4Addr>() {
            return Ok(SocketAddr::new(IpAddr::V4(ip), self.port));
        }

        tokio::net::lookup_host((self.address.as_str(), self.port))
            .await
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", self.address, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TransportError::InvalidAddress(self.address.clone()))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// One point-to-point byte link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Start accepting a peer on `endpoint`; returns the bound endpoint
    async fn listen(&self, endpoint: &Endpoint) -> Result<Endpoint, TransportError>;

    /// Wait up to `timeout` for a peer to be connected
    async fn wait_established(&self, timeout: Duration) -> bool;

    /// Listen and wait for the first peer
    async fn receive_connection(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Endpoint, TransportError> {
        let bound = self.listen(endpoint).await?;
        if self.wait_established(timeout).await {
            Ok(bound)
        } else {
            Err(TransportError::Timeout)
        }
    }

    /// Send data
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Take up to `limit` received bytes, waiting up to `timeout`
    /// (`None`: do not wait)
    async fn read(&self, limit: Option<usize>, timeout: Option<Duration>) -> Bytes;

    /// Put bytes back in front of the received data
    async fn unread(&self, data: &[u8]);

    /// Close the link; safe to call repeatedly
    async fn disconnect(&self);

    fn state(&self) -> ConnectionState;
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Write timeout in seconds
    pub write_timeout: u64,
    /// Bytes requested per socket read
    pub receive_chunk: usize,
    /// Accept poll interval in milliseconds
    pub accept_poll: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            write_timeout: 60,
            receive_chunk: 4096,
            accept_poll: 100,
            nodelay: true,
        }
    }
}

/// Table of live connections
pub struct TransportLayer {
    modules: ModuleRegistry<TransportFactory>,
    config: TransportConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<dyn Transport>>>,
    next_id: AtomicU64,
}

impl TransportLayer {
    pub fn new(modules: ModuleRegistry<TransportFactory>, config: TransportConfig) -> Self {
        Self {
            modules,
            config,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn instantiate(&self, module: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let factory = self
            .modules
            .get(module)
            .ok_or_else(|| TransportError::UnknownModule(module.to_string()))?;
        Ok(factory(self.config.clone()))
    }

    async fn insert(&self, transport: Arc<dyn Transport>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections.write().await.insert(id, transport);
        id
    }

    /// The transport behind `connection`
    pub async fn transport(
        &self,
        connection: ConnectionId,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connections
            .read()
            .await
            .get(&connection)
            .cloned()
            .ok_or(TransportError::UnknownConnection(connection))
    }

    /// Open a connection to `endpoint` with the named module
    pub async fn connect(
        &self,
        module: &str,
        endpoint: &Endpoint,
    ) -> Result<ConnectionId, TransportError> {
        let transport = self.instantiate(module)?;
        transport.connect(endpoint).await?;

        let id = self.insert(transport).await;
        info!("Connection {} established to {} ({})", id, endpoint, module);
        Ok(id)
    }

    /// Start listening with the named module without waiting for a peer
    pub async fn listen(
        &self,
        module: &str,
        endpoint: &Endpoint,
    ) -> Result<(ConnectionId, Endpoint), TransportError> {
        let transport = self.instantiate(module)?;
        let bound = transport.listen(endpoint).await?;

        let id = self.insert(transport).await;
        info!("Connection {} listening on {} ({})", id, bound, module);
        Ok((id, bound))
    }

    /// Wait up to `timeout` for a listening connection to get its peer
    pub async fn wait_established(
        &self,
        connection: ConnectionId,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        Ok(self
            .transport(connection)
            .await?
            .wait_established(timeout)
            .await)
    }

    /// Listen on `endpoint` and wait for a peer
    pub async fn receive_connection(
        &self,
        module: &str,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<ConnectionId, TransportError> {
        let transport = self.instantiate(module)?;
        let bound = match transport.receive_connection(endpoint, timeout).await {
            Ok(bound) => bound,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };

        let id = self.insert(transport).await;
        info!("Connection {} accepted on {} ({})", id, bound, module);
        Ok(id)
    }

    /// Disconnect and forget a connection
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), TransportError> {
        let transport = self
            .connections
            .write()
            .await
            .remove(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        transport.disconnect().await;
        info!("Connection {} disconnected", connection);
        Ok(())
    }

    pub async fn state(&self, connection: ConnectionId) -> Result<ConnectionState, TransportError> {
        Ok(self.transport(connection).await?.state())
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Disconnect and forget every LOST or CLOSED connection; returns their ids
    pub async fn reap_lost(&self) -> Vec<ConnectionId> {
        let dead: Vec<(ConnectionId, Arc<dyn Transport>)> = {
            let mut connections = self.connections.write().await;
            let ids: Vec<ConnectionId> = connections
                .iter()
                .filter(|(_, transport)| {
                    matches!(
                        transport.state(),
                        ConnectionState::Lost | ConnectionState::Closed
                    )
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| connections.remove(&id).map(|transport| (id, transport)))
                .collect()
        };

        let mut reaped = Vec::with_capacity(dead.len());
        for (id, transport) in dead {
            debug!("Reaping connection {} ({})", id, transport.state());
            transport.disconnect().await;
            reaped.push(id);
        }
        reaped.sort_unstable();
        reaped
    }
}

#[async_trait]
impl Channel for TransportLayer {
    async fn send(&self, connection: ConnectionId, data: &[u8]) -> crate::Result<()> {
        Ok(self.transport(connection).await?.write(data).await?)
    }

    async fn receive(
        &self,
        connection: ConnectionId,
        limit: Option<usize>,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        Ok(self.transport(connection).await?.read(limit, timeout).await)
    }

    async fn restore(&self, connection: ConnectionId, data: Bytes) -> crate::Result<()> {
        self.transport(connection).await?.unread(&data).await;
        Ok(())
    }
}
