//! Protection layer
//!
//! Disguises the byte stream of one connection as an unrelated protocol. The
//! loaded [`ProtectionModule`] wraps every outgoing write; a reassembly worker
//! pulls raw transport bytes, cuts complete disguise frames out of them and
//! appends the payloads to the layer's clean buffer.
//!
//! The module is chosen by [`ProtectionLayer::negotiate`], which runs a
//! transient package handler directly on the transport.

mod http;
mod transparent;

pub use http::{HttpProtection, DEFAULT_MAX_PAYLOAD, HEADER_TERMINATOR, MAX_HEADER_SIZE};
pub use transparent::TransparentProtection;

use crate::channel::Channel;
use crate::config::NegotiationConfig;
use crate::framing::{encode_package, to_package, Datapackage, ReceptionParameters};
use crate::pipeline::{ByteBuffer, Running, Worker, IDLE_BACKOFF, STOP_GRACE};
use crate::protocol::{receive_negotiation, Negotiation, ProtocolError, Role};
use crate::registry::{ModuleRegistry, ProtectionFactory};
use crate::transport::{ConnectionId, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Protection errors
#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("Header block has no Content-Length")]
    MissingContentLength,

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("No header terminator within {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Payload of {length} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { length: usize, limit: usize },

    #[error("Not a single complete frame")]
    Malformed,

    #[error("No protection module loaded")]
    NoModule,
}

/// Disguise algorithm
pub trait ProtectionModule: Send + Sync {
    /// Registered module name
    fn name(&self) -> &'static str;

    /// Wrap one payload into one disguise frame
    fn protect(&self, payload: &[u8]) -> Bytes;

    /// Cut the next complete frame off the front of `raw` and return its
    /// payload.
    ///
    /// `Ok(None)` means more bytes are needed and `raw` is untouched. An error
    /// means unusable bytes were purged from `raw`; calling again continues
    /// with what follows them.
    fn extract(&self, raw: &mut BytesMut) -> Result<Option<Bytes>, ProtectionError>;

    /// Payload of exactly one complete frame
    fn unprotect(&self, frame: &[u8]) -> Result<Bytes, ProtectionError> {
        let mut raw = BytesMut::from(frame);
        match self.extract(&mut raw)? {
            Some(payload) if raw.is_empty() => Ok(payload),
            _ => Err(ProtectionError::Malformed),
        }
    }
}

/// Protection layer bound to one connection
pub struct ProtectionLayer {
    transport: Arc<dyn Channel>,
    connection: ConnectionId,
    modules: ModuleRegistry<ProtectionFactory>,
    negotiation: NegotiationConfig,
    module: RwLock<Option<Arc<dyn ProtectionModule>>>,
    reassembler: Mutex<Option<Worker<BytesMut>>>,
    clean: Arc<ByteBuffer>,
}

impl ProtectionLayer {
    pub fn new(
        transport: Arc<dyn Channel>,
        connection: ConnectionId,
        modules: ModuleRegistry<ProtectionFactory>,
        negotiation: NegotiationConfig,
    ) -> Self {
        Self {
            transport,
            connection,
            modules,
            negotiation,
            module: RwLock::new(None),
            reassembler: Mutex::new(None),
            clean: Arc::new(ByteBuffer::new()),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Name of the loaded module
    pub async fn loaded_module(&self) -> Option<&'static str> {
        self.module.read().await.as_ref().map(|module| module.name())
    }

    /// Instantiate the named module and start reassembling with it
    pub async fn load_module(&self, name: &str) -> crate::Result<()> {
        let factory = self
            .modules
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownModule(name.to_string()))?;
        let module = factory();

        self.stop_reassembler().await?;
        *self.module.write().await = Some(module.clone());
        self.clean.reopen();

        let reassembler = Worker::spawn("protection-reassembler", {
            let transport = self.transport.clone();
            let clean = self.clean.clone();
            let connection = self.connection;
            let poll = self.negotiation.poll_interval();
            move |running| reassemble_routine(transport, connection, module, clean, poll, running)
        });
        *self.reassembler.lock().await = Some(reassembler);

        info!("Connection {}: protection module {} loaded", self.connection, name);
        Ok(())
    }

    /// Stop the reassembler and give its unparsed raw bytes back to the transport
    async fn stop_reassembler(&self) -> crate::Result<()> {
        let Some(mut reassembler) = self.reassembler.lock().await.take() else {
            return Ok(());
        };
        if let Some(raw) = reassembler.stop(STOP_GRACE).await {
            if !raw.is_empty() {
                debug!("Returning {} raw bytes to the transport", raw.len());
                self.transport.restore(self.connection, raw.freeze()).await?;
            }
        }
        Ok(())
    }

    /// Stop the loaded module. Safe to call repeatedly.
    pub async fn stop(&self) {
        if let Err(e) = self.stop_reassembler().await {
            debug!("Connection {}: residual not restored: {}", self.connection, e);
        }
        self.clean.close();
        if self.module.write().await.take().is_some() {
            info!("Connection {}: protection stopped", self.connection);
        }
    }

    /// Agree on a module with the peer and load it; returns its name
    pub async fn negotiate(&self, role: Role) -> crate::Result<String> {
        let handler = Datapackage::new(
            self.transport.clone(),
            ReceptionParameters {
                connection: self.connection,
                limit: None,
                timeout: self.negotiation.poll_interval(),
            },
        );

        let outcome = match role {
            Role::Passive => self.advertise(&handler).await,
            Role::Active => self.choose(&handler).await,
        };

        let residual = handler.stop().await;
        self.transport.restore(self.connection, residual).await?;

        let name = outcome?;
        self.load_module(&name).await?;
        Ok(name)
    }

    async fn advertise(&self, handler: &Datapackage) -> crate::Result<String> {
        let available = self.modules.names();
        debug!("Connection {}: offering protection {:?}", self.connection, available);
        handler
            .send_message(&Negotiation::AvailableModules(available))
            .await?;

        let selected = receive_negotiation(handler, self.timeout(), "SELECTED_MODULE")
            .await?
            .into_selected()?;
        if !self.modules.contains(&selected) {
            return Err(ProtocolError::UnknownModule(selected).into());
        }
        Ok(selected)
    }

    async fn choose(&self, handler: &Datapackage) -> crate::Result<String> {
        let offered = receive_negotiation(handler, self.timeout(), "AVAILABLE_MODULES")
            .await?
            .into_available()?;
        let selected = self
            .modules
            .select(&offered, |_| true)
            .ok_or_else(|| ProtocolError::NoCompatibleModule(offered.clone()))?
            .to_string();

        // The peer switches to the selected module as soon as it reads the
        // selection, so nothing may still be reading raw packages by then
        let residual = handler.stop().await;
        self.transport.restore(self.connection, residual).await?;

        let selection = encode_package(&to_package(&Negotiation::SelectedModule(
            selected.clone(),
        ))?)?;
        self.transport.send(self.connection, &selection).await?;
        Ok(selected)
    }

    fn timeout(&self) -> Duration {
        self.negotiation.message_timeout()
    }

    fn check_connection(&self, connection: ConnectionId) -> crate::Result<()> {
        if connection != self.connection {
            return Err(TransportError::UnknownConnection(connection).into());
        }
        Ok(())
    }
}

async fn reassemble_routine(
    transport: Arc<dyn Channel>,
    connection: ConnectionId,
    module: Arc<dyn ProtectionModule>,
    clean: Arc<ByteBuffer>,
    poll: Duration,
    running: Running,
) -> BytesMut {
    let mut raw = BytesMut::new();

    while running.get() {
        let chunk = match transport.receive(connection, None, Some(poll)).await {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!("Protection reader: receive on {} failed: {}", connection, e);
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }
        };
        if chunk.is_empty() {
            tokio::time::sleep(IDLE_BACKOFF).await;
            continue;
        }
        raw.extend_from_slice(&chunk);

        loop {
            match module.extract(&mut raw) {
                Ok(Some(payload)) => {
                    trace!("Unprotected {} bytes", payload.len());
                    clean.extend(&payload).await;
                }
                Ok(None) => break,
                Err(e) => warn!("Connection {}: dropping protected frame: {}", connection, e),
            }
        }
    }

    raw
}

#[async_trait]
impl Channel for ProtectionLayer {
    async fn send(&self, connection: ConnectionId, data: &[u8]) -> crate::Result<()> {
        self.check_connection(connection)?;
        let module = self
            .module
            .read()
            .await
            .clone()
            .ok_or(ProtectionError::NoModule)?;

        let frame = module.protect(data);
        self.transport.send(self.connection, &frame).await
    }

    async fn receive(
        &self,
        connection: ConnectionId,
        limit: Option<usize>,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        self.check_connection(connection)?;
        if self.module.read().await.is_none() {
            return Err(ProtectionError::NoModule.into());
        }
        Ok(self.clean.read(limit, timeout).await)
    }

    async fn restore(&self, connection: ConnectionId, data: Bytes) -> crate::Result<()> {
        self.check_connection(connection)?;
        self.clean.unread(&data).await;
        Ok(())
    }
}
