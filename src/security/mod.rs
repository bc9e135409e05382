//! Security layer
//!
//! Encrypts everything a session sends over its protection layer. Each
//! secured message travels as one length-prefixed record:
//!
//! ```text
//! +----------------+----------------------------+
//! | length (u32 BE)| output of the loaded module |
//! +----------------+----------------------------+
//! ```
//!
//! A decryptor worker cuts records out of the protection layer's clean
//! stream, opens them with the loaded module and appends the plaintext to
//! the layer's own clean buffer. Records that fail to open are dropped.
//!
//! The session starts under an asymmetric module whose keys are exchanged
//! in the clear, then [`SecurityLayer::negotiate`] promotes it to a
//! symmetric module whose key travels under the asymmetric one.

mod aes;
mod negotiation;
mod rsa;

pub use aes::{AesModule, AES_KEY_LEN, MIN_SECURED_LEN, TAG_LEN};
pub use rsa::{RsaModule, RSA_BLOCK_SIZE, RSA_KEY_BITS, RSA_MAX_CHUNK};

use crate::channel::Channel;
use crate::config::{ConfigError, Configurations, NegotiationConfig};
use crate::pipeline::{ByteBuffer, Running, Worker, IDLE_BACKOFF, STOP_GRACE};
use crate::protection::DEFAULT_MAX_PAYLOAD;
use crate::protocol::ProtocolError;
use crate::registry::ModuleRegistry;
use crate::transport::{ConnectionId, TransportError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Length of the record header
pub const RECORD_HEADER_LEN: usize = 4;

/// Largest record body accepted. A whole record, header included, fits in
/// one HTTP protection body.
pub const MAX_RECORD_SIZE: usize = DEFAULT_MAX_PAYLOAD - RECORD_HEADER_LEN;

/// Security errors
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Secured message of {0} bytes is truncated")]
    Truncated(usize),

    #[error("Ciphertext of {length} bytes is not a whole number of {block}-byte blocks")]
    Misaligned { length: usize, block: usize },

    #[error("Record of {length} bytes exceeds the {limit}-byte limit")]
    RecordTooLarge { length: usize, limit: usize },

    #[error("No security module loaded")]
    NoModule,

    #[error(transparent)]
    Settings(#[from] ConfigError),
}

/// Key model of a security module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptographicModel {
    /// Separate keys per direction; only public halves are exchanged
    Asymmetric,
    /// One shared secret
    Symmetric,
}

impl fmt::Display for CryptographicModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptographicModel::Asymmetric => write!(f, "ASYMMETRIC"),
            CryptographicModel::Symmetric => write!(f, "SYMMETRIC"),
        }
    }
}

/// Encryption algorithm
pub trait SecurityModule: Send + Sync {
    /// Registered module name
    fn name(&self) -> &'static str;

    fn model(&self) -> CryptographicModel;

    /// Encrypt one message
    fn secure(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError>;

    /// Decrypt one message produced by the peer's `secure`
    fn unsecure(&self, secured: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

/// Registry entry for a security module
#[derive(Clone, Copy)]
pub struct SecurityFactory {
    pub model: CryptographicModel,
    /// Fresh key material for this module
    pub generate: fn() -> Result<Configurations, SecurityError>,
    /// Module instance from an effective configuration
    pub build: fn(&Configurations) -> Result<Arc<dyn SecurityModule>, SecurityError>,
}

impl fmt::Debug for SecurityFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityFactory")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Prefix `secured` with its length
pub fn encode_record(secured: &[u8]) -> Result<BytesMut, SecurityError> {
    if secured.len() > MAX_RECORD_SIZE {
        return Err(SecurityError::RecordTooLarge {
            length: secured.len(),
            limit: MAX_RECORD_SIZE,
        });
    }
    let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + secured.len());
    record.put_u32(secured.len() as u32);
    record.extend_from_slice(secured);
    Ok(record)
}

/// Cut the next complete record body off the front of `raw`.
///
/// `Ok(None)` leaves `raw` untouched. A header announcing more than
/// [`MAX_RECORD_SIZE`] leaves no way to find the next record, so the whole
/// buffer is discarded.
pub fn next_record(raw: &mut BytesMut) -> Result<Option<Bytes>, SecurityError> {
    if raw.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let length = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if length > MAX_RECORD_SIZE {
        raw.clear();
        return Err(SecurityError::RecordTooLarge {
            length,
            limit: MAX_RECORD_SIZE,
        });
    }
    if raw.len() < RECORD_HEADER_LEN + length {
        return Ok(None);
    }
    raw.advance(RECORD_HEADER_LEN);
    Ok(Some(raw.split_to(length).freeze()))
}

/// Security layer bound to one connection
pub struct SecurityLayer {
    protection: Arc<dyn Channel>,
    connection: ConnectionId,
    modules: ModuleRegistry<SecurityFactory>,
    negotiation: NegotiationConfig,
    module: RwLock<Option<Arc<dyn SecurityModule>>>,
    decryptor: Mutex<Option<Worker<BytesMut>>>,
    clean: Arc<ByteBuffer>,
}

impl SecurityLayer {
    /// Create a layer over `protection`, the channel below it
    pub fn new(
        protection: Arc<dyn Channel>,
        connection: ConnectionId,
        modules: ModuleRegistry<SecurityFactory>,
        negotiation: NegotiationConfig,
    ) -> Self {
        Self {
            protection,
            connection,
            modules,
            negotiation,
            module: RwLock::new(None),
            decryptor: Mutex::new(None),
            clean: Arc::new(ByteBuffer::new()),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Name and model of the loaded module
    pub async fn loaded_module(&self) -> Option<(&'static str, CryptographicModel)> {
        self.module
            .read()
            .await
            .as_ref()
            .map(|module| (module.name(), module.model()))
    }

    /// Build the named module from `configurations` and start decrypting
    /// with it
    pub async fn load_module(
        &self,
        name: &str,
        configurations: &Configurations,
    ) -> crate::Result<()> {
        let factory = self
            .modules
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownModule(name.to_string()))?;
        let module = (factory.build)(configurations)?;

        self.halt_reception().await?;
        *self.module.write().await = Some(module.clone());
        self.clean.reopen();

        let decryptor = Worker::spawn("security-decryptor", {
            let protection = self.protection.clone();
            let clean = self.clean.clone();
            let connection = self.connection;
            let poll = self.negotiation.poll_interval();
            move |running| decrypt_routine(protection, connection, module, clean, poll, running)
        });
        *self.decryptor.lock().await = Some(decryptor);

        info!(
            "Connection {}: security module {} ({}) loaded",
            self.connection,
            name,
            factory.model
        );
        Ok(())
    }

    /// Stop decrypting while keeping the module for sending. Undecrypted
    /// bytes go back to the protection layer for whoever reads next.
    pub async fn halt_reception(&self) -> crate::Result<()> {
        let Some(mut decryptor) = self.decryptor.lock().await.take() else {
            return Ok(());
        };
        if let Some(raw) = decryptor.stop(STOP_GRACE).await {
            if !raw.is_empty() {
                debug!("Returning {} undecrypted bytes to protection", raw.len());
                self.protection.restore(self.connection, raw.freeze()).await?;
            }
        }
        Ok(())
    }

    /// Stop the loaded module. Safe to call repeatedly.
    pub async fn stop(&self) {
        if let Err(e) = self.halt_reception().await {
            debug!("Connection {}: residual not restored: {}", self.connection, e);
        }
        self.clean.close();
        if self.module.write().await.take().is_some() {
            info!("Connection {}: security stopped", self.connection);
        }
    }

    fn check_connection(&self, connection: ConnectionId) -> crate::Result<()> {
        if connection != self.connection {
            return Err(TransportError::UnknownConnection(connection).into());
        }
        Ok(())
    }
}

async fn decrypt_routine(
    protection: Arc<dyn Channel>,
    connection: ConnectionId,
    module: Arc<dyn SecurityModule>,
    clean: Arc<ByteBuffer>,
    poll: Duration,
    running: Running,
) -> BytesMut {
    let mut raw = BytesMut::new();

    while running.get() {
        let chunk = match protection.receive(connection, None, Some(poll)).await {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!("Security reader: receive on {} failed: {}", connection, e);
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
            match next_record(&mut raw) {
                Ok(Some(record)) => match module.unsecure(&record) {
                    Ok(plaintext) => {
                        trace!("Decrypted {} bytes", plaintext.len());
                        clean.extend(&plaintext).await;
                    }
                    Err(e) => warn!("Connection {}: dropping record: {}", connection, e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Connection {}: discarding stream: {}", connection, e);
                    break;
                }
            }
        }
    }

    raw
}

#[async_trait]
impl Channel for SecurityLayer {
    async fn send(&self, connection: ConnectionId, data: &[u8]) -> crate::Result<()> {
        self.check_connection(connection)?;
        let module = self
            .module
            .read()
            .await
            .clone()
            .ok_or(SecurityError::NoModule)?;

        let record = encode_record(&module.secure(data)?)?;
        self.protection.send(self.connection, &record).await
    }

    async fn receive(
        &self,
        connection: ConnectionId,
        limit: Option<usize>,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        self.check_connection(connection)?;
        if self.module.read().await.is_none() {
            return Err(SecurityError::NoModule.into());
        }
        Ok(self.clean.read(limit, timeout).await)
    }

    async fn restore(&self, connection: ConnectionId, data: Bytes) -> crate::Result<()> {
        self.check_connection(connection)?;
        self.clean.unread(&data).await;
        Ok(())
    }
}
