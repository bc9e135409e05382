//! Session orchestration
//!
//! A session is the full layer stack negotiated on top of one transport
//! connection:
//!
//! ```text
//! Datapackage  <- JSON packages for the application
//! Security     <- RSA handshake, promoted to AES
//! Protection   <- HTTP mimicry (or transparent)
//! Transport    <- owned by the caller, never closed here
//! ```
//!
//! [`CommunicationLayer::create_session`] builds and negotiates the stack
//! bottom-up; [`CommunicationLayer::stop_session`] tears it down top-down.

use crate::channel::Channel;
use crate::config::NegotiationConfig;
use crate::framing::{Datapackage, Package, ReceptionParameters};
use crate::protection::ProtectionLayer;
use crate::protocol::Role;
use crate::registry::ModuleSet;
use crate::security::{CryptographicModel, SecurityLayer};
use crate::transport::{ConnectionId, ConnectionState, TransportLayer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One negotiated layer stack
pub struct Session {
    id: Uuid,
    connection: ConnectionId,
    role: Role,
    protection: Arc<ProtectionLayer>,
    security: Arc<SecurityLayer>,
    packages: Datapackage,
    stopped: AtomicBool,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Loaded protection module name
    pub async fn protection_module(&self) -> Option<&'static str> {
        self.protection.loaded_module().await
    }

    /// Loaded security module name and model
    pub async fn security_module(&self) -> Option<(&'static str, CryptographicModel)> {
        self.security.loaded_module().await
    }

    /// Stop the package reader, then security, then protection. The
    /// transport connection stays open. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let residual = self.packages.stop().await;
        if !residual.is_empty() {
            debug!(
                "Session {}: discarding {} undelivered bytes",
                self.id,
                residual.len()
            );
        }
        self.security.stop().await;
        self.protection.stop().await;
        info!("Session {} stopped", self.id);
    }
}

/// Creates, addresses and stops sessions over a shared transport layer
pub struct CommunicationLayer {
    transport: Arc<TransportLayer>,
    modules: ModuleSet,
    negotiation: NegotiationConfig,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl CommunicationLayer {
    pub fn new(
        transport: Arc<TransportLayer>,
        modules: ModuleSet,
        negotiation: NegotiationConfig,
    ) -> Self {
        Self {
            transport,
            modules,
            negotiation,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<TransportLayer> {
        &self.transport
    }

    /// Negotiate protection and security on `connection` and open a package
    /// channel over them.
    ///
    /// Both peers must call this with opposite roles. On failure everything
    /// started for the session is stopped and the connection is left as it
    /// was.
    pub async fn create_session(&self, connection: ConnectionId, role: Role) -> crate::Result<Uuid> {
        self.transport.transport(connection).await?;
        info!("Connection {}: creating session as {}", connection, role);

        let transport: Arc<dyn Channel> = self.transport.clone();
        let protection = Arc::new(ProtectionLayer::new(
            transport,
            connection,
            self.modules.protection.clone(),
            self.negotiation.clone(),
        ));
        if let Err(e) = protection.negotiate(role).await {
            warn!("Connection {}: protection negotiation failed: {}", connection, e);
            protection.stop().await;
            return Err(e);
        }

        let security = Arc::new(SecurityLayer::new(
            protection.clone(),
            connection,
            self.modules.security.clone(),
            self.negotiation.clone(),
        ));
        if let Err(e) = security.negotiate(role).await {
            security.stop().await;
            protection.stop().await;
            return Err(e);
        }

        let packages = Datapackage::new(security.clone(), ReceptionParameters::new(connection));
        let id = Uuid::new_v4();
        let session = Arc::new(Session {
            id,
            connection,
            role,
            protection,
            security,
            packages,
            stopped: AtomicBool::new(false),
        });
        self.sessions.write().await.insert(id, session);

        info!("Session {} ready on connection {}", id, connection);
        Ok(id)
    }

    /// Look up a session
    pub async fn session(&self, id: Uuid) -> crate::Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(crate::Error::UnknownSession(id))
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Stop a session's layers. The session stays addressable, so stopping
    /// it again succeeds, until [`reap`](Self::reap) forgets it.
    pub async fn stop_session(&self, id: Uuid) -> crate::Result<()> {
        self.session(id).await?.stop().await;
        Ok(())
    }

    /// Send one package through a session
    pub async fn send(&self, id: Uuid, package: &Package) -> crate::Result<()> {
        let session = self.live_session(id).await?;
        if !self.established(session.connection).await {
            return Err(crate::Error::ConnectionClosed);
        }
        session.packages.send(package).await?;
        Ok(())
    }

    /// Send any value that serializes to a JSON object
    pub async fn send_message<T: Serialize>(&self, id: Uuid, message: &T) -> crate::Result<()> {
        let package = crate::framing::to_package(message)?;
        self.send(id, &package).await
    }

    /// Take the next package, waiting up to `timeout`.
    ///
    /// Once the connection is gone only packages already decoded are
    /// returned and the call no longer waits.
    pub async fn receive(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> crate::Result<Option<Package>> {
        let session = self.live_session(id).await?;
        let timeout = if self.established(session.connection).await {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        Ok(session.packages.receive(timeout).await)
    }

    /// Take the next package and decode it as `T`
    pub async fn receive_message<T: DeserializeOwned>(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> crate::Result<Option<T>> {
        match self.receive(id, timeout).await? {
            Some(package) => Ok(Some(
                serde_json::from_value(serde_json::Value::Object(package))
                    .map_err(crate::framing::FramingError::Deserialization)?,
            )),
            None => Ok(None),
        }
    }

    /// Stop and forget every session that was stopped or whose connection
    /// is no longer established; returns their ids
    pub async fn reap(&self) -> Vec<Uuid> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut reaped = Vec::new();
        for session in sessions {
            if session.is_stopped() || !self.established(session.connection).await {
                session.stop().await;
                self.sessions.write().await.remove(&session.id);
                reaped.push(session.id);
            }
        }
        if !reaped.is_empty() {
            debug!("Reaped {} sessions", reaped.len());
        }
        reaped
    }

    async fn live_session(&self, id: Uuid) -> crate::Result<Arc<Session>> {
        let session = self.session(id).await?;
        if session.is_stopped() {
            return Err(crate::Error::SessionStopped(id));
        }
        Ok(session)
    }

    async fn established(&self, connection: ConnectionId) -> bool {
        matches!(
            self.transport.state(connection).await,
            Ok(ConnectionState::Established)
        )
    }
}
