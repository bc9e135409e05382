//! Asymmetric to symmetric promotion
//!
//! ```text
//! PASSIVE                                   ACTIVE
//!   -- in the clear, over protection --
//!   AVAILABLE_MODULES [asymmetric] ------->
//!                    <------------------- SELECTED_MODULE
//!   MODULE_CONFIGURATIONS (public) <-----> MODULE_CONFIGURATIONS (public)
//!   -- under the asymmetric module --
//!   SIGNAL READY_FOR_SIMMETRIC ----------->
//!                    <------------------- SIGNAL READY_FOR_SIMMETRIC
//!   AVAILABLE_MODULES [symmetric] -------->
//!                    <------------------- SELECTED_MODULE
//!                    <------------------- MODULE_CONFIGURATIONS (key)
//!   -- under the symmetric module --
//!   SIGNAL SIMMETRIC_ESTABLISHED --------->
//! ```
//!
//! Every package is read by a transient handler on the channel it travels
//! over. A handler is stopped, and its residual bytes handed back, before
//! the peer can start sending under a different module.

use super::{CryptographicModel, SecurityFactory, SecurityLayer};
use crate::channel::Channel;
use crate::config::Configurations;
use crate::framing::{encode_package, to_package, Datapackage, ReceptionParameters};
use crate::protocol::{
    receive_negotiation, Negotiation, ProtocolError, Role, READY_FOR_SIMMETRIC,
    SIMMETRIC_ESTABLISHED,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn asymmetric(factory: &SecurityFactory) -> bool {
    factory.model == CryptographicModel::Asymmetric
}

fn symmetric(factory: &SecurityFactory) -> bool {
    factory.model == CryptographicModel::Symmetric
}

impl SecurityLayer {
    /// Exchange asymmetric keys, then agree on a symmetric module and load
    /// it; returns the symmetric module's name.
    ///
    /// On failure every module and handler started here is stopped.
    pub async fn negotiate(self: &Arc<Self>, role: Role) -> crate::Result<String> {
        let outcome = self.promote(role).await;
        if let Err(e) = &outcome {
            warn!(
                "Connection {}: security negotiation as {} failed: {}",
                self.connection, role, e
            );
            self.stop().await;
        }
        outcome
    }

    async fn promote(self: &Arc<Self>, role: Role) -> crate::Result<String> {
        let clear = self.handler_on(self.protection.clone());
        let exchanged = self.exchange_asymmetric(&clear, role).await;
        self.release(&clear, &self.protection).await?;

        let (asymmetric_name, effective) = exchanged?;
        self.load_module(&asymmetric_name, &effective).await?;

        let secured: Arc<dyn Channel> = self.clone();
        let handler = self.handler_on(secured.clone());
        let promoted = match role {
            Role::Passive => self.promote_passive(&handler, &secured).await,
            Role::Active => self.promote_active(&handler, &secured).await,
        };
        self.release(&handler, &secured).await?;

        let name = promoted?;
        info!(
            "Connection {}: promoted from {} to {}",
            self.connection, asymmetric_name, name
        );
        Ok(name)
    }

    /// Agree on an asymmetric module and swap public keys. Returns the
    /// module name and the effective configuration: own private key plus
    /// the peer's public key.
    async fn exchange_asymmetric(
        &self,
        handler: &Datapackage,
        role: Role,
    ) -> crate::Result<(String, Configurations)> {
        let selected = match role {
            Role::Passive => {
                let available = self.modules.names_matching(asymmetric);
                debug!("Connection {}: offering asymmetric {:?}", self.connection, available);
                handler
                    .send_message(&Negotiation::AvailableModules(available))
                    .await?;
                let selected = receive_negotiation(handler, self.timeout(), "SELECTED_MODULE")
                    .await?
                    .into_selected()?;
                self.check_offered(&selected, asymmetric)?;
                selected
            }
            Role::Active => {
                let offered = receive_negotiation(handler, self.timeout(), "AVAILABLE_MODULES")
                    .await?
                    .into_available()?;
                let selected = self
                    .modules
                    .select(&offered, asymmetric)
                    .ok_or_else(|| ProtocolError::NoCompatibleModule(offered.clone()))?
                    .to_string();
                handler
                    .send_message(&Negotiation::SelectedModule(selected.clone()))
                    .await?;
                selected
            }
        };

        let mut own = self.generate(&selected).await?;
        handler
            .send_message(&Negotiation::ModuleConfigurations(own.public_view().to_dict()?))
            .await?;

        let peer = receive_negotiation(handler, self.timeout(), "MODULE_CONFIGURATIONS")
            .await?
            .into_configurations()?;
        own.merge(Configurations::from_dict(&peer)?.public_view());
        Ok((selected, own))
    }

    async fn promote_passive(
        &self,
        handler: &Datapackage,
        secured: &Arc<dyn Channel>,
    ) -> crate::Result<String> {
        handler
            .send_message(&Negotiation::Signal(READY_FOR_SIMMETRIC.into()))
            .await?;
        receive_negotiation(handler, self.timeout(), READY_FOR_SIMMETRIC)
            .await?
            .expect_signal(READY_FOR_SIMMETRIC)?;

        let available = self.modules.names_matching(symmetric);
        debug!("Connection {}: offering symmetric {:?}", self.connection, available);
        handler
            .send_message(&Negotiation::AvailableModules(available))
            .await?;

        let selected = receive_negotiation(handler, self.timeout(), "SELECTED_MODULE")
            .await?
            .into_selected()?;
        self.check_offered(&selected, symmetric)?;
        let configurations = receive_negotiation(handler, self.timeout(), "MODULE_CONFIGURATIONS")
            .await?
            .into_configurations()?;
        let configurations = Configurations::from_dict(&configurations)?;

        // Nothing more arrives under the asymmetric module
        self.release(handler, secured).await?;
        self.halt_reception().await?;
        tokio::time::sleep(self.negotiation.settle_delay()).await;

        self.load_module(&selected, &configurations).await?;
        self.send_direct(&Negotiation::Signal(SIMMETRIC_ESTABLISHED.into()))
            .await?;
        Ok(selected)
    }

    async fn promote_active(
        &self,
        handler: &Datapackage,
        secured: &Arc<dyn Channel>,
    ) -> crate::Result<String> {
        receive_negotiation(handler, self.timeout(), READY_FOR_SIMMETRIC)
            .await?
            .expect_signal(READY_FOR_SIMMETRIC)?;
        handler
            .send_message(&Negotiation::Signal(READY_FOR_SIMMETRIC.into()))
            .await?;

        let offered = receive_negotiation(handler, self.timeout(), "AVAILABLE_MODULES")
            .await?
            .into_available()?;
        let selected = self
            .modules
            .select(&offered, symmetric)
            .ok_or_else(|| ProtocolError::NoCompatibleModule(offered.clone()))?
            .to_string();
        let configurations = self.generate(&selected).await?;

        // The peer answers under the symmetric module, which must be
        // decrypting by then
        self.release(handler, secured).await?;
        self.halt_reception().await?;
        self.send_direct(&Negotiation::SelectedModule(selected.clone()))
            .await?;
        self.send_direct(&Negotiation::ModuleConfigurations(configurations.to_dict()?))
            .await?;
        self.load_module(&selected, &configurations).await?;

        let confirmation = self.handler_on(secured.clone());
        let confirmed = receive_negotiation(&confirmation, self.timeout(), SIMMETRIC_ESTABLISHED)
            .await
            .and_then(|message| Ok(message.expect_signal(SIMMETRIC_ESTABLISHED)?));
        self.release(&confirmation, secured).await?;
        confirmed?;

        Ok(selected)
    }

    /// Fresh key material for `name`, generated off the executor
    async fn generate(&self, name: &str) -> crate::Result<Configurations> {
        let factory = *self
            .modules
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownModule(name.to_string()))?;
        let configurations = tokio::task::spawn_blocking(factory.generate)
            .await
            .map_err(|e| super::SecurityError::KeyGeneration(e.to_string()))??;
        Ok(configurations)
    }

    fn check_offered(
        &self,
        name: &str,
        predicate: fn(&SecurityFactory) -> bool,
    ) -> Result<(), ProtocolError> {
        match self.modules.get(name) {
            Some(factory) if predicate(factory) => Ok(()),
            _ => Err(ProtocolError::UnknownModule(name.to_string())),
        }
    }

    /// Write one negotiation package under the loaded module without a
    /// handler
    async fn send_direct(&self, message: &Negotiation) -> crate::Result<()> {
        let frame = encode_package(&to_package(message)?)?;
        self.send(self.connection, &frame).await
    }

    fn handler_on(&self, channel: Arc<dyn Channel>) -> Datapackage {
        Datapackage::new(
            channel,
            ReceptionParameters {
                connection: self.connection,
                limit: None,
                timeout: self.negotiation.poll_interval(),
            },
        )
    }

    /// Stop `handler` and give what it read but did not deliver back to
    /// `channel`
    async fn release(&self, handler: &Datapackage, channel: &Arc<dyn Channel>) -> crate::Result<()> {
        let residual = handler.stop().await;
        channel.restore(self.connection, residual).await
    }

    fn timeout(&self) -> Duration {
        self.negotiation.message_timeout()
    }
}
