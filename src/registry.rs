//! Module registry
//!
//! Each layer picks its algorithm by name from a registry of factories.
//! Registration order is the order modules are advertised during
//! negotiation, so the first registered module is the preferred one.

use crate::protection::{HttpProtection, ProtectionModule, TransparentProtection};
use crate::security::{AesModule, RsaModule, SecurityFactory};
use crate::transport::{TcpTransport, Transport, TransportConfig};
use std::fmt;
use std::sync::Arc;

pub const TRANSPORT_TCP_IP: &str = "TRANSPORT_TCP_IP";
pub const HTTP_PROTECTION: &str = "HTTP_PROTECTION";
pub const TRANSPARENT_PROTECTION: &str = "TRANSPARENT_PROTECTION";
pub const SECURITY_RSA: &str = "SECURITY_RSA";
pub const SECURITY_AES: &str = "SECURITY_AES";

/// Builds a transport instance
pub type TransportFactory = fn(TransportConfig) -> Arc<dyn Transport>;

/// Builds a protection module instance
pub type ProtectionFactory = fn() -> Arc<dyn ProtectionModule>;

/// Ordered name -> factory table
#[derive(Clone)]
pub struct ModuleRegistry<F> {
    entries: Vec<(String, F)>,
}

impl<F> ModuleRegistry<F> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `factory` under `name`. Re-registering a name replaces the
    /// factory and keeps its position.
    pub fn register(&mut self, name: &str, factory: F) -> &mut Self {
        match self.entries.iter_mut().find(|(existing, _)| existing.as_str() == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name.to_string(), factory)),
        }
        self
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Names whose factory satisfies `predicate`, in registration order
    pub fn names_matching(&self, predicate: impl Fn(&F) -> bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, factory)| predicate(factory))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&F> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, factory)| factory)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First name in `offered` that is registered with a factory satisfying
    /// `predicate`
    pub fn select<'a>(
        &self,
        offered: &'a [String],
        predicate: impl Fn(&F) -> bool,
    ) -> Option<&'a str> {
        offered
            .iter()
            .find(|name| self.get(name).is_some_and(&predicate))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<F> Default for ModuleRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> fmt::Debug for ModuleRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Registries for every layer
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    pub transport: ModuleRegistry<TransportFactory>,
    pub protection: ModuleRegistry<ProtectionFactory>,
    pub security: ModuleRegistry<SecurityFactory>,
}

impl ModuleSet {
    /// Every built-in module, preferred ones first
    pub fn standard() -> Self {
        let mut modules = Self::default();

        modules.transport.register(TRANSPORT_TCP_IP, tcp_transport);

        modules
            .protection
            .register(HTTP_PROTECTION, http_protection)
            .register(TRANSPARENT_PROTECTION, transparent_protection);

        modules
            .security
            .register(SECURITY_RSA, RsaModule::factory())
            .register(SECURITY_AES, AesModule::factory());

        modules
    }
}

fn tcp_transport(config: TransportConfig) -> Arc<dyn Transport> {
    Arc::new(TcpTransport::new(config))
}

fn http_protection() -> Arc<dyn ProtectionModule> {
    Arc::new(HttpProtection::new())
}

fn transparent_protection() -> Arc<dyn ProtectionModule> {
    Arc::new(TransparentProtection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::CryptographicModel;

    #[test]
    fn test_standard_set_order() {
        let modules = ModuleSet::standard();

        assert_eq!(modules.transport.names(), vec![TRANSPORT_TCP_IP]);
        assert_eq!(
            modules.protection.names(),
            vec![HTTP_PROTECTION, TRANSPARENT_PROTECTION]
        );
        assert_eq!(
            modules
                .security
                .names_matching(|factory| factory.model == CryptographicModel::Asymmetric),
            vec![SECURITY_RSA]
        );
        assert_eq!(
            modules
                .security
                .names_matching(|factory| factory.model == CryptographicModel::Symmetric),
            vec![SECURITY_AES]
        );
    }

    #[test]
    fn test_register_replaces_in_place() {
        let mut registry: ModuleRegistry<u8> = ModuleRegistry::new();
        registry.register("A", 1).register("B", 2).register("A", 3);

        assert_eq!(registry.names(), vec!["A", "B"]);
        assert_eq!(registry.get("A"), Some(&3));
        assert!(!registry.contains("C"));
    }

    #[test]
    fn test_select_takes_first_offered_match() {
        let mut registry: ModuleRegistry<u8> = ModuleRegistry::new();
        registry.register("LOCAL_ONLY", 1).register("SHARED", 2).register("ODD", 3);

        let offered = vec!["REMOTE_ONLY".to_string(), "ODD".to_string(), "SHARED".to_string()];
        assert_eq!(registry.select(&offered, |_| true), Some("ODD"));
        assert_eq!(registry.select(&offered, |value| value % 2 == 0), Some("SHARED"));
        assert_eq!(registry.select(&offered, |value| *value > 10), None);
    }
}
