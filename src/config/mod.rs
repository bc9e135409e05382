//! Configuration management

mod settings;

pub use settings::{
    Configurations, Setting, SettingValue, PRIVATE_ENCRYPTION_KEY, PUBLIC_ENCRYPTION_KEY,
    SYMMETRIC_KEY,
};

use crate::registry::TRANSPORT_TCP_IP;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Setting {0} already exists")]
    DuplicateSetting(String),

    #[error("Setting {0} is missing")]
    MissingSetting(String),

    #[error("Setting {name} = {value} outside [{minimum:?}, {maximum:?}]")]
    OutOfBounds {
        name: String,
        value: i64,
        minimum: Option<i64>,
        maximum: Option<i64>,
    },

    #[error("Setting {name} holds {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transport tuning
    #[serde(default)]
    pub transport: TransportConfig,
    /// Negotiation timing
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Server (PASSIVE peer) configuration
    pub server: Option<ServerConfig>,
    /// Client (ACTIVE peer) configuration
    pub client: Option<ClientConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Timing of the layer negotiations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// How long to wait for each negotiation message, in seconds
    pub message_timeout: u64,
    /// Pause before the PASSIVE peer loads the symmetric module, in milliseconds
    pub settle_delay: u64,
    /// How long each background read waits before re-checking its stop flag,
    /// in milliseconds
    pub poll_interval: u64,
}

impl NegotiationConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval.max(1))
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            message_timeout: 30,
            settle_delay: 100,
            poll_interval: 50,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (IPv4, or IPv6 when it contains ':')
    pub address: String,
    /// Listen port, 0 for an ephemeral port
    pub port: u16,
    /// Registered transport module name
    pub transport_module: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            transport_module: TRANSPORT_TCP_IP.to_string(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    pub address: String,
    /// Server port
    pub port: u16,
    /// Registered transport module name
    pub transport_module: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            transport_module: TRANSPORT_TCP_IP.to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env-filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrips_through_file() {
        let path = std::env::temp_dir().join(format!("tunnel-stack-{}.toml", uuid::Uuid::new_v4()));
        let config = generate_example_config();

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let server = loaded.server.unwrap();
        assert_eq!(server.port, 8080);
        assert_eq!(server.transport_module, TRANSPORT_TCP_IP);
        assert_eq!(loaded.negotiation.message_timeout(), Duration::from_secs(30));
        assert_eq!(loaded.transport.connect_timeout, config.transport.connect_timeout);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = toml::from_str(
            r#"
            [negotiation]
            settle_delay = 250
            "#,
        )
        .unwrap();

        assert!(config.server.is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.negotiation.settle_delay(), Duration::from_millis(250));
        assert_eq!(config.negotiation.message_timeout, 30);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let path = std::env::temp_dir().join(format!("tunnel-stack-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server\naddress = 1").unwrap();

        let result = Config::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
