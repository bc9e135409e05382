//! Negotiation protocol definitions and constants
//!
//! Layer negotiations exchange single-key JSON packages:
//!
//! ```text
//! {"AVAILABLE_MODULES": ["HTTP_PROTECTION", ...]}   PASSIVE -> ACTIVE
//! {"SELECTED_MODULE": "HTTP_PROTECTION"}            ACTIVE  -> PASSIVE
//! {"MODULE_CONFIGURATIONS": {...}}                  both directions
//! {"SIGNAL": "READY_FOR_SIMMETRIC"}                 both directions
//! ```

use crate::framing::Datapackage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Unexpected message while waiting for {expected}: {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("No compatible module among {0:?}")]
    NoCompatibleModule(Vec<String>),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Expected signal {expected}, got {actual}")]
    SignalMismatch {
        expected: &'static str,
        actual: String,
    },
}

/// Signal both peers exchange over the asymmetric channel before promotion
pub const READY_FOR_SIMMETRIC: &str = "READY_FOR_SIMMETRIC";

/// Signal the PASSIVE peer sends over the symmetric channel once it is loaded
pub const SIMMETRIC_ESTABLISHED: &str = "SIMMETRIC_ESTABLISHED";

/// Negotiation role of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Initiates the connection and selects modules
    Active,
    /// Accepts the connection and advertises modules
    Passive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Active => write!(f, "ACTIVE"),
            Role::Passive => write!(f, "PASSIVE"),
        }
    }
}

/// Negotiation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Negotiation {
    AvailableModules(Vec<String>),
    SelectedModule(String),
    ModuleConfigurations(serde_json::Map<String, Value>),
    Signal(String),
}

impl Negotiation {
    fn label(&self) -> String {
        match self {
            Negotiation::AvailableModules(names) => format!("AVAILABLE_MODULES {:?}", names),
            Negotiation::SelectedModule(name) => format!("SELECTED_MODULE {}", name),
            Negotiation::ModuleConfigurations(_) => "MODULE_CONFIGURATIONS".to_string(),
            Negotiation::Signal(signal) => format!("SIGNAL {}", signal),
        }
    }

    /// Module list, or an error naming what arrived instead
    pub fn into_available(self) -> Result<Vec<String>, ProtocolError> {
        match self {
            Negotiation::AvailableModules(names) => Ok(names),
            other => Err(other.unexpected("AVAILABLE_MODULES")),
        }
    }

    pub fn into_selected(self) -> Result<String, ProtocolError> {
        match self {
            Negotiation::SelectedModule(name) => Ok(name),
            other => Err(other.unexpected("SELECTED_MODULE")),
        }
    }

    pub fn into_configurations(self) -> Result<serde_json::Map<String, Value>, ProtocolError> {
        match self {
            Negotiation::ModuleConfigurations(dict) => Ok(dict),
            other => Err(other.unexpected("MODULE_CONFIGURATIONS")),
        }
    }

    /// Check this is exactly `SIGNAL: expected`
    pub fn expect_signal(self, expected: &'static str) -> Result<(), ProtocolError> {
        match self {
            Negotiation::Signal(signal) if signal == expected => Ok(()),
            Negotiation::Signal(actual) => Err(ProtocolError::SignalMismatch { expected, actual }),
            other => Err(other.unexpected("SIGNAL")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            expected,
            actual: self.label(),
        }
    }
}

/// Wait for the next negotiation message on `handler`.
///
/// `stage` names what is awaited in the timeout error.
pub async fn receive_negotiation(
    handler: &Datapackage,
    timeout: Duration,
    stage: &'static str,
) -> crate::Result<Negotiation> {
    match handler.receive_message::<Negotiation>(Some(timeout)).await? {
        Some(message) => {
            trace!("Negotiation received: {}", message.label());
            Ok(message)
        }
        None => Err(ProtocolError::Timeout(stage).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let available = Negotiation::AvailableModules(vec!["HTTP_PROTECTION".into()]);
        assert_eq!(
            serde_json::to_value(&available).unwrap(),
            json!({"AVAILABLE_MODULES": ["HTTP_PROTECTION"]})
        );

        let signal = Negotiation::Signal(READY_FOR_SIMMETRIC.into());
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({"SIGNAL": "READY_FOR_SIMMETRIC"})
        );

        let parsed: Negotiation =
            serde_json::from_value(json!({"SELECTED_MODULE": "SECURITY_RSA"})).unwrap();
        assert_eq!(parsed, Negotiation::SelectedModule("SECURITY_RSA".into()));
    }

    #[test]
    fn test_accessors_reject_other_messages() {
        let selected = Negotiation::SelectedModule("X".into());
        assert!(matches!(
            selected.into_available(),
            Err(ProtocolError::UnexpectedMessage { expected: "AVAILABLE_MODULES", .. })
        ));

        let wrong_signal = Negotiation::Signal("SOMETHING_ELSE".into());
        assert!(matches!(
            wrong_signal.expect_signal(READY_FOR_SIMMETRIC),
            Err(ProtocolError::SignalMismatch { .. })
        ));

        assert!(Negotiation::Signal(SIMMETRIC_ESTABLISHED.into())
            .expect_signal(SIMMETRIC_ESTABLISHED)
            .is_ok());
    }

    #[test]
    fn test_role_serializes_uppercase() {
        assert_eq!(serde_json::to_value(Role::Passive).unwrap(), json!("PASSIVE"));
        assert_eq!(Role::Active.to_string(), "ACTIVE");
    }
}
