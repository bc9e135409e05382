//! Module settings
//!
//! Security modules describe their key material as a [`Configurations`] set:
//! a table of named, typed [`Setting`]s sorted by name. The table travels during
//! negotiation as a JSON object (`to_dict` / `from_dict`), so every value has
//! a JSON-safe encoding (bytes are base64).
//!
//! Settings flagged `private` never leave the process: [`Configurations::public_view`]
//! drops them, and every `Debug`/`Display` rendering redacts their values.

use super::ConfigError;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// PEM-encoded RSA private key
pub const PRIVATE_ENCRYPTION_KEY: &str = "PRIVATE_ENCRYPTION_KEY";
/// PEM-encoded RSA public key of the peer (or own, before exchange)
pub const PUBLIC_ENCRYPTION_KEY: &str = "PUBLIC_ENCRYPTION_KEY";
/// Raw AES-256 key
pub const SYMMETRIC_KEY: &str = "SYMMETRIC_KEY";

const REDACTED: &str = "<redacted>";

/// Typed setting value
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "TYPE", content = "DATA", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettingValue {
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Integer(i64),
    Text(String),
}

impl SettingValue {
    fn kind(&self) -> &'static str {
        match self {
            SettingValue::Bytes(_) => "bytes",
            SettingValue::Integer(_) => "integer",
            SettingValue::Text(_) => "text",
        }
    }

    /// Quantity checked against a setting's bounds: byte length, integer
    /// value, or character count
    fn magnitude(&self) -> i64 {
        match self {
            SettingValue::Bytes(bytes) => bytes.len() as i64,
            SettingValue::Integer(value) => *value,
            SettingValue::Text(text) => text.chars().count() as i64,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            SettingValue::Bytes(bytes) => bytes.is_empty(),
            SettingValue::Integer(_) => false,
            SettingValue::Text(text) => text.is_empty(),
        }
    }
}

impl fmt::Debug for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            SettingValue::Integer(value) => write!(f, "Integer({})", value),
            SettingValue::Text(text) => write!(f, "Text({:?})", text),
        }
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// One named setting
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Setting {
    pub system_name: String,
    #[serde(default)]
    pub symbolic_name: String,
    #[serde(default)]
    pub description: String,
    pub value: SettingValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<i64>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub private: bool,
}

impl Setting {
    /// Create a required, public setting. The system name is stored uppercase.
    pub fn new(system_name: &str, value: SettingValue) -> Self {
        Self {
            system_name: system_name.to_uppercase(),
            symbolic_name: String::new(),
            description: String::new(),
            value,
            minimum: None,
            maximum: None,
            optional: false,
            private: false,
        }
    }

    pub fn symbolic_name(mut self, name: &str) -> Self {
        self.symbolic_name = name.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Bound the byte length, integer value or character count
    pub fn bounds(mut self, minimum: Option<i64>, maximum: Option<i64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            SettingValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.value {
            SettingValue::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            SettingValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Check presence and bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.value.is_empty() {
            if self.optional {
                return Ok(());
            }
            return Err(ConfigError::MissingSetting(self.system_name.clone()));
        }

        let magnitude = self.value.magnitude();
        let below = self.minimum.is_some_and(|minimum| magnitude < minimum);
        let above = self.maximum.is_some_and(|maximum| magnitude > maximum);
        if below || above {
            return Err(ConfigError::OutOfBounds {
                name: self.system_name.clone(),
                value: magnitude,
                minimum: self.minimum,
                maximum: self.maximum,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Setting");
        debug.field("system_name", &self.system_name);
        if self.private {
            debug.field("value", &format_args!("{}", REDACTED));
        } else {
            debug.field("value", &self.value);
        }
        debug
            .field("optional", &self.optional)
            .field("private", &self.private)
            .finish()
    }
}

/// Table of settings keyed by uppercase system name, sorted by name
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configurations {
    settings: BTreeMap<String, Setting>,
}

impl Configurations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a setting; its system name must not exist yet
    pub fn add_setting(&mut self, mut setting: Setting) -> Result<&str, ConfigError> {
        let name = setting.system_name.to_uppercase();
        if self.settings.contains_key(&name) {
            return Err(ConfigError::DuplicateSetting(name));
        }
        setting.system_name = name.clone();
        let entry = self.settings.entry(name).or_insert(setting);
        Ok(&entry.system_name)
    }

    /// System names of every setting, sorted alphabetically
    pub fn query_settings(&self) -> Vec<&str> {
        self.settings.keys().map(String::as_str).collect()
    }

    pub fn query_setting(&self, system_name: &str) -> Result<&Setting, ConfigError> {
        let name = system_name.to_uppercase();
        self.settings
            .get(&name)
            .ok_or(ConfigError::MissingSetting(name))
    }

    pub fn query_setting_mut(&mut self, system_name: &str) -> Result<&mut Setting, ConfigError> {
        let name = system_name.to_uppercase();
        self.settings
            .get_mut(&name)
            .ok_or(ConfigError::MissingSetting(name))
    }

    /// Bytes value of a setting, or an error naming the setting
    pub fn bytes(&self, system_name: &str) -> Result<&[u8], ConfigError> {
        let setting = self.query_setting(system_name)?;
        setting.as_bytes().ok_or_else(|| ConfigError::TypeMismatch {
            name: setting.system_name.clone(),
            expected: "bytes",
            actual: setting.value.kind(),
        })
    }

    pub fn delete_setting(&mut self, system_name: &str) -> Result<Setting, ConfigError> {
        let name = system_name.to_uppercase();
        self.settings
            .remove(&name)
            .ok_or(ConfigError::MissingSetting(name))
    }

    pub fn contains(&self, system_name: &str) -> bool {
        self.settings.contains_key(&system_name.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Validate every setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.values().try_for_each(Setting::validate)
    }

    /// Serialize to a JSON object keyed by system name
    pub fn to_dict(&self) -> Result<serde_json::Map<String, Value>, ConfigError> {
        match serde_json::to_value(self).map_err(|e| ConfigError::Invalid(e.to_string()))? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::Invalid("settings did not serialize to an object".into())),
        }
    }

    /// Rebuild from a JSON object produced by [`to_dict`](Self::to_dict)
    pub fn from_dict(dict: &serde_json::Map<String, Value>) -> Result<Self, ConfigError> {
        let mut configurations = Self::new();
        for (name, value) in dict {
            let setting: Setting = serde_json::from_value(value.clone())
                .map_err(|e| ConfigError::Invalid(format!("setting {}: {}", name, e)))?;
            if setting.system_name != name.to_uppercase() {
                return Err(ConfigError::Invalid(format!(
                    "setting keyed {} is named {}",
                    name, setting.system_name
                )));
            }
            configurations.add_setting(setting)?;
        }
        Ok(configurations)
    }

    /// Copy with every private setting removed
    pub fn public_view(&self) -> Self {
        Self {
            settings: self
                .settings
                .iter()
                .filter(|(_, setting)| !setting.private)
                .map(|(name, setting)| (name.clone(), setting.clone()))
                .collect(),
        }
    }

    /// Insert every setting of `other`, replacing same-named ones
    pub fn merge(&mut self, other: Configurations) {
        self.settings.extend(other.settings);
    }
}

impl fmt::Debug for Configurations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.settings.values()).finish()
    }
}

impl fmt::Display for Configurations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for setting in self.settings.values() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            if setting.private {
                write!(f, "{}={}", setting.system_name, REDACTED)?;
            } else {
                write!(f, "{}={:?}", setting.system_name, setting.value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_material() -> Configurations {
        let mut configurations = Configurations::new();
        configurations
            .add_setting(
                Setting::new(PRIVATE_ENCRYPTION_KEY, SettingValue::Text("secret pem".into()))
                    .private(),
            )
            .unwrap();
        configurations
            .add_setting(Setting::new(
                PUBLIC_ENCRYPTION_KEY,
                SettingValue::Text("public pem".into()),
            ))
            .unwrap();
        configurations
    }

    #[test]
    fn test_names_are_uppercased_and_unique() {
        let mut configurations = Configurations::new();
        let name = configurations
            .add_setting(Setting::new("symmetric_key", SettingValue::Bytes(vec![1; 32])))
            .unwrap()
            .to_string();
        assert_eq!(name, SYMMETRIC_KEY);

        let duplicate =
            configurations.add_setting(Setting::new(SYMMETRIC_KEY, SettingValue::Integer(1)));
        assert!(matches!(duplicate, Err(ConfigError::DuplicateSetting(_))));
        assert!(configurations.query_setting("Symmetric_Key").is_ok());
    }

    #[test]
    fn test_names_are_listed_alphabetically() {
        let mut configurations = Configurations::new();
        for name in ["zeta", "alpha", "mid"] {
            configurations
                .add_setting(Setting::new(name, SettingValue::Integer(1)))
                .unwrap();
        }
        assert_eq!(configurations.query_settings(), vec!["ALPHA", "MID", "ZETA"]);
    }

    #[test]
    fn test_private_values_are_redacted() {
        let configurations = key_material();

        let debug = format!("{:?}", configurations);
        let display = configurations.to_string();
        for rendering in [debug, display] {
            assert!(!rendering.contains("secret pem"));
            assert!(rendering.contains(REDACTED));
            assert!(rendering.contains("public pem"));
        }
    }

    #[test]
    fn test_public_view_drops_private_settings() {
        let public = key_material().public_view();

        assert_eq!(public.query_settings(), vec![PUBLIC_ENCRYPTION_KEY]);
        assert!(!public.contains(PRIVATE_ENCRYPTION_KEY));
    }

    #[test]
    fn test_dict_roundtrip_keeps_bytes_and_flags() {
        let mut configurations = key_material();
        configurations
            .add_setting(
                Setting::new(SYMMETRIC_KEY, SettingValue::Bytes((0..32).collect()))
                    .bounds(Some(32), Some(32)),
            )
            .unwrap();

        let dict = configurations.to_dict().unwrap();
        let encoded = &dict[SYMMETRIC_KEY]["VALUE"];
        assert_eq!(encoded["TYPE"], "BYTES");
        assert!(encoded["DATA"].is_string());

        let restored = Configurations::from_dict(&dict).unwrap();
        assert_eq!(restored, configurations);
        assert!(restored.query_setting(PRIVATE_ENCRYPTION_KEY).unwrap().private);
    }

    #[test]
    fn test_from_dict_rejects_garbage() {
        let mut dict = serde_json::Map::new();
        dict.insert("BROKEN".into(), Value::String("not a setting".into()));
        assert!(matches!(
            Configurations::from_dict(&dict),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_checks_bounds_and_presence() {
        let short = Setting::new(SYMMETRIC_KEY, SettingValue::Bytes(vec![0; 16]))
            .bounds(Some(32), Some(32));
        assert!(matches!(short.validate(), Err(ConfigError::OutOfBounds { value: 16, .. })));

        let empty = Setting::new(PUBLIC_ENCRYPTION_KEY, SettingValue::Text(String::new()));
        assert!(matches!(empty.validate(), Err(ConfigError::MissingSetting(_))));
        assert!(empty.optional().validate().is_ok());
    }

    #[test]
    fn test_merge_replaces_same_names() {
        let mut own = key_material();
        let mut peer = Configurations::new();
        peer.add_setting(Setting::new(
            PUBLIC_ENCRYPTION_KEY,
            SettingValue::Text("peer pem".into()),
        ))
        .unwrap();

        own.merge(peer);
        assert_eq!(
            own.query_setting(PUBLIC_ENCRYPTION_KEY).unwrap().as_text(),
            Some("peer pem")
        );
        assert_eq!(own.len(), 2);
    }

    #[test]
    fn test_bytes_accessor_reports_type_mismatch() {
        let configurations = key_material();
        assert!(matches!(
            configurations.bytes(PUBLIC_ENCRYPTION_KEY),
            Err(ConfigError::TypeMismatch { expected: "bytes", actual: "text", .. })
        ));
    }
}
