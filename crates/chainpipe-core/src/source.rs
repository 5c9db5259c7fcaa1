//! Source definitions as stored in the external registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// One configured, independently-failing data feed.
///
/// The registry stores one serialized `SourceConfig` per key. This crate only
/// ever reads them; the admin layer owns writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source id, equal to the registry key.
    pub id: String,
    /// Chain type used to select the decoder and connector, e.g. `"evm"`.
    pub chain_type: String,
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub endpoint: String,
    /// Where the endpoint secret lives: `env:NAME` or `file:/path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Block / height / slot to start from when no checkpoint exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<u64>,
    /// Connector-specific filters (addresses, mentions, query, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

fn bool_true() -> bool {
    true
}

impl SourceConfig {
    /// Minimal enabled source, mostly for tests and examples.
    pub fn new(
        id: impl Into<String>,
        chain_type: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            chain_type: chain_type.into(),
            endpoint: endpoint.into(),
            credential_ref: None,
            enabled: true,
            start_position: None,
            options: BTreeMap::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_start_position(mut self, position: u64) -> Self {
        self.start_position = Some(position);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Parse a registry value stored under `key`.
    ///
    /// Accepts JSON or YAML. A missing `id` is filled in from the key; an id
    /// that disagrees with the key is rejected.
    pub fn parse(key: &str, raw: &[u8]) -> Result<Self, ConfigError> {
        let mut value: serde_json::Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(json_err) => serde_yaml::from_slice(raw).map_err(|yaml_err| ConfigError::Parse {
                id: key.to_string(),
                reason: format!("not JSON ({json_err}) nor YAML ({yaml_err})"),
            })?,
        };

        if let Some(obj) = value.as_object_mut() {
            obj.entry("id")
                .or_insert_with(|| serde_json::Value::String(key.to_string()));
        }

        let config: SourceConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse {
                id: key.to_string(),
                reason: e.to_string(),
            })?;

        if config.id != key {
            return Err(ConfigError::IdMismatch {
                key: key.to_string(),
                id: config.id,
            });
        }
        config.validate()?;
        Ok(config)
    }

    /// Check field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidField {
            id: self.id.clone(),
            field,
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id", "must not be empty"));
        }
        if self.chain_type.trim().is_empty() {
            return Err(invalid("chain_type", "must not be empty"));
        }
        match url::Url::parse(&self.endpoint.replace("{credential}", "x")) {
            Ok(u) if u.scheme() == "ws" || u.scheme() == "wss" => {}
            Ok(u) => {
                return Err(invalid(
                    "endpoint",
                    &format!("unsupported scheme '{}', expected ws or wss", u.scheme()),
                ))
            }
            Err(e) => return Err(invalid("endpoint", &e.to_string())),
        }
        if let Some(reference) = &self.credential_ref {
            CredentialRef::parse(reference)?;
        }
        Ok(())
    }

    /// String list option, e.g. `addresses: ["0x..", "0x.."]`.
    pub fn option_strings(&self, key: &str) -> Vec<String> {
        match self.options.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

/// Parsed form of [`SourceConfig::credential_ref`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    Env(String),
    File(std::path::PathBuf),
}

impl CredentialRef {
    pub fn parse(reference: &str) -> Result<Self, ConfigError> {
        let err = |reason: &str| ConfigError::Credential {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        match reference.split_once(':') {
            Some(("env", name)) if !name.is_empty() => Ok(Self::Env(name.to_string())),
            Some(("file", path)) if !path.is_empty() => Ok(Self::File(path.into())),
            _ => Err(err("expected 'env:NAME' or 'file:/path'")),
        }
    }

    /// Read the secret. Trailing whitespace is trimmed.
    pub fn resolve(&self) -> Result<String, ConfigError> {
        match self {
            Self::Env(name) => std::env::var(name).map_err(|e| ConfigError::Credential {
                reference: format!("env:{name}"),
                reason: e.to_string(),
            }),
            Self::File(path) => std::fs::read_to_string(path)
                .map(|s| s.trim_end().to_string())
                .map_err(|e| ConfigError::Credential {
                    reference: format!("file:{}", path.display()),
                    reason: e.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_fills_id_from_key() {
        let raw = br#"{"chain_type":"evm","endpoint":"wss://node.example"}"#;
        let cfg = SourceConfig::parse("chainA-main", raw).unwrap();
        assert_eq!(cfg.id, "chainA-main");
        assert!(cfg.enabled);
        assert_eq!(cfg.start_position, None);
    }

    #[test]
    fn parse_yaml() {
        let raw = b"id: osmo\nchain_type: cosmos\nendpoint: ws://127.0.0.1:26657/websocket\nenabled: false\nstart_position: 42\n";
        let cfg = SourceConfig::parse("osmo", raw).unwrap();
        assert_eq!(cfg.chain_type, "cosmos");
        assert!(!cfg.enabled);
        assert_eq!(cfg.start_position, Some(42));
    }

    #[test]
    fn id_mismatch_rejected() {
        let raw = br#"{"id":"other","chain_type":"evm","endpoint":"wss://x"}"#;
        let err = SourceConfig::parse("mine", raw).unwrap_err();
        assert!(matches!(err, ConfigError::IdMismatch { .. }));
    }

    #[test]
    fn http_endpoint_rejected() {
        let raw = br#"{"chain_type":"evm","endpoint":"https://node.example"}"#;
        let err = SourceConfig::parse("a", raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { field: "endpoint", .. }));
    }

    #[test]
    fn garbage_is_parse_error() {
        let err = SourceConfig::parse("a", b"{not json: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn credential_ref_forms() {
        assert_eq!(
            CredentialRef::parse("env:NODE_KEY").unwrap(),
            CredentialRef::Env("NODE_KEY".into())
        );
        assert!(matches!(
            CredentialRef::parse("file:/run/secrets/key").unwrap(),
            CredentialRef::File(_)
        ));
        assert!(CredentialRef::parse("vault:x").is_err());
        assert!(CredentialRef::parse("env:").is_err());
    }

    #[test]
    fn endpoint_placeholder_validates() {
        let cfg = SourceConfig::new("a", "evm", "wss://eth.example/v3/{credential}");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn option_strings_accepts_scalar_and_list() {
        let cfg = SourceConfig::new("a", "evm", "wss://x")
            .with_option("addresses", serde_json::json!(["0x1", "0x2"]))
            .with_option("mentions", serde_json::json!("Prog111"));
        assert_eq!(cfg.option_strings("addresses"), vec!["0x1", "0x2"]);
        assert_eq!(cfg.option_strings("mentions"), vec!["Prog111"]);
        assert!(cfg.option_strings("missing").is_empty());
    }
}
