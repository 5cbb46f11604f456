//! YAML configuration: root key `homenet_bridge`.
//!
//! ```yaml
//! homenet_bridge:
//!   serial: {host: 192.168.1.10, port: 8899}
//!   packet_defaults: {rx_length: 4, rx_checksum: samsung_rx}
//!   light:
//!     - id: living_light
//!       state: {offset: 0, data: [0x31]}
//!       state_on: {offset: 1, data: [0x01]}
//!       command_on: {data: [0x31, 0x01]}
//!   automation:
//!     - trigger: [{packet: {match: {data: [0xAD, 0x5A, 0x00, 0x77]}}}]
//!       then: [{send_packet: {data: [0xB0, 0x5A, 0x00, 0x6A]}}]
//! ```
//!
//! Byte arrays accept hex (`0xAA`), decimal, and quoted tokens; the dumper
//! re-emits them as `0xXX` strings. Structural problems (duplicate ids, bad
//! schemas, contradictory framing) surface here and abort bus startup.

use std::collections::BTreeMap;
use std::path::Path;

use homenet_core::{
    CoreError, Entity, EntityKind, EntityRegistry,
    automation::AutomationRule,
};
use homenet_proto::{PacketDefaults, ProtoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration-load failures; all abort bus startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// File path as given.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML did not parse or did not fit the schema.
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The file parses but lacks the `homenet_bridge` root key.
    #[error("config is missing the homenet_bridge root key")]
    MissingRoot,

    /// An entity list key is not a known kind.
    #[error("unknown entity kind {key:?}")]
    UnknownKind {
        /// The offending list key.
        key: String,
    },

    /// The framing contract is contradictory.
    #[error(transparent)]
    Framing(#[from] ProtoError),

    /// An entity or rule declaration is invalid.
    #[error(transparent)]
    Catalog(#[from] CoreError),
}

/// The serial link. Either a TCP-tunnelled endpoint (`host`/`port`) or a
/// device path opened by an external collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path.
    pub path: Option<String>,
    /// TCP tunnel host.
    pub host: Option<String>,
    /// TCP tunnel port.
    pub port: Option<u16>,
    /// Baud rate, for the external serial opener.
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigFile {
    homenet_bridge: Option<BridgeConfig>,
}

/// One bus: link, framing contract, entity catalog, rules, helper scripts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial link settings.
    pub serial: SerialConfig,

    /// Framing contract for the bus.
    pub packet_defaults: PacketDefaults,

    /// Automation rules.
    pub automation: Vec<AutomationRule>,

    /// Named helper scripts handed to the expression evaluator.
    pub scripts: BTreeMap<String, String>,

    /// Entity lists keyed by kind (`light:`, `climate:`, ...).
    #[serde(flatten)]
    pub entities: BTreeMap<String, Vec<serde_yaml::Value>>,
}

impl BridgeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        let config = file.homenet_bridge.ok_or(ConfigError::MissingRoot)?;
        config.packet_defaults.validate()?;
        // Surface catalog errors now rather than at bus start.
        config.build_registry()?;
        Ok(config)
    }

    /// Build the entity registry, enforcing known kinds and unique ids.
    pub fn build_registry(&self) -> Result<EntityRegistry, ConfigError> {
        let mut registry = EntityRegistry::new();
        for (key, items) in &self.entities {
            let kind = EntityKind::ALL
                .into_iter()
                .find(|kind| kind.key() == key)
                .ok_or_else(|| ConfigError::UnknownKind { key: key.clone() })?;
            for item in items {
                registry.insert(Entity::from_config(kind, item.clone())?)?;
            }
        }
        Ok(registry)
    }

    /// Re-emit the configuration, byte arrays as `0xXX` tokens.
    ///
    /// Entity lists are round-tripped through the typed catalog so their byte
    /// fields come out in hex as well.
    pub fn dump(&self) -> Result<String, ConfigError> {
        let registry = self.build_registry()?;
        let mut entities: BTreeMap<String, Vec<serde_yaml::Value>> = BTreeMap::new();
        for entity in registry.iter() {
            entities
                .entry(entity.kind.key().to_owned())
                .or_default()
                .push(entity.to_config()?);
        }
        let file = ConfigFile {
            homenet_bridge: Some(Self { entities, ..self.clone() }),
        };
        Ok(serde_yaml::to_string(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
homenet_bridge:
  packet_defaults: {rx_length: 3, rx_checksum: add}
";

    #[test]
    fn minimal_config() {
        let config = BridgeConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.packet_defaults.rx_length, Some(3));
        assert!(config.build_registry().unwrap().is_empty());
    }

    #[test]
    fn missing_root_rejected() {
        assert!(matches!(
            BridgeConfig::from_yaml("other: {}"),
            Err(ConfigError::MissingRoot)
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let text = r"
homenet_bridge:
  lighting:
    - {id: x, state: {data: [0x01]}}
";
        assert!(matches!(
            BridgeConfig::from_yaml(text),
            Err(ConfigError::UnknownKind { .. })
        ));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let text = r"
homenet_bridge:
  switch:
    - {id: x, state: {data: [0x01]}}
    - {id: x, state: {data: [0x02]}}
";
        assert!(matches!(
            BridgeConfig::from_yaml(text),
            Err(ConfigError::Catalog(CoreError::DuplicateEntity { .. }))
        ));
    }

    #[test]
    fn hex_and_decimal_bytes() {
        let text = r#"
homenet_bridge:
  packet_defaults:
    rx_header: [0x02, 3]
    rx_footer: ["0x0D", "0x0A"]
"#;
        let config = BridgeConfig::from_yaml(text).unwrap();
        assert_eq!(config.packet_defaults.rx_header, vec![0x02, 0x03]);
        assert_eq!(config.packet_defaults.rx_footer, vec![0x0D, 0x0A]);
    }

    #[test]
    fn dump_emits_hex_tokens_and_reloads() {
        let text = r"
homenet_bridge:
  packet_defaults: {rx_header: [0x02], rx_length: 4}
  switch:
    - {id: x, state: {data: [0xAA]}}
";
        let config = BridgeConfig::from_yaml(text).unwrap();
        let dumped = config.dump().unwrap();
        assert!(dumped.contains("0x02"), "{dumped}");
        assert!(dumped.contains("0xAA"), "{dumped}");
        let reloaded = BridgeConfig::from_yaml(&dumped).unwrap();
        assert_eq!(reloaded.packet_defaults.rx_header, vec![0x02]);
        assert_eq!(reloaded.build_registry().unwrap().len(), 1);
    }
}
