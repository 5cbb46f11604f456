//! Entity catalog: declarative descriptions of the devices on a bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    CoreError,
    schema::{CommandSchema, StateSchema},
};

/// Entity type tag.
///
/// The matcher dispatches type-specific decoding through this tag; there is
/// no open hierarchy behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// On/off (optionally dimmable) light.
    Light,
    /// Heating/cooling unit.
    Climate,
    /// Fan with speed/oscillation/direction.
    Fan,
    /// Open/closed valve.
    Valve,
    /// Stateless push button.
    Button,
    /// Numeric reading.
    Sensor,
    /// On/off switch.
    Switch,
    /// On/off reading without a command side.
    BinarySensor,
    /// Lockable door or gate.
    Lock,
    /// Settable numeric value.
    Number,
    /// Settable enumerated value.
    Select,
    /// Settable text value.
    Text,
    /// Text reading.
    TextSensor,
}

impl EntityKind {
    /// Every kind, in catalog order.
    pub const ALL: [Self; 13] = [
        Self::Light,
        Self::Climate,
        Self::Fan,
        Self::Valve,
        Self::Button,
        Self::Sensor,
        Self::Switch,
        Self::BinarySensor,
        Self::Lock,
        Self::Number,
        Self::Select,
        Self::Text,
        Self::TextSensor,
    ];

    /// The configuration list key for this kind (`light:`, `climate:`, ...).
    pub fn key(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Climate => "climate",
            Self::Fan => "fan",
            Self::Valve => "valve",
            Self::Button => "button",
            Self::Sensor => "sensor",
            Self::Switch => "switch",
            Self::BinarySensor => "binary_sensor",
            Self::Lock => "lock",
            Self::Number => "number",
            Self::Select => "select",
            Self::Text => "text",
            Self::TextSensor => "text_sensor",
        }
    }
}

/// One logical device on the bus.
///
/// The primary `state` schema is the entity's selector: a packet refers to
/// the entity iff it matches. Property sub-schemas (`state_on`,
/// `state_speed`, ...) refine the packet into a typed delta; command schemas
/// are the outbound templates. Property and command keys are stored as
/// written in the catalog (`state_on`) and with the `command_` prefix
/// stripped (`on`), respectively.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Stable slug, unique per bus.
    pub id: String,
    /// Human-readable name; defaults to the id.
    pub name: String,
    /// Type tag.
    pub kind: EntityKind,
    /// Locally-authoritative entity: no inbound match, state is seeded at
    /// startup and updated only by commands.
    pub optimistic: bool,
    /// Primary selector schema.
    pub state: StateSchema,
    /// Property sub-schemas, keyed by their full catalog key.
    pub properties: BTreeMap<String, StateSchema>,
    /// Command templates, keyed by command name (`on`, `off`, `temperature`).
    pub commands: BTreeMap<String, CommandSchema>,
    /// Acknowledgement selector: an RX packet matching it clears the
    /// pending-command window.
    pub ack: Option<StateSchema>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    id: String,
    name: Option<String>,
    #[serde(default)]
    optimistic: bool,
    state: Option<StateSchema>,
    ack: Option<StateSchema>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl Entity {
    /// Build an entity from one catalog list item.
    ///
    /// `state_*` keys become property sub-schemas, `command_*` keys become
    /// command templates; anything else is rejected so typos surface at load
    /// time rather than as silently-dead schemas.
    pub fn from_config(kind: EntityKind, value: serde_yaml::Value) -> Result<Self, CoreError> {
        let raw: RawEntity = serde_yaml::from_value(value).map_err(|err| {
            CoreError::InvalidEntity { id: String::new(), reason: err.to_string() }
        })?;
        let invalid = |reason: String| CoreError::InvalidEntity { id: raw.id.clone(), reason };

        if raw.id.is_empty() {
            return Err(invalid("empty id".into()));
        }
        let state = match raw.state {
            Some(state) => state,
            None if raw.optimistic => StateSchema::default(),
            None => return Err(invalid("missing state schema".into())),
        };

        let mut properties = BTreeMap::new();
        let mut commands = BTreeMap::new();
        for (key, value) in raw.extra {
            if key.starts_with("state_") {
                let schema: StateSchema = serde_yaml::from_value(value)
                    .map_err(|err| invalid(format!("{key}: {err}")))?;
                properties.insert(key, schema);
            } else if let Some(name) = key.strip_prefix("command_") {
                let schema: CommandSchema = serde_yaml::from_value(value)
                    .map_err(|err| invalid(format!("{key}: {err}")))?;
                commands.insert(name.to_owned(), schema);
            } else {
                return Err(invalid(format!("unknown key {key:?}")));
            }
        }

        Ok(Self {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            kind,
            optimistic: raw.optimistic,
            state,
            properties,
            commands,
            ack: raw.ack,
        })
    }

    /// Re-emit the entity as one catalog list item.
    ///
    /// Inverse of [`Entity::from_config`]; byte fields serialize as `0xXX`
    /// tokens, defaults are omitted.
    pub fn to_config(&self) -> Result<serde_yaml::Value, serde_yaml::Error> {
        let mut map = serde_yaml::Mapping::new();
        map.insert("id".into(), self.id.clone().into());
        if self.name != self.id {
            map.insert("name".into(), self.name.clone().into());
        }
        if self.optimistic {
            map.insert("optimistic".into(), true.into());
        }
        if self.state != StateSchema::default() {
            map.insert("state".into(), serde_yaml::to_value(&self.state)?);
        }
        for (key, schema) in &self.properties {
            map.insert(key.clone().into(), serde_yaml::to_value(schema)?);
        }
        for (name, schema) in &self.commands {
            map.insert(format!("command_{name}").into(), serde_yaml::to_value(schema)?);
        }
        if let Some(ack) = &self.ack {
            map.insert("ack".into(), serde_yaml::to_value(ack)?);
        }
        Ok(serde_yaml::Value::Mapping(map))
    }

    /// Property sub-schema by full catalog key (`state_on`).
    pub fn property(&self, key: &str) -> Option<&StateSchema> {
        self.properties.get(key)
    }

    /// Command template by name (`on`).
    pub fn command(&self, name: &str) -> Option<&CommandSchema> {
        self.commands.get(name)
    }
}

/// All entities of one bus, indexed by id.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: Vec<Arc<Entity>>,
    by_id: HashMap<String, usize>,
}

impl EntityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity, enforcing id uniqueness per bus.
    pub fn insert(&mut self, entity: Entity) -> Result<(), CoreError> {
        if self.by_id.contains_key(&entity.id) {
            return Err(CoreError::DuplicateEntity { id: entity.id });
        }
        self.by_id.insert(entity.id.clone(), self.entities.len());
        self.entities.push(Arc::new(entity));
        Ok(())
    }

    /// Look up an entity by id.
    pub fn get(&self, id: &str) -> Option<&Arc<Entity>> {
        self.by_id.get(id).map(|&index| &self.entities[index])
    }

    /// Entities in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.iter()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_yaml() -> serde_yaml::Value {
        serde_yaml::from_str(
            r"
            id: living_fan
            name: Living room fan
            state: {offset: 0, data: [0x40]}
            state_on: {offset: 1, data: [0x01]}
            state_speed: {offset: 2, length: 1}
            command_on: {data: [0x40, 0x01]}
            command_speed: {data: [0x40, 0x02, 0x00], value_offset: 2}
            ",
        )
        .unwrap()
    }

    #[test]
    fn parses_properties_and_commands() {
        let entity = Entity::from_config(EntityKind::Fan, fan_yaml()).unwrap();
        assert_eq!(entity.id, "living_fan");
        assert_eq!(entity.kind, EntityKind::Fan);
        assert!(entity.property("state_on").is_some());
        assert!(entity.property("state_speed").is_some());
        assert!(entity.command("on").is_some());
        assert!(entity.command("speed").is_some());
        assert!(entity.command("off").is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "{id: x, state: {data: [0x01]}, stat_on: {data: [0x01]}}",
        )
        .unwrap();
        let err = Entity::from_config(EntityKind::Switch, value).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEntity { .. }));
    }

    #[test]
    fn state_required_unless_optimistic() {
        let value: serde_yaml::Value = serde_yaml::from_str("{id: x}").unwrap();
        assert!(Entity::from_config(EntityKind::Switch, value).is_err());

        let value: serde_yaml::Value =
            serde_yaml::from_str("{id: x, optimistic: true}").unwrap();
        let entity = Entity::from_config(EntityKind::Switch, value).unwrap();
        assert!(entity.optimistic);
        assert_eq!(entity.state.data, None);
    }

    #[test]
    fn registry_enforces_unique_ids() {
        let mut registry = EntityRegistry::new();
        let entity = Entity::from_config(EntityKind::Fan, fan_yaml()).unwrap();
        registry.insert(entity.clone()).unwrap();
        assert!(matches!(
            registry.insert(entity),
            Err(CoreError::DuplicateEntity { .. })
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("living_fan").is_some());
    }
}
