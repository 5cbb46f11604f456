//! Typed device layer: per-kind packet decoding.
//!
//! After an entity's primary `state` schema matches a packet, the kind's
//! behavior decodes the property sub-schemas into a typed delta. Dispatch is
//! a closed table keyed by [`EntityKind`]; adding a kind means adding a row
//! here, not a subclass anywhere.
//!
//! Property naming: catalog keys carry a `state_` prefix (`state_speed`),
//! published record keys do not (`speed`); temperature keys additionally
//! reorder (`state_temperature_current` → `current_temperature`).

use crate::{
    Entity, EntityKind, StateDelta, Value,
    schema::MatchContext,
};

/// Result of matching a packet against one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdate {
    /// Merge this delta into the entity's state record.
    State(StateDelta),
    /// Transient event (buttons); published, never persisted.
    Event(&'static str),
}

/// Decode a packet against an entity.
///
/// Returns `None` when the packet is not about this entity (primary selector
/// mismatch) and for optimistic entities, which have no inbound match.
pub fn decode(
    entity: &Entity,
    packet: &[u8],
    base_offset: usize,
    ctx: &mut MatchContext<'_>,
) -> Option<DeviceUpdate> {
    if entity.optimistic {
        return None;
    }
    if !entity.state.matches(packet, base_offset, ctx) {
        return None;
    }

    let update = match entity.kind {
        EntityKind::Light | EntityKind::Switch | EntityKind::BinarySensor => {
            DeviceUpdate::State(decode_discrete(entity, packet, base_offset, ctx, ONOFF_BRANCHES))
        },
        EntityKind::Valve => {
            DeviceUpdate::State(decode_discrete(entity, packet, base_offset, ctx, VALVE_BRANCHES))
        },
        EntityKind::Lock => {
            DeviceUpdate::State(decode_discrete(entity, packet, base_offset, ctx, LOCK_BRANCHES))
        },
        EntityKind::Fan => DeviceUpdate::State(decode_fan(entity, packet, base_offset, ctx)),
        EntityKind::Climate => DeviceUpdate::State(decode_climate(entity, packet, base_offset, ctx)),
        EntityKind::Sensor | EntityKind::Number => {
            DeviceUpdate::State(decode_reading(entity, packet, base_offset))
        },
        EntityKind::Select | EntityKind::Text | EntityKind::TextSensor => {
            DeviceUpdate::State(decode_reading(entity, packet, base_offset))
        },
        EntityKind::Button => DeviceUpdate::Event("press"),
    };
    Some(update)
}

/// `(catalog key, published value)` branch table; first match wins.
type Branches = &'static [(&'static str, &'static str)];

const ONOFF_BRANCHES: Branches = &[("state_on", "ON"), ("state_off", "OFF")];
const VALVE_BRANCHES: Branches = &[
    ("state_open", "open"),
    ("state_closed", "closed"),
    ("state_on", "open"),
    ("state_off", "closed"),
];
const LOCK_BRANCHES: Branches = &[
    ("state_locked", "LOCKED"),
    ("state_unlocked", "UNLOCKED"),
    ("state_on", "LOCKED"),
    ("state_off", "UNLOCKED"),
];

fn decode_discrete(
    entity: &Entity,
    packet: &[u8],
    base_offset: usize,
    ctx: &mut MatchContext<'_>,
    branches: Branches,
) -> StateDelta {
    let mut delta = StateDelta::new();
    if let Some(state) = first_matching(entity, packet, base_offset, ctx, branches) {
        delta.insert("state".into(), Value::from(state));
    }
    delta
}

fn decode_fan(
    entity: &Entity,
    packet: &[u8],
    base_offset: usize,
    ctx: &mut MatchContext<'_>,
) -> StateDelta {
    let mut delta = decode_discrete(entity, packet, base_offset, ctx, ONOFF_BRANCHES);
    if let Some(schema) = entity.property("state_speed")
        && let Some(speed) = schema.extract(packet, base_offset)
    {
        delta.insert("speed".into(), speed);
    }
    if let Some(schema) = entity.property("state_oscillating") {
        delta.insert(
            "oscillating".into(),
            Value::Bool(schema.matches(packet, base_offset, ctx)),
        );
    }
    if let Some(schema) = entity.property("state_direction") {
        let direction = if schema.matches(packet, base_offset, ctx) { "forward" } else { "reverse" };
        delta.insert("direction".into(), Value::from(direction));
    }
    if let Some(schema) = entity.property("state_preset_mode")
        && let Some(preset) = schema.extract(packet, base_offset)
    {
        delta.insert("preset_mode".into(), preset);
    }
    delta
}

/// Climate modes probed as `state_<mode>`; first match wins.
const CLIMATE_MODES: &[&str] = &["off", "heat", "cool", "auto", "dry", "fan_only"];
/// Climate actions probed as `state_<action>`; first match wins.
const CLIMATE_ACTIONS: &[&str] = &["heating", "cooling", "idle"];

fn decode_climate(
    entity: &Entity,
    packet: &[u8],
    base_offset: usize,
    ctx: &mut MatchContext<'_>,
) -> StateDelta {
    let mut delta = StateDelta::new();
    for &mode in CLIMATE_MODES {
        let key = format!("state_{mode}");
        if let Some(schema) = entity.property(&key)
            && schema.matches(packet, base_offset, ctx)
        {
            delta.insert("mode".into(), Value::from(mode));
            break;
        }
    }
    for &action in CLIMATE_ACTIONS {
        let key = format!("state_{action}");
        if let Some(schema) = entity.property(&key)
            && schema.matches(packet, base_offset, ctx)
        {
            delta.insert("action".into(), Value::from(action));
            break;
        }
    }
    if let Some(schema) = entity.property("state_temperature_current")
        && let Some(value) = schema.extract(packet, base_offset)
    {
        delta.insert("current_temperature".into(), value);
    }
    if let Some(schema) = entity.property("state_temperature_target")
        && let Some(value) = schema.extract(packet, base_offset)
    {
        delta.insert("target_temperature".into(), value);
    }
    delta
}

/// Sensors and settables: a single `state` value.
///
/// The value comes from the `state_value` sub-schema when declared, else from
/// the decode fields of the primary selector itself.
fn decode_reading(entity: &Entity, packet: &[u8], base_offset: usize) -> StateDelta {
    let mut delta = StateDelta::new();
    let schema = entity.property("state_value").unwrap_or(&entity.state);
    if let Some(value) = schema.extract(packet, base_offset) {
        delta.insert("state".into(), value);
    }
    delta
}

fn first_matching(
    entity: &Entity,
    packet: &[u8],
    base_offset: usize,
    ctx: &mut MatchContext<'_>,
    branches: Branches,
) -> Option<&'static str> {
    for (key, value) in branches {
        if let Some(schema) = entity.property(key)
            && schema.matches(packet, base_offset, ctx)
        {
            return Some(value);
        }
    }
    None
}

/// Startup state for an optimistic entity.
pub fn optimistic_seed(kind: EntityKind) -> StateDelta {
    let mut delta = StateDelta::new();
    match kind {
        EntityKind::Light | EntityKind::Switch | EntityKind::Fan | EntityKind::BinarySensor => {
            delta.insert("state".into(), Value::from("OFF"));
        },
        EntityKind::Valve => {
            delta.insert("state".into(), Value::from("closed"));
        },
        EntityKind::Lock => {
            delta.insert("state".into(), Value::from("UNLOCKED"));
        },
        EntityKind::Climate => {
            delta.insert("mode".into(), Value::from("off"));
        },
        EntityKind::Button
        | EntityKind::Sensor
        | EntityKind::Number
        | EntityKind::Select
        | EntityKind::Text
        | EntityKind::TextSensor => {},
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Bindings, NullEngine};

    fn entity(kind: EntityKind, yaml: &str) -> Entity {
        Entity::from_config(kind, serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    fn decode_with(entity: &Entity, packet: &[u8], base_offset: usize) -> Option<DeviceUpdate> {
        let engine = NullEngine;
        let mut bindings = Bindings::new();
        let mut ctx =
            MatchContext { engine: &engine, bindings: &mut bindings, allow_empty_data: false };
        decode(entity, packet, base_offset, &mut ctx)
    }

    fn state(update: Option<DeviceUpdate>) -> StateDelta {
        match update {
            Some(DeviceUpdate::State(delta)) => delta,
            other => panic!("expected state delta, got {other:?}"),
        }
    }

    #[test]
    fn light_on_off() {
        let light = entity(
            EntityKind::Light,
            "{id: l, state: {offset: 0, data: [0x31]}, state_on: {offset: 1, data: [0x01]}, state_off: {offset: 1, data: [0x00]}}",
        );
        let delta = state(decode_with(&light, &[0x31, 0x01], 0));
        assert_eq!(delta.get("state"), Some(&Value::from("ON")));
        let delta = state(decode_with(&light, &[0x31, 0x00], 0));
        assert_eq!(delta.get("state"), Some(&Value::from("OFF")));
        // Selector mismatch: not about this entity.
        assert_eq!(decode_with(&light, &[0x32, 0x01], 0), None);
    }

    #[test]
    fn fan_full_decode() {
        let fan = entity(
            EntityKind::Fan,
            "{id: f, state: {offset: 0, data: [0x40]},
              state_on: {offset: 1, data: [0x01]},
              state_speed: {offset: 2, length: 1},
              state_oscillating: {offset: 3, data: [0x01]},
              state_direction: {offset: 4, data: [0x00]}}",
        );
        let delta = state(decode_with(&fan, &[0x40, 0x01, 0x32, 0x01, 0x00], 0));
        assert_eq!(delta.get("state"), Some(&Value::from("ON")));
        assert_eq!(delta.get("speed"), Some(&Value::Int(50)));
        assert_eq!(delta.get("oscillating"), Some(&Value::Bool(true)));
        assert_eq!(delta.get("direction"), Some(&Value::from("forward")));
    }

    #[test]
    fn climate_masked_decode() {
        let climate = entity(
            EntityKind::Climate,
            "{id: c, state: {data: [0x80, 0x00, 0x04], mask: [0xF9, 0x00, 0xFF]},
              state_temperature_current: {offset: 3, decode: bcd},
              state_temperature_target: {offset: 4, decode: bcd},
              state_off: {offset: 1, data: [0x80]}}",
        );
        let delta = state(decode_with(
            &climate,
            &[0x82, 0x80, 0x04, 0x22, 0x15, 0x00, 0x00, 0x3D],
            0,
        ));
        assert_eq!(delta.get("current_temperature"), Some(&Value::Int(22)));
        assert_eq!(delta.get("target_temperature"), Some(&Value::Int(15)));
        assert_eq!(delta.get("mode"), Some(&Value::from("off")));
    }

    #[test]
    fn sensor_reads_from_selector() {
        let sensor = entity(
            EntityKind::Sensor,
            "{id: s, state: {offset: 0, data: [0x71]}, state_value: {offset: 1, length: 2, precision: 1}}",
        );
        let delta = state(decode_with(&sensor, &[0x71, 0x00, 0xE7], 0));
        assert_eq!(delta.get("state"), Some(&Value::Float(23.1)));
    }

    #[test]
    fn button_is_transient() {
        let button = entity(EntityKind::Button, "{id: b, state: {offset: 0, data: [0x50]}}");
        assert_eq!(decode_with(&button, &[0x50], 0), Some(DeviceUpdate::Event("press")));
    }

    #[test]
    fn optimistic_entities_never_match() {
        let switch = entity(EntityKind::Switch, "{id: o, optimistic: true}");
        assert_eq!(decode_with(&switch, &[0x00], 0), None);
        assert_eq!(optimistic_seed(EntityKind::Switch).get("state"), Some(&Value::from("OFF")));
    }

    #[test]
    fn base_offset_applies_to_all_schemas() {
        let light = entity(
            EntityKind::Light,
            "{id: l, state: {offset: 0, data: [0x31]}, state_on: {offset: 1, data: [0x01]}}",
        );
        // One header byte ahead of the entity-relative offsets.
        let delta = state(decode_with(&light, &[0xF7, 0x31, 0x01], 1));
        assert_eq!(delta.get("state"), Some(&Value::from("ON")));
    }
}
