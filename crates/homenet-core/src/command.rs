//! Logical command → framed outbound bytes, with ack tracking.

use std::collections::VecDeque;
use std::time::Duration;

use homenet_proto::PacketDefaults;
use tokio::time::Instant;

use crate::{
    CoreError, Entity, StateDelta, Value,
    schema::{MatchContext, StateSchema},
    script::{Bindings, ScriptEngine},
};

/// A fully framed outbound frame plus retry alternatives.
#[derive(Debug, Clone, PartialEq)]
pub struct TxFrame {
    /// Primary frame, framing and checksum applied.
    pub bytes: Vec<u8>,
    /// Alternative frames tried in order across retries.
    pub alternatives: Vec<Vec<u8>>,
}

/// What a logical command resolves to.
///
/// Most commands produce a frame. Optimistic entities additionally (or, with
/// no template declared, exclusively) echo a local state delta, since nothing
/// on the bus will confirm them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutcome {
    /// Frame to hand to the transport.
    pub frame: Option<TxFrame>,
    /// Delta to merge into the local state store.
    pub local: Option<StateDelta>,
}

/// Synthesises outbound frames from the bus framing contract.
#[derive(Debug, Clone)]
pub struct CommandAssembler {
    defaults: PacketDefaults,
}

impl CommandAssembler {
    /// Assembler for one bus.
    pub fn new(defaults: PacketDefaults) -> Self {
        Self { defaults }
    }

    /// Resolve `(entity, command, arg)` into an outcome.
    ///
    /// # Errors
    ///
    /// Unknown commands and payload-construction failures; the caller logs
    /// and drops the command.
    pub fn assemble(
        &self,
        entity: &Entity,
        command: &str,
        arg: Option<&Value>,
        current: Option<&StateDelta>,
        engine: &dyn ScriptEngine,
        bindings: &mut Bindings,
    ) -> Result<CommandOutcome, CoreError> {
        let mut outcome = CommandOutcome::default();

        if let Some(schema) = entity.command(command) {
            let mut payloads = schema.construct(arg, engine, bindings)?.into_iter();
            let Some(primary) = payloads.next() else {
                return Err(CoreError::UnknownCommand {
                    entity: entity.id.clone(),
                    command: command.to_owned(),
                });
            };
            outcome.frame = Some(TxFrame {
                bytes: self.frame_payload(&primary),
                alternatives: payloads.map(|alt| self.frame_payload(&alt)).collect(),
            });
        } else if !entity.optimistic {
            return Err(CoreError::UnknownCommand {
                entity: entity.id.clone(),
                command: command.to_owned(),
            });
        }

        if entity.optimistic {
            outcome.local = optimistic_delta(entity, command, arg, current);
            if outcome.frame.is_none() && outcome.local.is_none() {
                return Err(CoreError::UnknownCommand {
                    entity: entity.id.clone(),
                    command: command.to_owned(),
                });
            }
        }
        Ok(outcome)
    }

    /// Dress a payload: `tx_header` + payload + checksum trailer + `tx_footer`.
    pub fn frame_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame =
            Vec::with_capacity(self.defaults.tx_header.len() + payload.len() + 4);
        frame.extend_from_slice(&self.defaults.tx_header);
        frame.extend_from_slice(payload);
        self.defaults.append_tx_trailer(&mut frame);
        frame.extend_from_slice(&self.defaults.tx_footer);
        frame
    }
}

/// Local state echo for an optimistic entity.
fn optimistic_delta(
    entity: &Entity,
    command: &str,
    arg: Option<&Value>,
    current: Option<&StateDelta>,
) -> Option<StateDelta> {
    use crate::EntityKind;

    let (on, off) = match entity.kind {
        EntityKind::Valve => ("open", "closed"),
        EntityKind::Lock => ("LOCKED", "UNLOCKED"),
        _ => ("ON", "OFF"),
    };

    let mut delta = StateDelta::new();
    match command {
        "on" | "open" | "lock" => {
            delta.insert("state".into(), Value::from(on));
        },
        "off" | "close" | "unlock" => {
            delta.insert("state".into(), Value::from(off));
        },
        "toggle" => {
            let is_on = current
                .and_then(|state| state.get("state"))
                .and_then(Value::as_str)
                .is_some_and(|state| state == on);
            delta.insert("state".into(), Value::from(if is_on { off } else { on }));
        },
        "set" => {
            delta.insert("state".into(), arg?.clone());
        },
        _ => return None,
    }
    Some(delta)
}

/// Maximum send attempts per command (initial send included).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base ack window; doubles per attempt.
pub const BASE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Pending {
    entity_id: String,
    command: String,
    ack: StateSchema,
    bytes: Vec<u8>,
    alternatives: VecDeque<Vec<u8>>,
    attempt: u32,
    deadline: Instant,
}

/// Retry decisions returned by [`PendingCommands::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRetry {
    /// Resend these bytes.
    Resend {
        /// Entity the command belongs to.
        entity_id: String,
        /// Frame to write.
        bytes: Vec<u8>,
    },
    /// Attempts exhausted; surface a `command-failed` event.
    Failed {
        /// Entity the command belongs to.
        entity_id: String,
        /// Command name.
        command: String,
    },
}

/// Pending-ack window per entity.
///
/// A command whose entity declares an `ack` schema stays pending until a
/// matching RX packet arrives; otherwise it is resent with exponential
/// backoff and finally surfaced as failed. One pending slot per entity: a
/// newer command replaces the older one.
#[derive(Debug, Default)]
pub struct PendingCommands {
    pending: Vec<Pending>,
}

impl PendingCommands {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pending window for a just-sent frame.
    pub fn track(
        &mut self,
        entity_id: &str,
        command: &str,
        ack: StateSchema,
        frame: &TxFrame,
        now: Instant,
    ) {
        self.pending.retain(|pending| pending.entity_id != entity_id);
        self.pending.push(Pending {
            entity_id: entity_id.to_owned(),
            command: command.to_owned(),
            ack,
            bytes: frame.bytes.clone(),
            alternatives: frame.alternatives.iter().cloned().collect(),
            attempt: 1,
            deadline: now + BASE_BACKOFF,
        });
    }

    /// Clear every pending command whose ack schema matches this packet.
    ///
    /// Returns the entity ids that were acknowledged.
    pub fn acknowledge(
        &mut self,
        packet: &[u8],
        base_offset: usize,
        ctx: &mut MatchContext<'_>,
    ) -> Vec<String> {
        let mut cleared = Vec::new();
        self.pending.retain(|pending| {
            if pending.ack.matches(packet, base_offset, ctx) {
                cleared.push(pending.entity_id.clone());
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Earliest deadline, for the bus timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|pending| pending.deadline).min()
    }

    /// Advance every overdue pending command.
    ///
    /// Retries prefer the next alternative payload when the command produced
    /// alternatives; the last alternative is then repeated.
    pub fn poll(&mut self, now: Instant) -> Vec<CommandRetry> {
        let mut actions = Vec::new();
        self.pending.retain_mut(|pending| {
            if pending.deadline > now {
                return true;
            }
            if pending.attempt >= MAX_ATTEMPTS {
                tracing::warn!(
                    entity = %pending.entity_id,
                    command = %pending.command,
                    attempts = pending.attempt,
                    "command unacknowledged, giving up"
                );
                actions.push(CommandRetry::Failed {
                    entity_id: pending.entity_id.clone(),
                    command: pending.command.clone(),
                });
                return false;
            }
            if let Some(alternative) = pending.alternatives.pop_front() {
                pending.bytes = alternative;
            }
            pending.attempt += 1;
            pending.deadline = now + BASE_BACKOFF * 2u32.pow(pending.attempt - 1);
            actions.push(CommandRetry::Resend {
                entity_id: pending.entity_id.clone(),
                bytes: pending.bytes.clone(),
            });
            true
        });
        actions
    }

    /// Number of commands still awaiting an ack.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use homenet_proto::Checksum;

    use super::*;
    use crate::EntityKind;
    use crate::script::NullEngine;

    fn assembler() -> CommandAssembler {
        CommandAssembler::new(PacketDefaults {
            tx_header: vec![0xF7],
            tx_footer: vec![0xEE],
            tx_checksum: Checksum::Add,
            ..PacketDefaults::default()
        })
    }

    fn entity(kind: EntityKind, yaml: &str) -> Entity {
        Entity::from_config(kind, serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    fn assemble(
        assembler: &CommandAssembler,
        entity: &Entity,
        command: &str,
        arg: Option<Value>,
    ) -> Result<CommandOutcome, CoreError> {
        let mut bindings = Bindings::new();
        assembler.assemble(entity, command, arg.as_ref(), None, &NullEngine, &mut bindings)
    }

    #[test]
    fn frames_with_header_checksum_footer() {
        let light = entity(
            EntityKind::Light,
            "{id: l, state: {data: [0x31]}, command_on: {data: [0x31, 0x01]}}",
        );
        let outcome = assemble(&assembler(), &light, "on", None).unwrap();
        // F7 31 01, add checksum 0x29, footer EE.
        assert_eq!(
            outcome.frame.unwrap().bytes,
            vec![0xF7, 0x31, 0x01, 0x29, 0xEE]
        );
        assert_eq!(outcome.local, None);
    }

    #[test]
    fn value_command() {
        let climate = entity(
            EntityKind::Climate,
            "{id: c, state: {data: [0x80]}, command_temperature: {data: [0x80, 0x00], value_offset: 1, decode: bcd}}",
        );
        let outcome =
            assemble(&assembler(), &climate, "temperature", Some(Value::Int(22))).unwrap();
        let bytes = outcome.frame.unwrap().bytes;
        assert_eq!(bytes[2], 0x22);
    }

    #[test]
    fn unknown_command_errors() {
        let light = entity(EntityKind::Light, "{id: l, state: {data: [0x31]}}");
        assert!(matches!(
            assemble(&assembler(), &light, "on", None),
            Err(CoreError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn optimistic_commands_echo_locally() {
        let switch = entity(EntityKind::Switch, "{id: o, optimistic: true}");
        let outcome = assemble(&assembler(), &switch, "on", None).unwrap();
        assert_eq!(outcome.frame, None);
        assert_eq!(
            outcome.local.unwrap().get("state"),
            Some(&Value::from("ON"))
        );

        // Toggle flips from the current record.
        let mut current = StateDelta::new();
        current.insert("state".into(), Value::from("ON"));
        let mut bindings = Bindings::new();
        let outcome = assembler()
            .assemble(&switch, "toggle", None, Some(&current), &NullEngine, &mut bindings)
            .unwrap();
        assert_eq!(
            outcome.local.unwrap().get("state"),
            Some(&Value::from("OFF"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_ack_clears_on_matching_packet() {
        let mut pending = PendingCommands::new();
        let ack: StateSchema = serde_yaml::from_str("{offset: 0, data: [0xB0]}").unwrap();
        let frame = TxFrame { bytes: vec![0x01], alternatives: vec![] };
        pending.track("light", "on", ack, &frame, Instant::now());
        assert_eq!(pending.len(), 1);

        let engine = NullEngine;
        let mut bindings = Bindings::new();
        let mut ctx =
            MatchContext { engine: &engine, bindings: &mut bindings, allow_empty_data: false };
        assert!(pending.acknowledge(&[0xC0, 0x00], 0, &mut ctx).is_empty());
        assert_eq!(pending.acknowledge(&[0xB0, 0x00], 0, &mut ctx), vec!["light".to_owned()]);
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_command_retries_then_fails() {
        let mut pending = PendingCommands::new();
        let ack: StateSchema = serde_yaml::from_str("{offset: 0, data: [0xB0]}").unwrap();
        let frame = TxFrame { bytes: vec![0x01], alternatives: vec![vec![0x02]] };
        let start = Instant::now();
        pending.track("light", "on", ack, &frame, start);

        // First deadline: resend, preferring the alternative payload.
        let actions = pending.poll(start + BASE_BACKOFF);
        assert_eq!(
            actions,
            vec![CommandRetry::Resend { entity_id: "light".into(), bytes: vec![0x02] }]
        );

        // Backoff doubled: nothing due yet at +1 base.
        assert!(pending.poll(start + BASE_BACKOFF * 2).is_empty());

        let actions = pending.poll(start + BASE_BACKOFF * 4);
        assert_eq!(
            actions,
            vec![CommandRetry::Resend { entity_id: "light".into(), bytes: vec![0x02] }]
        );

        // Third attempt exhausted the budget.
        let actions = pending.poll(start + BASE_BACKOFF * 16);
        assert_eq!(
            actions,
            vec![CommandRetry::Failed { entity_id: "light".into(), command: "on".into() }]
        );
        assert!(pending.is_empty());
    }
}
