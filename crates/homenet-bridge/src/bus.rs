//! The per-bus event loop.
//!
//! One logical task owns the whole pipeline: transport bytes feed the parser,
//! extracted packets run through ack-clearing, the entity matchers, and the
//! automation engine; merges fan out as retained state publishes and
//! state-changed triggers; inbound `set` messages and automation effects flow
//! through the assembler back onto the wire. Buses are fully isolated; a
//! process may run several on separate tasks.

use std::sync::Arc;
use std::time::Duration;

use homenet_core::{
    CommandAssembler, CommandRetry, CoreError, EntityRegistry, PendingCommands, StateDelta,
    StateStore, StoreEffect, Value,
    automation::{AutomationEngine, AutomationRule, EngineEffect, EngineHandles},
    device::{self, DeviceUpdate},
    schema::MatchContext,
    script::{Bindings, ScriptEngine},
};
use homenet_proto::{FrameParser, Packet, PacketDefaults};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{
    broker::{Broker, InboundMessage, Topics},
    config::{BridgeConfig, ConfigError},
    transport::ByteTransport,
};

/// Errors that abort bus startup. Runtime failures (bad commands, transport
/// hiccups, broker drops) are logged and absorbed instead.
#[derive(Error, Debug)]
pub enum BusError {
    /// Configuration is structurally invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A rule failed to compile.
    #[error(transparent)]
    Rules(#[from] CoreError),
}

/// Idle placeholder for select branches whose timer is disarmed.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

/// One bridged bus.
pub struct Bus<T: ByteTransport, B: Broker> {
    transport: T,
    broker: B,
    topics: Topics,
    defaults: PacketDefaults,
    parser: FrameParser,
    registry: EntityRegistry,
    store: StateStore,
    assembler: CommandAssembler,
    pending: PendingCommands,
    rules: Vec<AutomationRule>,
    scripts: Arc<dyn ScriptEngine>,
    bindings: Bindings,
    idle_deadline: Option<Instant>,
}

impl<T: ByteTransport, B: Broker> Bus<T, B> {
    /// Build a bus from a validated configuration.
    pub fn new(
        config: BridgeConfig,
        transport: T,
        broker: B,
        scripts: Arc<dyn ScriptEngine>,
        prefix: &str,
    ) -> Result<Self, BusError> {
        config.packet_defaults.validate().map_err(ConfigError::Framing)?;
        let registry = config.build_registry()?;
        Ok(Self {
            transport,
            broker,
            topics: Topics::new(prefix),
            parser: FrameParser::new(config.packet_defaults.clone()),
            assembler: CommandAssembler::new(config.packet_defaults.clone()),
            defaults: config.packet_defaults,
            registry,
            store: StateStore::new(),
            pending: PendingCommands::new(),
            rules: config.automation,
            scripts,
            bindings: Bindings::new(),
            idle_deadline: None,
        })
    }

    /// Run the bus until the transport closes.
    ///
    /// Startup publishes `online` availability and seeds optimistic
    /// entities; shutdown publishes `offline` and stops the engine.
    pub async fn run(mut self) -> Result<(), BusError> {
        let (effects_tx, mut effects_rx) = mpsc::unbounded_channel();
        let handles = EngineHandles {
            scripts: Arc::clone(&self.scripts),
            states: self.store.view(),
            effects: effects_tx,
        };
        let engine =
            AutomationEngine::start(&self.rules, handles, self.defaults.rx_header.len())?;

        let ids: Vec<String> = self.registry.iter().map(|entity| entity.id.clone()).collect();
        for id in &ids {
            let topic = self.topics.availability(id);
            self.publish(&topic, "online", true).await;
        }
        let seeds: Vec<(String, StateDelta)> = self
            .registry
            .iter()
            .filter(|entity| entity.optimistic)
            .map(|entity| (entity.id.clone(), device::optimistic_seed(entity.kind)))
            .collect();
        for (id, seed) in seeds {
            self.merge(&engine, &id, seed).await;
        }

        let rx_timeout = Duration::from_millis(self.defaults.rx_timeout_ms());
        let mut broker_open = true;
        loop {
            let idle_at = self.idle_deadline.unwrap_or_else(far_future);
            let ack_deadline = self.pending.next_deadline();
            let ack_at = ack_deadline.unwrap_or_else(far_future);

            tokio::select! {
                chunk = self.transport.recv() => {
                    let Some(bytes) = chunk else { break };
                    let packets = self.parser.feed(&bytes);
                    self.idle_deadline =
                        (self.parser.pending() > 0).then(|| Instant::now() + rx_timeout);
                    for packet in packets {
                        self.handle_packet(&engine, &packet).await;
                    }
                },
                message = self.broker.recv(), if broker_open => {
                    match message {
                        Some(message) => self.handle_inbound(&engine, message).await,
                        None => {
                            tracing::warn!("broker closed, continuing without inbound commands");
                            broker_open = false;
                        },
                    }
                },
                effect = effects_rx.recv() => {
                    if let Some(effect) = effect {
                        self.handle_effect(&engine, effect).await;
                    }
                },
                () = tokio::time::sleep_until(idle_at), if self.idle_deadline.is_some() => {
                    self.idle_deadline = None;
                    for packet in self.parser.idle_flush() {
                        self.handle_packet(&engine, &packet).await;
                    }
                },
                () = tokio::time::sleep_until(ack_at), if ack_deadline.is_some() => {
                    self.poll_pending(&engine).await;
                },
            }
        }

        engine.shutdown();
        for id in &ids {
            let topic = self.topics.availability(id);
            self.publish(&topic, "offline", true).await;
        }
        Ok(())
    }

    /// Packet pipeline: ack window, matchers in catalog order, automation.
    async fn handle_packet(&mut self, engine: &AutomationEngine, packet: &Packet) {
        tracing::debug!(%packet, "rx");
        let raw_topic = self.topics.bridge("packet");
        self.publish(&raw_topic, &packet.to_string(), false).await;

        let base_offset = self.defaults.rx_header.len();
        let mut updates: Vec<(String, DeviceUpdate)> = Vec::new();
        {
            let mut ctx = MatchContext {
                engine: self.scripts.as_ref(),
                bindings: &mut self.bindings,
                allow_empty_data: false,
            };
            for id in self.pending.acknowledge(packet.as_slice(), base_offset, &mut ctx) {
                tracing::debug!(entity = %id, "command acknowledged");
            }
            for entity in self.registry.iter() {
                if let Some(update) =
                    device::decode(entity, packet.as_slice(), base_offset, &mut ctx)
                {
                    updates.push((entity.id.clone(), update));
                }
            }
        }
        for (entity_id, update) in updates {
            match update {
                DeviceUpdate::State(delta) => self.merge(engine, &entity_id, delta).await,
                DeviceUpdate::Event(event) => {
                    let topic = self.topics.event(&entity_id);
                    let payload = format!("{{\"event\":\"{event}\"}}");
                    self.publish(&topic, &payload, false).await;
                },
            }
        }

        engine.on_packet(packet);
    }

    /// Merge a delta and fan out its effects.
    async fn merge(&mut self, engine: &AutomationEngine, entity_id: &str, delta: StateDelta) {
        for effect in self.store.merge(entity_id, delta) {
            match effect {
                StoreEffect::Publish { entity_id, payload } => {
                    let topic = self.topics.state(&entity_id);
                    self.publish(&topic, &payload, true).await;
                },
                StoreEffect::Changed { entity_id, state } => {
                    engine.on_state_changed(&entity_id, state);
                },
            }
        }
    }

    /// Inbound `set` / `set_<property>` messages.
    async fn handle_inbound(&mut self, engine: &AutomationEngine, message: InboundMessage) {
        let Some((entity_id, property)) = self.topics.parse_set(&message.topic) else {
            tracing::debug!(topic = %message.topic, "ignoring non-command topic");
            return;
        };
        let entity_id = entity_id.to_owned();
        let commands = match property {
            Some(property) => vec![(property.to_owned(), Some(parse_value(&message.payload)))],
            None => whole_entity_commands(&message.payload),
        };
        for (command, arg) in commands {
            self.dispatch_command(engine, &entity_id, &command, arg.as_ref()).await;
        }
    }

    /// Resolve and execute one logical command.
    async fn dispatch_command(
        &mut self,
        engine: &AutomationEngine,
        entity_id: &str,
        command: &str,
        arg: Option<&Value>,
    ) {
        let Some(entity) = self.registry.get(entity_id).cloned() else {
            tracing::warn!(entity = %entity_id, command, "command for unknown entity");
            return;
        };
        let current = self.store.get(entity_id).cloned();
        let outcome = match self.assembler.assemble(
            &entity,
            command,
            arg,
            current.as_ref(),
            self.scripts.as_ref(),
            &mut self.bindings,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(entity = %entity_id, command, error = %err, "command dropped");
                return;
            },
        };

        if let Some(frame) = outcome.frame {
            tracing::debug!(entity = %entity_id, command, tx = %Packet::new(frame.bytes.clone()), "tx");
            if let Err(err) = self.transport.send(&frame.bytes).await {
                tracing::warn!(entity = %entity_id, error = %err, "command write failed");
            } else if let Some(ack) = entity.ack.clone() {
                self.pending.track(entity_id, command, ack, &frame, Instant::now());
            }
        }
        if let Some(delta) = outcome.local {
            self.merge(engine, entity_id, delta).await;
        }
    }

    /// Automation effects.
    async fn handle_effect(&mut self, engine: &AutomationEngine, effect: EngineEffect) {
        match effect {
            EngineEffect::Publish { topic, payload, retain } => {
                self.publish(&topic, &payload, retain).await;
            },
            EngineEffect::SendFrame { bytes, .. } => {
                tracing::debug!(tx = %Packet::new(bytes.clone()), "automation tx");
                if let Err(err) = self.transport.send(&bytes).await {
                    tracing::warn!(error = %err, "automation write failed");
                }
            },
            EngineEffect::Command { entity_id, command, arg } => {
                self.dispatch_command(engine, &entity_id, &command, arg.as_ref()).await;
            },
        }
    }

    /// Overdue pending commands: resend or surface failure.
    async fn poll_pending(&mut self, _engine: &AutomationEngine) {
        for retry in self.pending.poll(Instant::now()) {
            match retry {
                CommandRetry::Resend { entity_id, bytes } => {
                    tracing::debug!(entity = %entity_id, "resending unacknowledged command");
                    if let Err(err) = self.transport.send(&bytes).await {
                        tracing::warn!(entity = %entity_id, error = %err, "resend failed");
                    }
                },
                CommandRetry::Failed { entity_id, command } => {
                    let topic = self.topics.bridge("command_failed");
                    let payload =
                        format!("{{\"entity_id\":\"{entity_id}\",\"command\":\"{command}\"}}");
                    self.publish(&topic, &payload, false).await;
                },
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &str, retain: bool) {
        if let Err(err) = self.broker.publish(topic, payload, retain).await {
            tracing::warn!(topic, error = %err, "publish failed");
        }
    }
}

/// Interpret a whole-entity `set` payload.
///
/// `ON`/`OFF`/`TOGGLE` (any case) map to the discrete commands; a JSON object
/// maps per key (`{"state": "ON", "speed": 50}` → `on` plus `speed(50)`); a
/// bare number or string becomes `set`.
fn whole_entity_commands(payload: &str) -> Vec<(String, Option<Value>)> {
    if let Ok(serde_json::Value::Object(map)) =
        serde_json::from_str::<serde_json::Value>(payload)
    {
        let mut commands = Vec::new();
        for (key, value) in map {
            if key == "state" {
                if let Some(command) = discrete_command(value.as_str().unwrap_or_default()) {
                    commands.push((command, None));
                    continue;
                }
            }
            commands.push((key, json_to_value(value)));
        }
        return commands;
    }
    if let Some(command) = discrete_command(payload) {
        return vec![(command, None)];
    }
    vec![("set".to_owned(), Some(parse_value(payload)))]
}

fn discrete_command(payload: &str) -> Option<String> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "on" | "off" | "toggle" | "open" | "close" | "lock" | "unlock" | "press" => {
            Some(payload.trim().to_ascii_lowercase())
        },
        _ => None,
    }
}

/// Payload → value: JSON scalar when it parses, raw string otherwise.
fn parse_value(payload: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(json) => json_to_value(json).unwrap_or_else(|| Value::Str(payload.to_owned())),
        Err(_) => Value::Str(payload.to_owned()),
    }
}

fn json_to_value(json: serde_json::Value) -> Option<Value> {
    match json {
        serde_json::Value::Bool(b) => Some(Value::Bool(b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::Int(i))
            } else {
                n.as_f64().map(Value::Float)
            }
        },
        serde_json::Value::String(s) => Some(Value::Str(s)),
        serde_json::Value::Null
        | serde_json::Value::Array(_)
        | serde_json::Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_entity_payload_shapes() {
        assert_eq!(whole_entity_commands("ON"), vec![("on".to_owned(), None)]);
        assert_eq!(whole_entity_commands("Toggle"), vec![("toggle".to_owned(), None)]);
        assert_eq!(
            whole_entity_commands("21.5"),
            vec![("set".to_owned(), Some(Value::Float(21.5)))]
        );

        let mut commands = whole_entity_commands(r#"{"state": "ON", "speed": 50}"#);
        commands.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            commands,
            vec![
                ("on".to_owned(), None),
                ("speed".to_owned(), Some(Value::Int(50)))
            ]
        );
    }

    #[test]
    fn payload_value_parsing() {
        assert_eq!(parse_value("50"), Value::Int(50));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("\"heat\""), Value::Str("heat".into()));
        assert_eq!(parse_value("heat"), Value::Str("heat".into()));
    }
}
