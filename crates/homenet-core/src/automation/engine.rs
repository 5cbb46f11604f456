//! Trigger routing, concurrency modes, and invocation execution.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use homenet_proto::Packet;
use tokio::sync::{mpsc, watch};

use super::{
    AutomationRule, CommandTarget, RuleMode, Trigger,
    action::{Action, PublishAction, SendPacketAction},
    target::TargetArg,
    trigger::CompiledMatch,
};
use crate::{
    CoreError, StateDelta, Value,
    schema::{MatchContext, StateSchema},
    script::{Bindings, EvalMode, ScriptEngine, ScriptValue},
    store::StateView,
};

/// Bound on a queued-mode rule's trigger queue; overflow drops the oldest.
const QUEUE_BOUND: usize = 32;

/// Side effects produced by running invocations.
///
/// The bus runtime executes these: publishes go to the broker, frames to the
/// transport, commands to the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEffect {
    /// `publish` action.
    Publish {
        /// Broker topic.
        topic: String,
        /// Message payload.
        payload: String,
        /// Publish retained.
        retain: bool,
    },
    /// `send_packet` action: raw frame bytes for the transport.
    SendFrame {
        /// Frame to write.
        bytes: Vec<u8>,
        /// Retry alternatives, in order.
        alternatives: Vec<Vec<u8>>,
    },
    /// `command` action, argument already resolved.
    Command {
        /// Target entity id.
        entity_id: String,
        /// Command name.
        command: String,
        /// Resolved argument.
        arg: Option<Value>,
    },
}

/// Capabilities an invocation runs against.
#[derive(Clone)]
pub struct EngineHandles {
    /// Expression evaluator.
    pub scripts: Arc<dyn ScriptEngine>,
    /// Read view of bus state.
    pub states: StateView,
    /// Effect outbox consumed by the bus runtime.
    pub effects: mpsc::UnboundedSender<EngineEffect>,
}

#[derive(Debug)]
enum EngineMsg {
    Packet(Packet),
    StateChanged { entity_id: String, state: StateDelta },
    Fire { rule: usize, ctx: TriggerContext },
    Done { rule: usize, invocation: u64 },
    Shutdown,
}

/// What fired an invocation; bound as `trigger`/`data` in its expressions.
#[derive(Debug, Clone)]
enum TriggerContext {
    Startup,
    Packet(Packet),
    State { entity_id: String, state: StateDelta },
    Time,
}

struct CompiledStateTrigger {
    entity_id: String,
    property: String,
    matcher: CompiledMatch,
}

struct CompiledRule {
    id: String,
    mode: RuleMode,
    packet_triggers: Vec<StateSchema>,
    state_triggers: Vec<CompiledStateTrigger>,
    actions: Arc<[Action]>,
}

enum TimerSpec {
    Startup(Option<Duration>),
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

/// The per-bus automation engine.
///
/// Owns a coordinator task that routes triggers to rules and enforces
/// concurrency modes; invocations run as spawned tasks reporting completion
/// back through the same inbox, so mode bookkeeping is single-writer.
pub struct AutomationEngine {
    inbox: mpsc::UnboundedSender<EngineMsg>,
}

impl AutomationEngine {
    /// Compile the rules and start the engine.
    ///
    /// Must run inside a tokio runtime. Disabled rules are compiled (so
    /// structural errors surface at load) but never fire.
    ///
    /// # Errors
    ///
    /// Structural rule errors: bad regexes, bad cron expressions, malformed
    /// command targets, a `repeat` with neither `times` nor `while`, a
    /// `send_packet` with neither `data` nor `expr`, a `time` trigger with
    /// neither `interval` nor `cron`. These abort bus startup.
    pub fn start(
        rules: &[AutomationRule],
        handles: EngineHandles,
        base_offset: usize,
    ) -> Result<Self, CoreError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut compiled = Vec::with_capacity(rules.len());
        let mut timers: Vec<(usize, TimerSpec)> = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            let id = rule.id.clone().unwrap_or_else(|| format!("automation_{index}"));
            let invalid = |reason: String| CoreError::InvalidRule { id: id.clone(), reason };
            validate_actions(&rule.then, &id)?;

            let mut packet_triggers = Vec::new();
            let mut state_triggers = Vec::new();
            for trigger in &rule.trigger {
                match trigger {
                    Trigger::Packet { matches } => packet_triggers.push(matches.clone()),
                    Trigger::State { entity_id, property, matches } => {
                        let matcher = matches
                            .compile()
                            .map_err(|err| invalid(format!("bad match pattern: {err}")))?;
                        state_triggers.push(CompiledStateTrigger {
                            entity_id: entity_id.clone(),
                            property: property.clone().unwrap_or_else(|| "state".to_owned()),
                            matcher,
                        });
                    },
                    Trigger::Startup { delay } => {
                        timers.push((index, TimerSpec::Startup(delay.map(Into::into))));
                    },
                    Trigger::Time { interval, cron } => match (interval, cron) {
                        (Some(interval), _) => {
                            timers.push((index, TimerSpec::Interval(interval.0)));
                        },
                        (None, Some(cron)) => {
                            let schedule = cron::Schedule::from_str(cron)
                                .map_err(|err| invalid(format!("bad cron expression: {err}")))?;
                            timers.push((index, TimerSpec::Cron(Box::new(schedule))));
                        },
                        (None, None) => {
                            return Err(invalid(
                                "time trigger needs interval or cron".to_owned(),
                            ));
                        },
                    },
                }
            }

            if !rule.enabled {
                // Compiled for validation only.
                packet_triggers.clear();
                state_triggers.clear();
                timers.retain(|(rule_index, _)| *rule_index != index);
            }

            compiled.push(CompiledRule {
                id,
                mode: rule.mode,
                packet_triggers,
                state_triggers,
                actions: rule.then.clone().into(),
            });
        }

        for (rule, spec) in timers {
            spawn_timer(rule, spec, inbox_tx.clone());
        }

        let runtimes = compiled.iter().map(|_| RuleRuntime::default()).collect();
        let coordinator = Coordinator {
            rules: compiled,
            runtimes,
            handles,
            base_offset,
            inbox_tx: inbox_tx.clone(),
            next_invocation: 0,
            bindings: Bindings::new(),
        };
        tokio::spawn(coordinator.run(inbox_rx));

        Ok(Self { inbox: inbox_tx })
    }

    /// Route an extracted packet to packet triggers.
    pub fn on_packet(&self, packet: &Packet) {
        let _ = self.inbox.send(EngineMsg::Packet(packet.clone()));
    }

    /// Route a state-changed event to state triggers.
    pub fn on_state_changed(&self, entity_id: &str, state: StateDelta) {
        let _ = self
            .inbox
            .send(EngineMsg::StateChanged { entity_id: entity_id.to_owned(), state });
    }

    /// Stop the coordinator; running invocations finish on their own.
    pub fn shutdown(&self) {
        let _ = self.inbox.send(EngineMsg::Shutdown);
    }
}

fn validate_actions(actions: &[Action], rule_id: &str) -> Result<(), CoreError> {
    let invalid = |reason: String| CoreError::InvalidRule { id: rule_id.to_owned(), reason };
    for action in actions {
        match action {
            Action::Command(target) => {
                CommandTarget::parse(target)?;
            },
            Action::SendPacket(send) => {
                if send.data.is_none() && send.expr.is_none() {
                    return Err(invalid("send_packet needs data or expr".to_owned()));
                }
            },
            Action::If(branch) => {
                validate_actions(&branch.then, rule_id)?;
                if let Some(otherwise) = &branch.otherwise {
                    validate_actions(otherwise, rule_id)?;
                }
            },
            Action::Choose(choose) => {
                for choice in &choose.choices {
                    validate_actions(&choice.then, rule_id)?;
                }
                if let Some(default) = &choose.default {
                    validate_actions(default, rule_id)?;
                }
            },
            Action::Repeat(repeat) => {
                if repeat.times.is_none() && repeat.while_condition.is_none() {
                    return Err(invalid("repeat needs times or while".to_owned()));
                }
                validate_actions(&repeat.then, rule_id)?;
            },
            Action::Publish(_) | Action::Delay(_) | Action::Log(_) | Action::Stop(_) => {},
        }
    }
    Ok(())
}

fn spawn_timer(rule: usize, spec: TimerSpec, inbox: mpsc::UnboundedSender<EngineMsg>) {
    tokio::spawn(async move {
        match spec {
            TimerSpec::Startup(delay) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = inbox.send(EngineMsg::Fire { rule, ctx: TriggerContext::Startup });
            },
            TimerSpec::Interval(period) => {
                let start = tokio::time::Instant::now() + period;
                let mut interval = tokio::time::interval_at(start, period);
                loop {
                    interval.tick().await;
                    if inbox.send(EngineMsg::Fire { rule, ctx: TriggerContext::Time }).is_err() {
                        break;
                    }
                }
            },
            TimerSpec::Cron(schedule) => {
                loop {
                    let Some(next) = schedule.upcoming(chrono::Local).next() else { break };
                    let wait =
                        (next - chrono::Local::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    if inbox.send(EngineMsg::Fire { rule, ctx: TriggerContext::Time }).is_err() {
                        break;
                    }
                }
            },
        }
    });
}

#[derive(Default)]
struct RuleRuntime {
    active: HashMap<u64, watch::Sender<bool>>,
    queue: VecDeque<TriggerContext>,
}

struct Coordinator {
    rules: Vec<CompiledRule>,
    runtimes: Vec<RuleRuntime>,
    handles: EngineHandles,
    base_offset: usize,
    inbox_tx: mpsc::UnboundedSender<EngineMsg>,
    next_invocation: u64,
    /// Reusable context buffer for packet-trigger guards.
    bindings: Bindings,
}

impl Coordinator {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = inbox.recv().await {
            match msg {
                EngineMsg::Packet(packet) => self.on_packet(&packet),
                EngineMsg::StateChanged { entity_id, state } => {
                    self.on_state_changed(&entity_id, &state);
                },
                EngineMsg::Fire { rule, ctx } => self.fire(rule, ctx),
                EngineMsg::Done { rule, invocation } => self.done(rule, invocation),
                EngineMsg::Shutdown => break,
            }
        }
    }

    /// Rules fire in configuration order for packets extracted together.
    fn on_packet(&mut self, packet: &Packet) {
        let mut to_fire = Vec::new();
        let scripts = Arc::clone(&self.handles.scripts);
        for (index, rule) in self.rules.iter().enumerate() {
            let mut ctx = MatchContext {
                engine: scripts.as_ref(),
                bindings: &mut self.bindings,
                allow_empty_data: true,
            };
            if rule
                .packet_triggers
                .iter()
                .any(|schema| schema.matches(packet.as_slice(), self.base_offset, &mut ctx))
            {
                to_fire.push(index);
            }
        }
        for index in to_fire {
            self.fire(index, TriggerContext::Packet(packet.clone()));
        }
    }

    fn on_state_changed(&mut self, entity_id: &str, state: &StateDelta) {
        let mut to_fire = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            let hit = rule.state_triggers.iter().any(|trigger| {
                trigger.entity_id == entity_id
                    && trigger.matcher.matches(state.get(&trigger.property))
            });
            if hit {
                to_fire.push(index);
            }
        }
        for index in to_fire {
            self.fire(
                index,
                TriggerContext::State { entity_id: entity_id.to_owned(), state: state.clone() },
            );
        }
    }

    fn fire(&mut self, rule: usize, ctx: TriggerContext) {
        match self.rules[rule].mode {
            RuleMode::Parallel => self.spawn(rule, ctx),
            RuleMode::Single => {
                if self.runtimes[rule].active.is_empty() {
                    self.spawn(rule, ctx);
                } else {
                    tracing::debug!(rule = %self.rules[rule].id, "busy in single mode, trigger dropped");
                }
            },
            RuleMode::Restart => {
                for cancel in self.runtimes[rule].active.values() {
                    let _ = cancel.send(true);
                }
                self.spawn(rule, ctx);
            },
            RuleMode::Queued => {
                if self.runtimes[rule].active.is_empty() {
                    self.spawn(rule, ctx);
                } else {
                    let runtime = &mut self.runtimes[rule];
                    if runtime.queue.len() >= QUEUE_BOUND {
                        runtime.queue.pop_front();
                        tracing::warn!(
                            rule = %self.rules[rule].id,
                            bound = QUEUE_BOUND,
                            "trigger queue full, dropping oldest"
                        );
                    }
                    runtime.queue.push_back(ctx);
                }
            },
        }
    }

    fn done(&mut self, rule: usize, invocation: u64) {
        self.runtimes[rule].active.remove(&invocation);
        if self.rules[rule].mode == RuleMode::Queued
            && self.runtimes[rule].active.is_empty()
            && let Some(ctx) = self.runtimes[rule].queue.pop_front()
        {
            self.spawn(rule, ctx);
        }
    }

    fn spawn(&mut self, rule: usize, ctx: TriggerContext) {
        let invocation = self.next_invocation;
        self.next_invocation += 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.runtimes[rule].active.insert(invocation, cancel_tx);

        let task = Invocation {
            rule_id: self.rules[rule].id.clone(),
            rule_index: rule,
            invocation,
            actions: Arc::clone(&self.rules[rule].actions),
            handles: self.handles.clone(),
            ctx,
            cancel: cancel_rx,
            done: self.inbox_tx.clone(),
            bindings: Bindings::new(),
        };
        tokio::spawn(task.run());
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Invocation {
    rule_id: String,
    rule_index: usize,
    invocation: u64,
    actions: Arc<[Action]>,
    handles: EngineHandles,
    ctx: TriggerContext,
    cancel: watch::Receiver<bool>,
    done: mpsc::UnboundedSender<EngineMsg>,
    bindings: Bindings,
}

impl Invocation {
    async fn run(mut self) {
        let actions = Arc::clone(&self.actions);
        let _ = execute(&actions, &mut self).await;
        let _ = self
            .done
            .send(EngineMsg::Done { rule: self.rule_index, invocation: self.invocation });
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Cancellable sleep; returns whether the invocation was cancelled.
    ///
    /// The token is checked before and after sleeping, so a cancellation
    /// landing mid-delay skips every remaining action.
    async fn sleep(&mut self, duration: Duration) -> bool {
        if self.cancelled() {
            return true;
        }
        let mut cancel = self.cancel.clone();
        tokio::select! {
            () = tokio::time::sleep(duration) => {},
            _ = cancel.changed() => {},
        }
        self.cancelled()
    }

    fn condition(&mut self, script: &str) -> bool {
        self.prepare_bindings();
        match self.handles.scripts.evaluate(script, &self.bindings, EvalMode::Guarded) {
            Ok(value) => value.is_truthy(),
            Err(err) => {
                tracing::warn!(rule = %self.rule_id, error = %err, "condition failed, treating as false");
                false
            },
        }
    }

    fn prepare_bindings(&mut self) {
        self.bindings.clear();
        let states: BTreeMap<String, ScriptValue> = self
            .handles
            .states
            .all()
            .into_iter()
            .map(|(id, state)| (id, delta_to_script(&state)))
            .collect();
        self.bindings.set("states", ScriptValue::Map(states));
        match &self.ctx {
            TriggerContext::Packet(packet) => {
                self.bindings.set("data", ScriptValue::from(packet.as_slice()));
            },
            TriggerContext::State { entity_id, state } => {
                let mut trigger = BTreeMap::new();
                trigger.insert("entity_id".to_owned(), ScriptValue::Str(entity_id.clone()));
                trigger.insert("state".to_owned(), delta_to_script(state));
                self.bindings.set("trigger", ScriptValue::Map(trigger));
            },
            TriggerContext::Startup | TriggerContext::Time => {},
        }
    }

    fn publish(&self, action: &PublishAction) {
        let _ = self.handles.effects.send(EngineEffect::Publish {
            topic: action.topic.clone(),
            payload: action.payload.clone(),
            retain: action.retain,
        });
    }

    fn send_packet(&mut self, action: &SendPacketAction) {
        let payloads: Vec<Vec<u8>> = if let Some(data) = &action.data {
            vec![data.clone()]
        } else if let Some(expr) = &action.expr {
            self.prepare_bindings();
            match self.handles.scripts.evaluate(expr, &self.bindings, EvalMode::Guarded) {
                Ok(value) => match value.into_payloads() {
                    Some(payloads) if !payloads.is_empty() => payloads,
                    _ => {
                        tracing::warn!(rule = %self.rule_id, "send_packet expression did not yield bytes");
                        return;
                    },
                },
                Err(err) => {
                    tracing::warn!(rule = %self.rule_id, error = %err, "send_packet expression failed");
                    return;
                },
            }
        } else {
            return;
        };

        let header = action.header.as_deref().unwrap_or(&[]);
        let mut frames = payloads.into_iter().map(|payload| {
            let mut frame = Vec::with_capacity(header.len() + payload.len() + 2);
            frame.extend_from_slice(header);
            frame.extend_from_slice(&payload);
            if let Some(checksum) = action.checksum
                && let Some(byte) = checksum.compute(&frame, header.len())
            {
                frame.push(byte);
            }
            if let Some(footer) = &action.footer {
                frame.extend_from_slice(footer);
            }
            frame
        });
        // Validation guarantees at least one payload here.
        let Some(bytes) = frames.next() else { return };
        let _ = self
            .handles
            .effects
            .send(EngineEffect::SendFrame { bytes, alternatives: frames.collect() });
    }

    fn command(&mut self, target: &str) {
        let target = match CommandTarget::parse(target) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(rule = %self.rule_id, error = %err, "bad command target");
                return;
            },
        };
        let arg = match &target.arg {
            None => None,
            Some(TargetArg::Literal(value)) => Some(value.clone()),
            Some(TargetArg::Expr(expr)) => {
                self.prepare_bindings();
                match self.handles.scripts.evaluate(expr, &self.bindings, EvalMode::Guarded) {
                    Ok(value) => match value.into_value() {
                        Some(value) => Some(value),
                        None => {
                            tracing::warn!(rule = %self.rule_id, "command argument is not a scalar");
                            return;
                        },
                    },
                    Err(err) => {
                        tracing::warn!(rule = %self.rule_id, error = %err, "command argument failed");
                        return;
                    },
                }
            },
        };
        let _ = self.handles.effects.send(EngineEffect::Command {
            entity_id: target.entity_id,
            command: target.command,
            arg,
        });
    }
}

fn delta_to_script(state: &StateDelta) -> ScriptValue {
    ScriptValue::Map(
        state
            .iter()
            .map(|(key, value)| (key.clone(), ScriptValue::from(value.clone())))
            .collect(),
    )
}

/// Run an action sequence; boxed for recursion through `if`/`choose`/`repeat`.
fn execute<'a>(
    actions: &'a [Action],
    task: &'a mut Invocation,
) -> Pin<Box<dyn Future<Output = Flow> + Send + 'a>> {
    Box::pin(async move {
        for action in actions {
            if task.cancelled() {
                return Flow::Stop;
            }
            match action {
                Action::Publish(publish) => task.publish(publish),
                Action::SendPacket(send) => task.send_packet(send),
                Action::Command(target) => task.command(target),
                Action::Delay(delay) => {
                    if task.sleep(delay.0).await {
                        return Flow::Stop;
                    }
                },
                Action::Log(message) => tracing::info!(rule = %task.rule_id, "{message}"),
                Action::If(branch) => {
                    let chosen = if task.condition(&branch.condition) {
                        Some(&branch.then)
                    } else {
                        branch.otherwise.as_ref()
                    };
                    if let Some(chosen) = chosen {
                        if let Flow::Stop = execute(chosen, task).await {
                            return Flow::Stop;
                        }
                    }
                },
                Action::Choose(choose) => {
                    let mut chosen = None;
                    for choice in &choose.choices {
                        if task.condition(&choice.condition) {
                            chosen = Some(&choice.then);
                            break;
                        }
                    }
                    let chosen = chosen.or(choose.default.as_ref());
                    if let Some(chosen) = chosen {
                        if let Flow::Stop = execute(chosen, task).await {
                            return Flow::Stop;
                        }
                    }
                },
                Action::Stop(reason) => {
                    tracing::debug!(
                        rule = %task.rule_id,
                        reason = reason.as_deref().unwrap_or("-"),
                        "invocation stopped"
                    );
                    return Flow::Stop;
                },
                Action::Repeat(repeat) => {
                    let mut remaining = repeat.times;
                    loop {
                        if task.cancelled() {
                            return Flow::Stop;
                        }
                        if remaining == Some(0) {
                            break;
                        }
                        if let Some(condition) = &repeat.while_condition
                            && !task.condition(condition)
                        {
                            break;
                        }
                        if let Flow::Stop = execute(&repeat.then, task).await {
                            return Flow::Stop;
                        }
                        if let Some(n) = &mut remaining {
                            *n -= 1;
                        }
                    }
                },
            }
        }
        Flow::Continue
    })
}
