//! Automation: per-rule state machines over packets, state changes, and time.
//!
//! A rule is `{id, enabled, mode, trigger[], then[]}`. The engine routes
//! triggers to rules, runs each invocation's action sequence as a cooperative
//! task, and enforces the rule's concurrency mode:
//!
//! - `parallel` (default): invocations run independently;
//! - `single`: triggers arriving while one runs are dropped;
//! - `restart`: a new trigger cancels the in-flight invocation;
//! - `queued`: triggers queue (bounded, drop-oldest) and run serially.
//!
//! The engine is message-driven: packets and state changes go in through
//! [`AutomationEngine::on_packet`] / [`AutomationEngine::on_state_changed`],
//! effects (publishes, frames, commands) come out over an effect channel. No
//! component holds a back-reference into the engine.

mod action;
mod engine;
mod target;
mod trigger;

use serde::{Deserialize, Serialize};

pub use action::{
    Action, ChooseAction, Choice, IfAction, PublishAction, RepeatAction, SendPacketAction,
};
pub use engine::{AutomationEngine, EngineEffect, EngineHandles};
pub use target::{CommandTarget, TargetArg};
pub use trigger::{Compare, CompiledMatch, MatchCondition, Trigger};

/// Concurrency mode governing invocations of one rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    /// Invocations run independently and concurrently.
    #[default]
    Parallel,
    /// New triggers are dropped while an invocation is in flight.
    Single,
    /// A new trigger cancels the in-flight invocation and starts fresh.
    Restart,
    /// Triggers enqueue; invocations run serially in arrival order.
    Queued,
}

/// One automation rule as declared in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    /// Stable id; defaults to `automation_<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Disabled rules are compiled (so errors still surface) but never fire.
    #[serde(default = "enabled_default")]
    pub enabled: bool,

    /// Concurrency mode.
    #[serde(default)]
    pub mode: RuleMode,

    /// Trigger list; any trigger fires the rule.
    pub trigger: Vec<Trigger>,

    /// Action sequence.
    pub then: Vec<Action>,
}

fn enabled_default() -> bool {
    true
}
