//! Entity layer and automation engine for homenet buses.
//!
//! This crate sits between the framing layer (`homenet-proto`) and the bridge
//! runtime. It owns:
//!
//! - [`schema`]: declarative match/extract/construct over packet bytes.
//! - [`script`]: the sandboxed expression-evaluator seam (guards, lambdas,
//!   automation conditions are evaluated through it, never in-process).
//! - [`Entity`] and the typed device layer ([`device`]): deciding whether a
//!   packet refers to an entity and decoding a typed state delta.
//! - [`StateStore`]: current state per entity with retain-deduplication.
//! - [`CommandAssembler`]: logical command → framed outbound bytes, with a
//!   pending-ack window and bounded retries.
//! - [`automation`]: the per-rule state machine running the action DSL.
//!
//! Everything here is Sans-IO: components return effects; the bridge runtime
//! performs transport and broker I/O.

pub mod automation;
mod command;
pub mod device;
mod duration;
mod entity;
mod error;
pub mod schema;
pub mod script;
mod store;
mod value;

pub use command::{CommandAssembler, CommandOutcome, CommandRetry, PendingCommands, TxFrame};
pub use duration::{DurationValue, parse_duration};
pub use entity::{Entity, EntityKind, EntityRegistry};
pub use error::CoreError;
pub use store::{StateStore, StateView, StoreEffect};
pub use value::{StateDelta, Value};
