//! Error types for the entity layer.
//!
//! Two families, per the bridge's propagation rules: catalog errors are
//! structural (bad entity or rule declarations) and abort bus startup;
//! command errors are runtime (unknown target, unencodable value) and
//! surface as warnings without stopping the bus.

use thiserror::Error;

use crate::{schema::SchemaError, script::ScriptError};

/// Errors raised by the entity layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Two entities share an id on one bus.
    #[error("duplicate entity id {id:?}")]
    DuplicateEntity {
        /// The conflicting id.
        id: String,
    },

    /// An entity declaration is structurally invalid.
    #[error("invalid entity {id:?}: {reason}")]
    InvalidEntity {
        /// Entity id (or its position when no id was given).
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A command referenced an entity the catalog does not contain.
    #[error("unknown entity {id:?}")]
    UnknownEntity {
        /// The requested id.
        id: String,
    },

    /// The entity exists but does not declare the requested command.
    #[error("entity {entity:?} has no command {command:?}")]
    UnknownCommand {
        /// Entity id.
        entity: String,
        /// Command name as requested.
        command: String,
    },

    /// A `command` action target string did not parse.
    #[error("invalid command target {target:?}: {reason}")]
    InvalidTarget {
        /// The raw target string.
        target: String,
        /// What failed to parse.
        reason: &'static str,
    },

    /// An automation rule is structurally invalid.
    #[error("invalid automation rule {id:?}: {reason}")]
    InvalidRule {
        /// Rule id.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Payload construction failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The expression evaluator failed.
    #[error(transparent)]
    Script(#[from] ScriptError),
}
