//! Expression-evaluator seam.
//!
//! Guards, command lambdas, and automation conditions are user scripts. They
//! are never interpreted in-process: the bridge consumes an embedded
//! evaluator as a black-box capability behind [`ScriptEngine`], the way the
//! transport and broker are consumed behind traits. The contract the
//! evaluator must honour:
//!
//! - only the helpers the bridge declares and the bindings the caller passes
//!   are visible to the script (no ambient globals);
//! - [`EvalMode::Guarded`] enforces a wall-clock cap per evaluation
//!   ([`GUARDED_TIMEOUT`]); [`EvalMode::Trusted`] is untimed and reserved for
//!   operator-declared schemas (checksum helpers and the like);
//! - evaluation never observes or mutates bridge state except through the
//!   returned [`ScriptValue`].
//!
//! Failures and timeouts are soft: callers log at `warn` and treat the
//! result as null/false.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::Value;

/// Wall-clock cap per guarded evaluation.
pub const GUARDED_TIMEOUT: Duration = Duration::from_millis(100);

/// How much the evaluator is trusted for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Operator-declared schema scripts; untimed.
    Trusted,
    /// User lambdas and automation conditions; capped at [`GUARDED_TIMEOUT`].
    Guarded,
}

/// A value crossing the evaluator boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Absent result.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
    /// Raw bytes (packet payloads).
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<ScriptValue>),
    /// Keyed map (entity states).
    Map(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Script truthiness: null, false, 0, empty string/list are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Float(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Map(_) => true,
        }
    }

    /// Interpret the result as one or more byte payloads.
    ///
    /// A byte sequence yields a single payload; a list of byte sequences
    /// yields ordered alternatives (a list of integers is read as one
    /// payload). Anything else is `None`.
    pub fn into_payloads(self) -> Option<Vec<Vec<u8>>> {
        fn bytes(value: &ScriptValue) -> Option<Vec<u8>> {
            match value {
                ScriptValue::Bytes(b) => Some(b.clone()),
                ScriptValue::List(items) => items
                    .iter()
                    .map(|item| match item {
                        ScriptValue::Int(n) => u8::try_from(*n).ok(),
                        _ => None,
                    })
                    .collect(),
                _ => None,
            }
        }

        match &self {
            ScriptValue::Bytes(_) => bytes(&self).map(|b| vec![b]),
            ScriptValue::List(items) => {
                if let Some(single) = bytes(&self) {
                    return Some(vec![single]);
                }
                items.iter().map(bytes).collect()
            },
            _ => None,
        }
    }
}

impl ScriptValue {
    /// Collapse the result into a scalar state [`Value`], if it is one.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Bool(b) => Some(Value::Bool(b)),
            Self::Int(n) => Some(Value::Int(n)),
            Self::Float(n) => Some(Value::Float(n)),
            Self::Str(s) => Some(Value::Str(s)),
            Self::Null | Self::Bytes(_) | Self::List(_) | Self::Map(_) => None,
        }
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => Self::Bool(b),
            Value::Int(n) => Self::Int(n),
            Value::Float(n) => Self::Float(n),
            Value::Str(s) => Self::Str(s),
        }
    }
}

impl From<&[u8]> for ScriptValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// Evaluation failure surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The script raised or failed to parse.
    #[error("script evaluation failed: {message}")]
    Evaluation {
        /// Engine-provided description.
        message: String,
    },

    /// A guarded evaluation exceeded its wall-clock cap.
    #[error("script evaluation timed out after {elapsed:?}")]
    Timeout {
        /// How long the evaluation ran.
        elapsed: Duration,
    },

    /// No evaluator capability was wired into this bus.
    #[error("no script engine configured")]
    Unavailable,
}

/// Reusable bindings table passed to every evaluation.
///
/// Hot paths (packet-trigger guards) clear and refill one instance instead of
/// allocating per invocation; `clear` keeps the backing storage.
#[derive(Debug, Default)]
pub struct Bindings {
    entries: Vec<(String, ScriptValue)>,
}

impl Bindings {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous binding of the same name.
    pub fn set(&mut self, name: &str, value: ScriptValue) -> &mut Self {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name.to_owned(), value));
        }
        self
    }

    /// Look up a binding.
    pub fn get(&self, name: &str) -> Option<&ScriptValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Drop all bindings, keeping capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScriptValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// The evaluator capability.
///
/// Implementations wrap an embedded expression language with a restricted
/// global surface and timeout support. The bridge never assumes anything
/// about the language beyond this call shape.
pub trait ScriptEngine: Send + Sync {
    /// Evaluate `script` with the given bindings.
    fn evaluate(
        &self,
        script: &str,
        bindings: &Bindings,
        mode: EvalMode,
    ) -> Result<ScriptValue, ScriptError>;
}

/// Engine used when no evaluator is wired in: every evaluation fails softly.
///
/// Buses whose catalogs carry no scripts run fine with this; a guard or
/// lambda reaching it logs and evaluates as null.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEngine;

impl ScriptEngine for NullEngine {
    fn evaluate(
        &self,
        _script: &str,
        _bindings: &Bindings,
        _mode: EvalMode,
    ) -> Result<ScriptValue, ScriptError> {
        Err(ScriptError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!ScriptValue::Null.is_truthy());
        assert!(!ScriptValue::Int(0).is_truthy());
        assert!(!ScriptValue::Str(String::new()).is_truthy());
        assert!(ScriptValue::Int(-1).is_truthy());
        assert!(ScriptValue::Bytes(vec![0]).is_truthy());
    }

    #[test]
    fn payload_shapes() {
        let single = ScriptValue::List(vec![ScriptValue::Int(0xB0), ScriptValue::Int(0x5A)]);
        assert_eq!(single.into_payloads(), Some(vec![vec![0xB0, 0x5A]]));

        let alternatives = ScriptValue::List(vec![
            ScriptValue::Bytes(vec![0x01]),
            ScriptValue::Bytes(vec![0x02]),
        ]);
        assert_eq!(alternatives.into_payloads(), Some(vec![vec![0x01], vec![0x02]]));

        assert_eq!(ScriptValue::Str("nope".into()).into_payloads(), None);
        // Bytes out of range are not payloads.
        let bad = ScriptValue::List(vec![ScriptValue::Int(300)]);
        assert_eq!(bad.into_payloads(), None);
    }

    #[test]
    fn bindings_replace_and_reuse() {
        let mut bindings = Bindings::new();
        bindings.set("x", ScriptValue::Int(1)).set("x", ScriptValue::Int(2));
        assert_eq!(bindings.get("x"), Some(&ScriptValue::Int(2)));
        bindings.clear();
        assert_eq!(bindings.get("x"), None);
    }
}
