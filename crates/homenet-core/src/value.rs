//! Typed state values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single decoded state value.
///
/// Untagged on the wire: state records publish as plain JSON scalars
/// (`{"state": "ON", "speed": 50}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag (oscillating, presence, ...).
    Bool(bool),
    /// Integer reading.
    Int(i64),
    /// Fractional reading (scaled sensors, half-degree temperatures).
    Float(f64),
    /// Categorical or textual state.
    Str(String),
}

/// An entity state record or a delta against one: property name → value.
///
/// Ordered so serialized records are deterministic, which the store's
/// publish fingerprint relies on.
pub type StateDelta = BTreeMap<String, Value>;

impl Value {
    /// Build a numeric value, collapsing integral floats to `Int` so that
    /// `precision: 0` decodes and whole scaled readings publish as integers.
    pub fn from_scaled(number: f64) -> Self {
        if number.fract() == 0.0 && number.abs() < 9.0e15 {
            Self::Int(number as i64)
        } else {
            Self::Float(number)
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// String view of the value, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_floats_collapse() {
        assert_eq!(Value::from_scaled(22.0), Value::Int(22));
        assert_eq!(Value::from_scaled(21.5), Value::Float(21.5));
        assert_eq!(Value::from_scaled(-3.0), Value::Int(-3));
    }

    #[test]
    fn serializes_untagged() {
        let mut delta = StateDelta::new();
        delta.insert("state".into(), Value::from("ON"));
        delta.insert("speed".into(), Value::Int(50));
        delta.insert("oscillating".into(), Value::Bool(true));
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(json, r#"{"oscillating":true,"speed":50,"state":"ON"}"#);
    }
}
