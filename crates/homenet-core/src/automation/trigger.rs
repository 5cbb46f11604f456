//! Rule triggers and state-match conditions.

use serde::{Deserialize, Serialize};

use crate::{DurationValue, Value, schema::StateSchema};

/// What fires a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Once at bus start, after an optional delay.
    Startup {
        /// Delay before firing.
        #[serde(default)]
        delay: Option<DurationValue>,
    },
    /// Every packet matching the schema.
    Packet {
        /// Selector evaluated against each extracted packet.
        #[serde(rename = "match")]
        matches: StateSchema,
    },
    /// Every state-changed event of one entity.
    State {
        /// Entity to watch.
        entity_id: String,
        /// Property to match; defaults to `state`.
        #[serde(default)]
        property: Option<String>,
        /// Condition on the property value.
        #[serde(rename = "match")]
        matches: MatchCondition,
    },
    /// Periodic or cron-scheduled.
    Time {
        /// Fixed period.
        #[serde(default)]
        interval: Option<DurationValue>,
        /// Cron expression (seconds-resolution, local time).
        #[serde(default)]
        cron: Option<String>,
    },
}

/// Condition on a state property.
///
/// Three YAML spellings: a literal (`match: "on"`), a regex (`match:
/// "/^2[0-9]$/"`), or a comparison object (`match: {gte: 20, lt: 25}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchCondition {
    /// Comparison object.
    Compare(Compare),
    /// Literal equality, or a regex when written `/.../`.
    Literal(Value),
}

/// Comparison bounds; all present bounds must hold.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Compare {
    /// Equals.
    pub eq: Option<Value>,
    /// Strictly greater than.
    pub gt: Option<f64>,
    /// Greater than or equal.
    pub gte: Option<f64>,
    /// Strictly less than.
    pub lt: Option<f64>,
    /// Less than or equal.
    pub lte: Option<f64>,
}

/// A match condition with its regex compiled once at rule-compile time.
#[derive(Debug, Clone)]
pub enum CompiledMatch {
    /// Literal equality.
    Equal(Value),
    /// Regex over the value's string form.
    Regex(regex::Regex),
    /// Comparison bounds.
    Compare(Compare),
}

impl MatchCondition {
    /// Compile the condition, resolving `/.../` literals into regexes.
    pub fn compile(&self) -> Result<CompiledMatch, regex::Error> {
        match self {
            Self::Compare(compare) => Ok(CompiledMatch::Compare(compare.clone())),
            Self::Literal(Value::Str(text)) => {
                if let Some(pattern) =
                    text.strip_prefix('/').and_then(|rest| rest.strip_suffix('/'))
                {
                    Ok(CompiledMatch::Regex(regex::Regex::new(pattern)?))
                } else {
                    Ok(CompiledMatch::Equal(Value::Str(text.clone())))
                }
            },
            Self::Literal(value) => Ok(CompiledMatch::Equal(value.clone())),
        }
    }
}

impl CompiledMatch {
    /// Whether the property value satisfies the condition.
    ///
    /// A missing property never matches.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Self::Equal(expected) => values_equal(expected, value),
            Self::Regex(pattern) => pattern.is_match(&value.to_string()),
            Self::Compare(compare) => {
                if let Some(expected) = &compare.eq
                    && !values_equal(expected, value)
                {
                    return false;
                }
                let bounds: [(Option<f64>, fn(f64, f64) -> bool); 4] = [
                    (compare.gt, |v, b| v > b),
                    (compare.gte, |v, b| v >= b),
                    (compare.lt, |v, b| v < b),
                    (compare.lte, |v, b| v <= b),
                ];
                for (bound, holds) in bounds {
                    if let Some(bound) = bound {
                        let Some(number) = value.as_f64() else {
                            return false;
                        };
                        if !holds(number, bound) {
                            return false;
                        }
                    }
                }
                true
            },
        }
    }
}

/// Equality that treats `Int(50)` and `Float(50.0)` as the same reading.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}
