//! Duration strings: `"10ms"`, `"1s"`, `"5m"`, `"1h"`, unitless milliseconds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// Parse a configuration duration.
///
/// Accepted forms: `<n>ms`, `<n>s`, `<n>m`, `<n>h` (fractional `<n>` allowed)
/// and a bare number, which is read as milliseconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let (number, unit) = match input.find(|c: char| c.is_ascii_alphabetic()) {
        Some(at) => input.split_at(at),
        None => (input, "ms"),
    };
    let number: f64 = number.trim().parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let millis = match unit {
        "ms" => number,
        "s" => number * 1_000.0,
        "m" => number * 60_000.0,
        "h" => number * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis.round() as u64))
}

/// A duration as written in configuration.
///
/// Deserializes from a duration string or a bare millisecond number;
/// serializes back to the most compact exact unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl From<DurationValue> for Duration {
    fn from(value: DurationValue) -> Self {
        value.0
    }
}

impl fmt::Display for DurationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms > 0 && ms % 3_600_000 == 0 {
            write!(f, "{}h", ms / 3_600_000)
        } else if ms > 0 && ms % 60_000 == 0 {
            write!(f, "{}m", ms / 60_000)
        } else if ms > 0 && ms % 1_000 == 0 {
            write!(f, "{}s", ms / 1_000)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

impl Serialize for DurationValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;

        impl de::Visitor<'_> for V {
            type Value = DurationValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string (\"20s\") or milliseconds")
            }

            fn visit_u64<E: de::Error>(self, ms: u64) -> Result<Self::Value, E> {
                Ok(DurationValue(Duration::from_millis(ms)))
            }

            fn visit_i64<E: de::Error>(self, ms: i64) -> Result<Self::Value, E> {
                u64::try_from(ms)
                    .map(|ms| DurationValue(Duration::from_millis(ms)))
                    .map_err(|_| E::custom("negative duration"))
            }

            fn visit_f64<E: de::Error>(self, ms: f64) -> Result<Self::Value, E> {
                if ms.is_finite() && ms >= 0.0 {
                    Ok(DurationValue(Duration::from_millis(ms.round() as u64)))
                } else {
                    Err(E::custom("invalid duration"))
                }
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Self::Value, E> {
                parse_duration(s)
                    .map(DurationValue)
                    .ok_or_else(|| E::custom(format!("invalid duration: {s:?}")))
            }
        }

        deserializer.deserialize_any(V)
    }
}
