//! Outbound schema: synthesise a command payload from a template.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Decode, Endian, SchemaError};
use crate::{
    Value,
    script::{Bindings, EvalMode, ScriptEngine, ScriptValue},
};

/// Template for one outbound command payload.
///
/// The template bytes in `data` are copied verbatim; when `value_offset` is
/// set, the dynamic value is encoded per `decode`/`endian`/`length` and
/// overwritten into that slot. `mapping` translates symbolic values
/// (`"heat"`) into bytes for enumerated commands. A `lambda` command skips
/// the template entirely: the evaluator computes the payload, or an ordered
/// list of alternative payloads tried across retries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSchema {
    /// Template payload bytes.
    #[serde(with = "homenet_proto::hexfmt", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,

    /// Slot where the dynamic value is injected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_offset: Option<usize>,

    /// Slot width in bytes; defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,

    /// Value encoding discipline for the slot.
    #[serde(skip_serializing_if = "super::is_default")]
    pub decode: Decode,

    /// Multi-byte encoding order.
    #[serde(skip_serializing_if = "super::is_default")]
    pub endian: Endian,

    /// Multiply the value by 10^precision before encoding.
    #[serde(skip_serializing_if = "super::is_default")]
    pub precision: u32,

    /// Symbolic value → byte for enumerated commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<BTreeMap<String, u8>>,

    /// Expression computing the whole payload (or payload alternatives).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lambda: Option<String>,
}

impl CommandSchema {
    /// Synthesise the payload(s) for this command.
    ///
    /// Returns the primary payload first; any further entries are
    /// alternatives to try on retry.
    ///
    /// # Errors
    ///
    /// Lambda failures, mapping misses, and values that do not fit the
    /// declared slot; the caller logs and drops the command.
    pub fn construct(
        &self,
        value: Option<&Value>,
        engine: &dyn ScriptEngine,
        bindings: &mut Bindings,
    ) -> Result<Vec<Vec<u8>>, SchemaError> {
        if let Some(lambda) = &self.lambda {
            bindings.set(
                "x",
                value.cloned().map_or(ScriptValue::Null, ScriptValue::from),
            );
            bindings.set("data", ScriptValue::Bytes(self.data.clone()));
            let result = engine.evaluate(lambda, bindings, EvalMode::Guarded)?;
            return result.into_payloads().ok_or(SchemaError::LambdaPayload);
        }

        let mut payload = self.data.clone();
        if let (Some(offset), Some(value)) = (self.value_offset, value) {
            let length = self.length.unwrap_or(1).max(1);
            let end = offset.checked_add(length).filter(|&end| end <= payload.len()).ok_or(
                SchemaError::ValueOffset { offset, length, template: payload.len() },
            )?;
            if let Some(mapping) = &self.mapping {
                let key = value.to_string();
                let byte = *mapping
                    .get(&key)
                    .ok_or(SchemaError::MappingMiss { value: key })?;
                payload[offset] = byte;
            } else {
                self.encode_into(value, &mut payload[offset..end])?;
            }
        }
        Ok(vec![payload])
    }

    /// Encode a numeric or textual value into the slot.
    fn encode_into(&self, value: &Value, slot: &mut [u8]) -> Result<(), SchemaError> {
        let length = slot.len();

        if self.decode == Decode::Ascii {
            let text = value
                .as_str()
                .ok_or_else(|| SchemaError::Unencodable { value: value.to_string() })?;
            if text.len() > length || !text.is_ascii() {
                return Err(SchemaError::ValueRange {
                    value: value.to_string(),
                    length,
                    encoding: "ascii",
                });
            }
            slot.fill(0);
            slot[..text.len()].copy_from_slice(text.as_bytes());
            return Ok(());
        }

        let number = value
            .as_f64()
            .ok_or_else(|| SchemaError::Unencodable { value: value.to_string() })?;
        let scaled = (number * 10f64.powi(self.precision as i32)).round();
        let out_of_range = || SchemaError::ValueRange {
            value: value.to_string(),
            length,
            encoding: encoding_name(self.decode),
        };

        match self.decode {
            Decode::RawUint | Decode::Signed => {
                let signed = self.decode == Decode::Signed;
                let bits = (length.min(8) * 8) as u32;
                let raw: u64 = if signed {
                    let n = scaled as i64;
                    if bits < 64 {
                        let min = -(1i64 << (bits - 1));
                        let max = (1i64 << (bits - 1)) - 1;
                        if scaled < min as f64 || scaled > max as f64 {
                            return Err(out_of_range());
                        }
                    }
                    (n as u64) & (u64::MAX >> (64 - bits.min(64)))
                } else {
                    if scaled < 0.0 || (bits < 64 && scaled >= (1u64 << bits) as f64) {
                        return Err(out_of_range());
                    }
                    scaled as u64
                };
                write_endian(raw, slot, self.endian);
            },
            Decode::Bcd => {
                if scaled < 0.0 {
                    return Err(out_of_range());
                }
                let mut n = scaled as u64;
                let mut bytes = vec![0u8; length];
                for byte in bytes.iter_mut().rev() {
                    *byte = ((n / 10 % 10) << 4) as u8 | (n % 10) as u8;
                    n /= 100;
                }
                if n > 0 {
                    return Err(out_of_range());
                }
                match self.endian {
                    Endian::Big => slot.copy_from_slice(&bytes),
                    Endian::Little => {
                        bytes.reverse();
                        slot.copy_from_slice(&bytes);
                    },
                }
            },
            Decode::SignedByteHalfDegree => {
                let magnitude = scaled.abs();
                let whole = magnitude.floor();
                let half = magnitude - whole;
                if whole > 63.0 || (half != 0.0 && half != 0.5) {
                    return Err(out_of_range());
                }
                let mut byte = whole as u8;
                if half == 0.5 {
                    byte |= 0x80;
                }
                if scaled < 0.0 {
                    byte |= 0x40;
                }
                slot[0] = byte;
            },
            Decode::Ascii => {},
        }
        Ok(())
    }
}

fn encoding_name(decode: Decode) -> &'static str {
    match decode {
        Decode::RawUint => "raw",
        Decode::Signed => "signed",
        Decode::Bcd => "bcd",
        Decode::Ascii => "ascii",
        Decode::SignedByteHalfDegree => "half-degree",
    }
}

fn write_endian(mut raw: u64, slot: &mut [u8], endian: Endian) {
    match endian {
        Endian::Big => {
            for byte in slot.iter_mut().rev() {
                *byte = (raw & 0xFF) as u8;
                raw >>= 8;
            }
        },
        Endian::Little => {
            for byte in slot.iter_mut() {
                *byte = (raw & 0xFF) as u8;
                raw >>= 8;
            }
        },
    }
}
