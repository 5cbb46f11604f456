//! Inbound schema: match a packet slice, extract a typed value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Decode, Endian, Mask, MatchContext};
use crate::{
    Value,
    script::{EvalMode, ScriptValue},
};

/// Declarative match/extract over a packet slice.
///
/// Matching compares `data` (masked) at `offset`; extraction decodes
/// `offset..offset+length` per `decode`/`endian`. A schema used purely as a
/// selector sets `data`; a schema used purely for extraction sets
/// `offset`/`length`/`decode`. Both calls take a `base_offset` so entity
/// schemas are written relative to the end of the bus header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSchema {
    /// Offset into the packet, relative to the caller's base offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,

    /// Field length in bytes; defaults to `data` length, else 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,

    /// Expected literal bytes at `offset`.
    #[serde(with = "homenet_proto::hexfmt::opt", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,

    /// Mask ANDed over both expected and actual bytes before comparison, and
    /// over the field bytes before decoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Mask>,

    /// Invert the data-comparison result (and ones-complement numeric fields
    /// before decoding).
    #[serde(skip_serializing_if = "super::is_default")]
    pub inverted: bool,

    /// Expression script; the match is dropped unless it evaluates truthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    /// Veto schemas: if any matches, the overall match fails.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<StateSchema>,

    /// Field decoding discipline.
    #[serde(skip_serializing_if = "super::is_default")]
    pub decode: Decode,

    /// Multi-byte combining order.
    #[serde(skip_serializing_if = "super::is_default")]
    pub endian: Endian,

    /// Treat `raw_uint` fields as two's-complement.
    #[serde(skip_serializing_if = "super::is_default")]
    pub signed: bool,

    /// Divide the numeric result by 10^precision.
    #[serde(skip_serializing_if = "super::is_default")]
    pub precision: u32,

    /// Numeric result → label table; misses fall back to the number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<BTreeMap<i64, String>>,
}

impl StateSchema {
    /// Whether this packet slice matches the schema.
    ///
    /// Evaluation order: masked `data` comparison, `inverted`, `guard`,
    /// `except` vetoes. A bounds failure drops the match outright (inversion
    /// does not resurrect an unreadable packet).
    pub fn matches(&self, packet: &[u8], base_offset: usize, ctx: &mut MatchContext<'_>) -> bool {
        let offset = self.offset.unwrap_or(0) + base_offset;

        let mut matched = match &self.data {
            Some(data) => {
                let Some(window) =
                    offset.checked_add(data.len()).and_then(|end| packet.get(offset..end))
                else {
                    return false;
                };
                data.iter().zip(window).enumerate().all(|(i, (expected, actual))| {
                    let mask = self.mask_at(i);
                    expected & mask == actual & mask
                })
            },
            None => {
                if !ctx.allow_empty_data {
                    return false;
                }
                true
            },
        };

        if self.inverted {
            matched = !matched;
        }
        if !matched {
            return false;
        }

        if let Some(guard) = &self.guard {
            ctx.bindings.set("data", ScriptValue::from(packet));
            match ctx.engine.evaluate(guard, ctx.bindings, EvalMode::Trusted) {
                Ok(result) if result.is_truthy() => {},
                Ok(_) => return false,
                Err(err) => {
                    tracing::warn!(error = %err, "guard evaluation failed, dropping match");
                    return false;
                },
            }
        }

        for except in &self.except {
            if except.matches(packet, base_offset, ctx) {
                return false;
            }
        }
        true
    }

    /// Decode the field value from the packet.
    ///
    /// Returns `None` on out-of-range fields; never panics. Mapping misses
    /// fall back to the numeric result.
    pub fn extract(&self, packet: &[u8], base_offset: usize) -> Option<Value> {
        let offset = self.offset.unwrap_or(0) + base_offset;
        let length = self.length.unwrap_or_else(|| self.data.as_ref().map_or(1, Vec::len));
        let window = offset.checked_add(length).and_then(|end| packet.get(offset..end))?;

        let mut bytes: Vec<u8> =
            window.iter().enumerate().map(|(i, byte)| byte & self.mask_at(i)).collect();
        if self.inverted && self.decode != Decode::Ascii {
            for byte in &mut bytes {
                *byte = !*byte;
            }
        }

        match self.decode {
            Decode::RawUint | Decode::Signed => {
                if length == 0 || length > 8 {
                    return None;
                }
                let mut acc: u64 = 0;
                for &byte in ordered(&bytes, self.endian) {
                    acc = acc << 8 | u64::from(byte);
                }
                let number = if self.decode == Decode::Signed || self.signed {
                    sign_extend(acc, (length * 8) as u32)
                } else {
                    i64::try_from(acc).ok()?
                };
                self.finish(number as f64)
            },
            Decode::Bcd => {
                let mut acc: i64 = 0;
                for &byte in ordered(&bytes, self.endian) {
                    // Lenient BCD: nibbles above 9 decode arithmetically.
                    let pair = i64::from(byte >> 4) * 10 + i64::from(byte & 0x0F);
                    acc = acc.checked_mul(100)?.checked_add(pair)?;
                }
                self.finish(acc as f64)
            },
            Decode::Ascii => {
                let text: String = bytes.iter().map(|&b| b as char).collect();
                Some(Value::Str(text.trim_end_matches('\0').to_owned()))
            },
            Decode::SignedByteHalfDegree => {
                let byte = *bytes.first()?;
                let mut degrees = f64::from(byte & 0x3F);
                if byte & 0x80 != 0 {
                    degrees += 0.5;
                }
                if byte & 0x40 != 0 {
                    degrees = -degrees;
                }
                self.finish(degrees)
            },
        }
    }

    fn mask_at(&self, index: usize) -> u8 {
        self.mask.as_ref().map_or(0xFF, |mask| mask.at(index))
    }

    /// Apply precision scaling, then the mapping table.
    fn finish(&self, number: f64) -> Option<Value> {
        let scaled = number / 10f64.powi(self.precision as i32);
        if let Some(mapping) = &self.mapping
            && scaled.fract() == 0.0
            && let Some(label) = mapping.get(&(scaled as i64))
        {
            return Some(Value::Str(label.clone()));
        }
        Some(Value::from_scaled(scaled))
    }
}

fn ordered(bytes: &[u8], endian: Endian) -> Box<dyn Iterator<Item = &u8> + '_> {
    match endian {
        Endian::Big => Box::new(bytes.iter()),
        Endian::Little => Box::new(bytes.iter().rev()),
    }
}

fn sign_extend(acc: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return acc as i64;
    }
    let shift = 64 - bits;
    ((acc << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Bindings, NullEngine, ScriptEngine, ScriptError};

    fn schema(yaml: &str) -> StateSchema {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn ctx_parts() -> (NullEngine, Bindings) {
        (NullEngine, Bindings::new())
    }

    fn check(schema: &StateSchema, packet: &[u8], base_offset: usize) -> bool {
        let (engine, mut bindings) = ctx_parts();
        let mut ctx =
            MatchContext { engine: &engine, bindings: &mut bindings, allow_empty_data: false };
        schema.matches(packet, base_offset, &mut ctx)
    }

    #[test]
    fn plain_data_match() {
        let schema = schema("{offset: 0, data: [0x40]}");
        assert!(check(&schema, &[0x40, 0x01], 0));
        assert!(!check(&schema, &[0x41, 0x01], 0));
    }

    #[test]
    fn base_offset_shifts_the_window() {
        let schema = schema("{offset: 1, data: [0x01]}");
        // Base offset models the bus header length.
        assert!(check(&schema, &[0xAA, 0x40, 0x01], 1));
        assert!(!check(&schema, &[0xAA, 0x40, 0x01], 0));
    }

    #[test]
    fn masked_match() {
        // 0x82 & 0xF9 == 0x80 & 0xF9, middle byte fully masked out.
        let schema = schema("{data: [0x80, 0x00, 0x04], mask: [0xF9, 0x00, 0xFF]}");
        assert!(check(&schema, &[0x82, 0x80, 0x04], 0));
        assert!(!check(&schema, &[0x82, 0x80, 0x05], 0));
    }

    #[test]
    fn scalar_mask_applies_to_every_index() {
        let schema = schema("{data: [0x10, 0x20], mask: 0xF0}");
        assert!(check(&schema, &[0x1F, 0x2F], 0));
    }

    #[test]
    fn inverted_match() {
        let schema = schema("{data: [0x40], inverted: true}");
        assert!(!check(&schema, &[0x40], 0));
        assert!(check(&schema, &[0x41], 0));
    }

    #[test]
    fn out_of_bounds_never_matches_even_inverted() {
        let schema = schema("{offset: 9, data: [0x40], inverted: true}");
        assert!(!check(&schema, &[0x40], 0));
    }

    #[test]
    fn empty_data_requires_permission() {
        let schema = StateSchema::default();
        assert!(!check(&schema, &[0x40], 0));

        let (engine, mut bindings) = ctx_parts();
        let mut ctx =
            MatchContext { engine: &engine, bindings: &mut bindings, allow_empty_data: true };
        assert!(schema.matches(&[0x40], 0, &mut ctx));
    }

    #[test]
    fn except_vetoes() {
        let schema = schema("{data: [0x40], except: [{offset: 1, data: [0xFF]}]}");
        assert!(check(&schema, &[0x40, 0x00], 0));
        assert!(!check(&schema, &[0x40, 0xFF], 0));
    }

    #[test]
    fn guard_failure_drops_match() {
        // NullEngine errors on every evaluation; a guarded schema must not match.
        let schema = schema("{data: [0x40], guard: \"data[1] > 0\"}");
        assert!(!check(&schema, &[0x40, 0x01], 0));
    }

    #[test]
    fn guard_truthy_accepts() {
        struct YesEngine;
        impl ScriptEngine for YesEngine {
            fn evaluate(
                &self,
                _script: &str,
                bindings: &Bindings,
                _mode: EvalMode,
            ) -> Result<ScriptValue, ScriptError> {
                // The packet must be bound as `data`.
                assert!(matches!(bindings.get("data"), Some(ScriptValue::Bytes(_))));
                Ok(ScriptValue::Bool(true))
            }
        }
        let schema = schema("{data: [0x40], guard: \"true\"}");
        let mut bindings = Bindings::new();
        let mut ctx =
            MatchContext { engine: &YesEngine, bindings: &mut bindings, allow_empty_data: false };
        assert!(schema.matches(&[0x40], 0, &mut ctx));
    }

    #[test]
    fn extract_raw_uint_endian() {
        let big = schema("{offset: 0, length: 2}");
        assert_eq!(big.extract(&[0x01, 0x02], 0), Some(Value::Int(0x0102)));
        let little = schema("{offset: 0, length: 2, endian: little}");
        assert_eq!(little.extract(&[0x01, 0x02], 0), Some(Value::Int(0x0201)));
    }

    #[test]
    fn extract_signed_boundaries() {
        let schema = schema("{offset: 0, decode: signed}");
        assert_eq!(schema.extract(&[0x7F], 0), Some(Value::Int(127)));
        assert_eq!(schema.extract(&[0x80], 0), Some(Value::Int(-128)));
        assert_eq!(schema.extract(&[0xFF], 0), Some(Value::Int(-1)));
    }

    #[test]
    fn extract_bcd() {
        let one = schema("{offset: 0, decode: bcd}");
        assert_eq!(one.extract(&[0x22], 0), Some(Value::Int(22)));
        let two = schema("{offset: 0, length: 2, decode: bcd}");
        assert_eq!(two.extract(&[0x12, 0x34], 0), Some(Value::Int(1234)));
    }

    #[test]
    fn bcd_is_lenient_above_nine() {
        // 0x1F: high nibble 1, low nibble 15 -> 25. Accepted silently.
        let schema = schema("{offset: 0, decode: bcd}");
        assert_eq!(schema.extract(&[0x1F], 0), Some(Value::Int(25)));
    }

    #[test]
    fn extract_ascii_trims_nuls() {
        let schema = schema("{offset: 0, length: 4, decode: ascii}");
        assert_eq!(
            schema.extract(&[0x4F, 0x4E, 0x00, 0x00], 0),
            Some(Value::Str("ON".into()))
        );
    }

    #[test]
    fn extract_half_degree() {
        let schema = schema("{offset: 0, decode: signed_byte_half_degree}");
        assert_eq!(schema.extract(&[0x16], 0), Some(Value::Int(22)));
        assert_eq!(schema.extract(&[0x96], 0), Some(Value::Float(22.5)));
        assert_eq!(schema.extract(&[0x56], 0), Some(Value::Int(-22)));
        assert_eq!(schema.extract(&[0xD6], 0), Some(Value::Float(-22.5)));
    }

    #[test]
    fn extract_precision_scales() {
        let frac = schema("{offset: 0, length: 2, precision: 1}");
        assert_eq!(frac.extract(&[0x00, 0xE7], 0), Some(Value::Float(23.1)));
        // Whole results collapse to integers.
        let whole = schema("{offset: 0, precision: 1}");
        assert_eq!(whole.extract(&[0x0A], 0), Some(Value::Int(1)));
    }

    #[test]
    fn extract_mapping_hit_and_miss() {
        let schema = schema("{offset: 0, mapping: {1: low, 2: high}}");
        assert_eq!(schema.extract(&[0x01], 0), Some(Value::Str("low".into())));
        assert_eq!(schema.extract(&[0x03], 0), Some(Value::Int(3)));
    }

    #[test]
    fn extract_inverted_complements() {
        let schema = schema("{offset: 0, inverted: true}");
        assert_eq!(schema.extract(&[0xFE], 0), Some(Value::Int(1)));
    }

    #[test]
    fn extract_masked_field() {
        let schema = schema("{offset: 0, mask: 0x0F}");
        assert_eq!(schema.extract(&[0xA7], 0), Some(Value::Int(7)));
    }

    #[test]
    fn extract_out_of_range_is_null() {
        let schema = schema("{offset: 4, length: 2}");
        assert_eq!(schema.extract(&[0x01, 0x02], 0), None);
    }

    #[test]
    fn extract_exact_boundary() {
        // offset + length lands exactly on the packet end.
        let schema = schema("{offset: 1, length: 2}");
        assert_eq!(schema.extract(&[0x00, 0x01, 0x02], 0), Some(Value::Int(0x0102)));
    }

    #[test]
    fn default_length_follows_data() {
        let schema = schema("{data: [0x01, 0x02]}");
        assert_eq!(schema.extract(&[0x01, 0x02], 0), Some(Value::Int(0x0102)));
    }
}
