//! Declarative match/extract/construct over packet bytes.
//!
//! A [`StateSchema`] decides whether a packet slice refers to an entity and
//! decodes a typed value out of it; a [`CommandSchema`] is the inverse
//! template for outbound payloads. Both are plain data deserialized from the
//! catalog; all byte-level semantics live in this module.

mod command;
mod state;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

use crate::script::{Bindings, ScriptEngine, ScriptError};

pub use command::CommandSchema;
pub use state::StateSchema;

/// Serde helper: skip default-valued fields when dumping configs.
pub(crate) fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

/// Field decoding discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decode {
    /// Unsigned integer combined per [`Endian`].
    #[default]
    RawUint,
    /// Two's-complement integer sign-extended to the field width.
    Signed,
    /// Binary-coded decimal, one pair of digits per byte.
    Bcd,
    /// Latin-1 text, trailing NULs trimmed.
    Ascii,
    /// Single byte: low six bits integer part, `0x40` sign, `0x80` adds 0.5.
    SignedByteHalfDegree,
}

/// Multi-byte combining order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    /// Most significant byte first.
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

/// A byte mask: one scalar applied to every index, or one byte per index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mask {
    /// Same mask byte at every index.
    Byte(u8),
    /// Per-index masks; indexes past the end are unmasked.
    PerIndex(Vec<u8>),
}

impl Mask {
    /// Effective mask at `index`.
    pub fn at(&self, index: usize) -> u8 {
        match self {
            Self::Byte(byte) => *byte,
            Self::PerIndex(bytes) => bytes.get(index).copied().unwrap_or(0xFF),
        }
    }
}

impl Serialize for Mask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Byte(byte) => serializer.serialize_str(&format!("0x{byte:02X}")),
            Self::PerIndex(bytes) => homenet_proto::hexfmt::serialize(bytes, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Mask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;

        impl<'de> de::Visitor<'de> for V {
            type Value = Mask;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mask byte or a sequence of mask bytes")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                u8::try_from(value)
                    .map(Mask::Byte)
                    .map_err(|_| E::custom(format!("mask byte out of range: {value}")))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u8::try_from(value)
                    .map(Mask::Byte)
                    .map_err(|_| E::custom(format!("mask byte out of range: {value}")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                homenet_proto::hexfmt::parse_byte(value)
                    .map(Mask::Byte)
                    .ok_or_else(|| E::custom(format!("invalid mask byte: {value:?}")))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, seq: A) -> Result<Self::Value, A::Error> {
                homenet_proto::hexfmt::deserialize(de::value::SeqAccessDeserializer::new(seq))
                    .map(Mask::PerIndex)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Shared context for schema matching.
///
/// Carries the evaluator capability for guards and the reusable bindings
/// buffer; `allow_empty_data` admits selector schemas with no `data` (used by
/// optimistic entities and catch-all triggers).
pub struct MatchContext<'a> {
    /// Evaluator for `guard` scripts.
    pub engine: &'a dyn ScriptEngine,
    /// Reusable bindings table.
    pub bindings: &'a mut Bindings,
    /// Whether a schema without `data` matches.
    pub allow_empty_data: bool,
}

/// Payload construction failures.
///
/// These are runtime user-declarative failures: the caller logs them and
/// drops the command, the bus keeps running.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// The value slot does not fit inside the command template.
    #[error("value slot {offset}+{length} exceeds template length {template}")]
    ValueOffset {
        /// Declared `value_offset`.
        offset: usize,
        /// Declared value length.
        length: usize,
        /// Template byte count.
        template: usize,
    },

    /// The value cannot be represented in the declared width/encoding.
    #[error("value {value} does not fit in {length} {encoding} byte(s)")]
    ValueRange {
        /// The offending value.
        value: String,
        /// Slot width in bytes.
        length: usize,
        /// Encoding name.
        encoding: &'static str,
    },

    /// An enumerated command got a value outside its mapping.
    #[error("no mapping entry for value {value:?}")]
    MappingMiss {
        /// The symbolic value as requested.
        value: String,
    },

    /// A command that takes a value was invoked without a usable one.
    #[error("command value is not encodable: {value}")]
    Unencodable {
        /// The offending value.
        value: String,
    },

    /// A lambda returned something that is not a byte payload.
    #[error("lambda result is not a byte payload or list of payloads")]
    LambdaPayload,

    /// The evaluator failed or timed out.
    #[error(transparent)]
    Script(#[from] ScriptError),
}
