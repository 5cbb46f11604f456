//! Serde codec for byte arrays written as `0xXX` tokens.
//!
//! Bus configurations spell bytes in hex (`[0x02, 0x31]`), decimal (`[2, 49]`)
//! or quoted hex strings (`["0x02", "0x31"]`). YAML 1.1 resolves bare `0x`
//! integers natively; the string form survives YAML 1.2 loaders and is what
//! the dumper emits, so a dumped config always re-loads.
//!
//! Use with `#[serde(with = "homenet_proto::hexfmt")]` on `Vec<u8>` fields.

use std::fmt;

use serde::{
    Deserializer, Serializer,
    de::{self, SeqAccess, Visitor},
    ser::SerializeSeq,
};

/// Serialize bytes as a sequence of `"0xXX"` tokens.
pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
    for byte in bytes {
        seq.serialize_element(&format!("0x{byte:02X}"))?;
    }
    seq.end()
}

/// Deserialize a byte sequence accepting integers and `0xXX` strings.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_seq(BytesVisitor)
}

struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sequence of bytes (integers or \"0xXX\" strings)")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(token) = seq.next_element::<ByteToken>()? {
            bytes.push(token.0);
        }
        Ok(bytes)
    }
}

struct ByteToken(u8);

impl<'de> serde::Deserialize<'de> for ByteToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ByteTokenVisitor)
    }
}

struct ByteTokenVisitor;

impl Visitor<'_> for ByteTokenVisitor {
    type Value = ByteToken;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte as an integer or a \"0xXX\" string")
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        u8::try_from(value)
            .map(ByteToken)
            .map_err(|_| E::custom(format!("byte out of range: {value}")))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        u8::try_from(value)
            .map(ByteToken)
            .map_err(|_| E::custom(format!("byte out of range: {value}")))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        parse_byte(value)
            .map(ByteToken)
            .ok_or_else(|| E::custom(format!("invalid byte token: {value:?}")))
    }
}

/// `Option<Vec<u8>>` variant for schema fields where absence is meaningful.
///
/// Use with `#[serde(default, with = "homenet_proto::hexfmt::opt")]`.
pub mod opt {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize optional bytes; `None` serializes as null.
    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => super::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional bytes with the same token rules as the base codec.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super")] Vec<u8>);

        Option::<Wrapper>::deserialize(deserializer).map(|opt| opt.map(|w| w.0))
    }
}

/// Parse a single byte token: `0xXX`, hex with `0X`, or decimal.
pub fn parse_byte(token: &str) -> Option<u8> {
    let token = token.trim();
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Fixture {
        #[serde(with = "super")]
        data: Vec<u8>,
    }

    #[test]
    fn accepts_hex_decimal_and_strings() {
        let fixture: Fixture =
            serde_yaml::from_str("data: [0xAA, 187, \"0x0C\", \"13\"]").unwrap();
        assert_eq!(fixture.data, vec![0xAA, 0xBB, 0x0C, 13]);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(serde_yaml::from_str::<Fixture>("data: [256]").is_err());
        assert!(serde_yaml::from_str::<Fixture>("data: [-1]").is_err());
    }

    #[test]
    fn dumps_hex_tokens_that_reload() {
        let fixture = Fixture { data: vec![0x02, 0xFF] };
        let dumped = serde_yaml::to_string(&fixture).unwrap();
        assert!(dumped.contains("0x02"));
        assert!(dumped.contains("0xFF"));
        let reloaded: Fixture = serde_yaml::from_str(&dumped).unwrap();
        assert_eq!(reloaded, fixture);
    }
}
