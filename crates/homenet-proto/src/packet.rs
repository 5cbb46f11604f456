//! Immutable bus packet.

use std::fmt;

use bytes::Bytes;

/// A complete packet extracted from the bus, framing bytes included.
///
/// Packets are immutable and cheap to clone (`Bytes`-backed); the matcher,
/// state store, and automation engine all share the same extraction without
/// copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Bytes,
}

impl Packet {
    /// Create a packet from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// The packet bytes, header and footer included.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Total packet length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the packet is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for Packet {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Uppercase spaced hex, the format used in logs and bridge events.
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_spaced_uppercase_hex() {
        let packet = Packet::new(vec![0xAA, 0x01, 0xab]);
        assert_eq!(packet.to_string(), "AA 01 AB");
    }

    #[test]
    fn empty_packet() {
        let packet = Packet::new(Vec::new());
        assert!(packet.is_empty());
        assert_eq!(packet.to_string(), "");
    }
}
