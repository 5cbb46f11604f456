//! Per-bus framing contract.

use serde::{Deserialize, Serialize};

use crate::{
    Checksum, Checksum2, ProtoError,
    checksum::{append_trailer, trailer_width},
};

/// The framing contract for one bus: how inbound bytes group into packets and
/// how outbound frames are dressed.
///
/// All fields have defaults so a minimal bus (`{}`) parses; the combination is
/// validated once by [`PacketDefaults::validate`] before the bus starts.
/// Which framing discipline the parser uses follows from which fields are
/// set — see [`crate::FrameParser`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketDefaults {
    /// Bytes every inbound packet starts with.
    #[serde(with = "crate::hexfmt", skip_serializing_if = "Vec::is_empty")]
    pub rx_header: Vec<u8>,

    /// Bytes every inbound packet ends with.
    #[serde(with = "crate::hexfmt", skip_serializing_if = "Vec::is_empty")]
    pub rx_footer: Vec<u8>,

    /// Bytes that may legally start a packet; empty means no filter. Purely
    /// an accelerator for the noisy-sweep strategies.
    #[serde(with = "crate::hexfmt", skip_serializing_if = "Vec::is_empty")]
    pub rx_valid_headers: Vec<u8>,

    /// Fixed total packet length in bytes; absent means variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_length: Option<usize>,

    /// Minimum acceptable packet length.
    #[serde(skip_serializing_if = "is_default")]
    pub rx_min_length: usize,

    /// Primary inbound checksum algorithm.
    #[serde(skip_serializing_if = "is_default")]
    pub rx_checksum: Checksum,

    /// Secondary (two-byte) inbound checksum discipline.
    #[serde(skip_serializing_if = "is_default")]
    pub rx_checksum2: Checksum2,

    /// Inter-byte idle that forces a flush of the in-flight candidate.
    #[serde(skip_serializing_if = "is_default")]
    pub rx_timeout_ms: u64,

    /// Bytes prepended to every outbound frame.
    #[serde(with = "crate::hexfmt", skip_serializing_if = "Vec::is_empty")]
    pub tx_header: Vec<u8>,

    /// Bytes appended after the outbound trailer.
    #[serde(with = "crate::hexfmt", skip_serializing_if = "Vec::is_empty")]
    pub tx_footer: Vec<u8>,

    /// Primary outbound checksum algorithm.
    #[serde(skip_serializing_if = "is_default")]
    pub tx_checksum: Checksum,

    /// Secondary (two-byte) outbound checksum discipline.
    #[serde(skip_serializing_if = "is_default")]
    pub tx_checksum2: Checksum2,
}

/// Serde helper: skip default-valued fields when dumping configs.
fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

/// Default inter-byte idle before the candidate buffer is flushed.
pub(crate) const DEFAULT_RX_TIMEOUT_MS: u64 = 10;

impl PacketDefaults {
    /// Inbound trailer width in bytes.
    pub fn rx_trailer_width(&self) -> usize {
        trailer_width(self.rx_checksum, self.rx_checksum2)
    }

    /// Outbound trailer width in bytes.
    pub fn tx_trailer_width(&self) -> usize {
        trailer_width(self.tx_checksum, self.tx_checksum2)
    }

    /// Append the outbound checksum trailer to a frame holding `tx_header`
    /// plus payload. The footer is appended afterwards by the caller.
    pub fn append_tx_trailer(&self, frame: &mut Vec<u8>) {
        append_trailer(self.tx_checksum, self.tx_checksum2, frame, self.tx_header.len());
    }

    /// Effective inter-byte idle timeout.
    pub fn rx_timeout_ms(&self) -> u64 {
        if self.rx_timeout_ms == 0 { DEFAULT_RX_TIMEOUT_MS } else { self.rx_timeout_ms }
    }

    /// Smallest byte count that could be a complete inbound packet: the
    /// framing bytes plus at least one payload byte, or `rx_min_length` when
    /// that is stricter.
    pub fn rx_floor(&self) -> usize {
        let framing = self.rx_header.len() + self.rx_footer.len() + self.rx_trailer_width();
        self.rx_min_length.max(framing + 1)
    }

    /// Validate the contract once at bus start.
    ///
    /// # Errors
    ///
    /// Structural contradictions (fixed length smaller than the framing bytes,
    /// an ambiguous trailer, min above the fixed length) are configuration
    /// errors and abort bus startup.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.rx_checksum != Checksum::None && self.rx_checksum2 != Checksum2::None {
            return Err(ProtoError::AmbiguousTrailer { direction: "rx" });
        }
        if self.tx_checksum != Checksum::None && self.tx_checksum2 != Checksum2::None {
            return Err(ProtoError::AmbiguousTrailer { direction: "tx" });
        }
        if let Some(length) = self.rx_length {
            let framing =
                self.rx_header.len() + self.rx_footer.len() + self.rx_trailer_width();
            if length < framing {
                return Err(ProtoError::LengthTooSmall {
                    length,
                    header: self.rx_header.len(),
                    footer: self.rx_footer.len(),
                    trailer: self.rx_trailer_width(),
                });
            }
            if self.rx_min_length > length {
                return Err(ProtoError::MinExceedsLength { min: self.rx_min_length, length });
            }
        }
        Ok(())
    }
}
