//! Error types for the framing layer.
//!
//! The parser itself never fails on malformed input (bad candidates cost one
//! byte of head advance); errors here surface structural problems in a bus
//! framing contract, detected before the bus starts.

use thiserror::Error;

/// Structural problems in a [`crate::PacketDefaults`] declaration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Fixed length too small for the declared framing bytes.
    #[error(
        "rx_length {length} cannot hold header ({header} B), footer ({footer} B) and checksum ({trailer} B)"
    )]
    LengthTooSmall {
        /// Declared fixed length.
        length: usize,
        /// Header length in bytes.
        header: usize,
        /// Footer length in bytes.
        footer: usize,
        /// Trailer (checksum) width in bytes.
        trailer: usize,
    },

    /// Both a single-byte and a two-byte checksum were declared for one
    /// direction; the trailer layout must be unambiguous.
    #[error("{direction} declares both a primary and a two-byte checksum")]
    AmbiguousTrailer {
        /// `"rx"` or `"tx"`.
        direction: &'static str,
    },

    /// Minimum length exceeds the declared fixed length.
    #[error("rx_min_length {min} exceeds rx_length {length}")]
    MinExceedsLength {
        /// Declared minimum length.
        min: usize,
        /// Declared fixed length.
        length: usize,
    },
}
