//! Packet framing layer for RS-485 home-automation buses.
//!
//! This crate turns a noisy, unsynchronised byte stream into well-formed
//! packets and back:
//!
//! - [`Packet`]: an immutable, cheaply cloneable byte packet.
//! - [`Checksum`] / [`Checksum2`]: the vendor checksum family (additive,
//!   XOR-fold, Samsung variants, two-byte xor+add trailer).
//! - [`PacketDefaults`]: the per-bus framing contract (headers, footers,
//!   lengths, checksums, inter-byte timeout).
//! - [`FrameParser`]: a stateful sink that extracts packets under one of four
//!   framing disciplines chosen from the defaults.
//!
//! The parser is transport-agnostic: serial, TCP-tunnelled serial, and test
//! fixtures all feed the same [`FrameParser::feed`] entry point.

mod checksum;
mod defaults;
mod error;
pub mod hexfmt;
mod packet;
mod parser;

pub use checksum::{Checksum, Checksum2};
pub use defaults::PacketDefaults;
pub use error::ProtoError;
pub use packet::Packet;
pub use parser::FrameParser;
