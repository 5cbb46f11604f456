//! Fuzz target for schema matching and extraction
//!
//! # Invariants
//!
//! - `matches` and `extract` never panic on any schema/packet combination
//! - Out-of-range fields return `None`, never garbage reads
//! - `except` recursion is bounded by the deserialized structure

#![no_main]

use arbitrary::Arbitrary;
use homenet_core::schema::{Decode, Endian, Mask, MatchContext, StateSchema};
use homenet_core::script::{Bindings, NullEngine};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    offset: u8,
    length: u8,
    data: Option<Vec<u8>>,
    mask: Option<u8>,
    inverted: bool,
    decode: u8,
    little: bool,
    signed: bool,
    precision: u8,
    packet: Vec<u8>,
    base_offset: u8,
}

fuzz_target!(|input: Input| {
    let schema = StateSchema {
        offset: Some(usize::from(input.offset)),
        length: Some(usize::from(input.length)),
        data: input.data,
        mask: input.mask.map(Mask::Byte),
        inverted: input.inverted,
        decode: match input.decode % 5 {
            0 => Decode::RawUint,
            1 => Decode::Signed,
            2 => Decode::Bcd,
            3 => Decode::Ascii,
            _ => Decode::SignedByteHalfDegree,
        },
        endian: if input.little { Endian::Little } else { Endian::Big },
        signed: input.signed,
        precision: u32::from(input.precision % 10),
        ..StateSchema::default()
    };

    let engine = NullEngine;
    let mut bindings = Bindings::new();
    let mut ctx =
        MatchContext { engine: &engine, bindings: &mut bindings, allow_empty_data: true };

    let _ = schema.matches(&input.packet, usize::from(input.base_offset), &mut ctx);
    let _ = schema.extract(&input.packet, usize::from(input.base_offset));
});
