//! Fuzz target for frame-parser robustness and chunk independence
//!
//! # Strategy
//!
//! - Framing contract: arbitrary combination of header, footer, fixed
//!   length, minimum length, and checksum family
//! - Stream: arbitrary bytes split at arbitrary cut points
//!
//! # Invariants
//!
//! - The parser never panics on any input
//! - Chunked parsing emits the same packet sequence as whole parsing
//! - The pending tail is bounded by the buffer cap
//! - `idle_flush` always drains the buffer to empty

#![no_main]

use arbitrary::Arbitrary;
use homenet_proto::{Checksum, Checksum2, FrameParser, PacketDefaults};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Contract {
    header: Option<[u8; 2]>,
    footer: Option<u8>,
    length: Option<u8>,
    min_length: u8,
    checksum: u8,
    two_byte: bool,
}

#[derive(Debug, Arbitrary)]
struct Input {
    contract: Contract,
    stream: Vec<u8>,
    cuts: Vec<u8>,
}

fn defaults(contract: &Contract) -> PacketDefaults {
    let checksum = match contract.checksum % 7 {
        0 => Checksum::None,
        1 => Checksum::Add,
        2 => Checksum::AddNoHeader,
        3 => Checksum::Xor,
        4 => Checksum::XorNoHeader,
        5 => Checksum::SamsungRx,
        _ => Checksum::SamsungTx,
    };
    let two_byte = contract.two_byte && checksum == Checksum::None;
    PacketDefaults {
        rx_header: contract.header.map(|h| h.to_vec()).unwrap_or_default(),
        rx_footer: contract.footer.map(|f| vec![f]).unwrap_or_default(),
        rx_length: contract.length.map(|l| usize::from(l % 32) + 1),
        rx_min_length: usize::from(contract.min_length % 16),
        rx_checksum: checksum,
        rx_checksum2: if two_byte { Checksum2::XorAdd } else { Checksum2::None },
        ..PacketDefaults::default()
    }
}

fuzz_target!(|input: Input| {
    let defaults = defaults(&input.contract);
    if defaults.validate().is_err() {
        return;
    }

    let mut whole = FrameParser::new(defaults.clone());
    let whole_packets = whole.feed(&input.stream);

    let mut chunked = FrameParser::new(defaults);
    let mut chunked_packets = Vec::new();
    let mut last = 0;
    for cut in &input.cuts {
        let cut = (usize::from(*cut) * input.stream.len().max(1) / 256).min(input.stream.len());
        if cut < last {
            continue;
        }
        chunked_packets.extend(chunked.feed(&input.stream[last..cut]));
        last = cut;
    }
    chunked_packets.extend(chunked.feed(&input.stream[last..]));

    assert_eq!(chunked_packets, whole_packets);
    assert_eq!(chunked.pending(), whole.pending());

    let _ = whole.idle_flush();
    assert_eq!(whole.pending(), 0);
});
