//! Stateful frame extraction from an unsynchronised byte stream.
//!
//! The parser is a single-producer byte sink. [`FrameParser::feed`] appends a
//! chunk and returns every packet that became complete; [`FrameParser::idle_flush`]
//! is called by the bus driver when the inter-byte gap exceeds
//! `rx_timeout_ms` and forces a verdict on the pending candidate.
//!
//! # Framing strategies
//!
//! The discipline is chosen once at construction from the bus defaults:
//!
//! | Strategy | Selected when |
//! |---|---|
//! | header + footer | both `rx_header` and `rx_footer` set |
//! | footer only | `rx_footer` set, no header |
//! | fixed length | `rx_length` set, no footer |
//! | checksum sweep | neither footer nor length |
//!
//! # Invariants
//!
//! - Chunk independence: for a fixed configuration, the emitted packet
//!   sequence depends only on the concatenated input, never on how `feed`
//!   calls split it (verified by `tests/parser_properties.rs`).
//! - An invalid candidate consumes exactly one byte of head advance.
//! - Malformed input never panics and is never reported as a packet.

use bytes::Bytes;

use crate::{Packet, PacketDefaults, checksum::verify_trailer};

/// Candidate buffer capacity. On overflow the oldest bytes are dropped;
/// input is never rejected.
const BUFFER_CAP: usize = 16 * 1024;

/// Upper bound on candidate lengths tried by the checksum sweep. The contract
/// carries no `rx_max_length`; 64 bytes is far above any home-automation
/// frame.
const MAX_SWEEP_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    HeaderFooter,
    FooterOnly,
    FixedLength,
    Sweep,
}

/// One step of the extraction loop.
enum Step {
    /// Emit `buf[..len]` as a packet and advance past it.
    Emit(usize),
    /// Discard `n` bytes from the head.
    Advance(usize),
    /// Wait for more bytes.
    Hold,
}

/// Stateful packet extractor for one bus.
#[derive(Debug)]
pub struct FrameParser {
    defaults: PacketDefaults,
    strategy: Strategy,
    buf: Vec<u8>,
}

impl FrameParser {
    /// Build a parser for the given framing contract.
    pub fn new(defaults: PacketDefaults) -> Self {
        let strategy = if !defaults.rx_footer.is_empty() {
            if defaults.rx_header.is_empty() {
                Strategy::FooterOnly
            } else {
                Strategy::HeaderFooter
            }
        } else if defaults.rx_length.is_some() {
            Strategy::FixedLength
        } else {
            Strategy::Sweep
        };
        Self { defaults, strategy, buf: Vec::with_capacity(256) }
    }

    /// Append a chunk and extract every packet that became complete.
    ///
    /// Never blocks and never fails; bytes that do not form a valid packet
    /// are consumed one head byte at a time.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.ingest(bytes);
        let mut packets = Vec::new();
        self.drain(false, &mut packets);
        packets
    }

    /// Force a verdict on the pending candidate after an inter-byte idle gap.
    ///
    /// Variable-length strategies evaluate the buffered bytes as final;
    /// whatever cannot be validated is discarded as inter-packet noise.
    pub fn idle_flush(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        self.drain(true, &mut packets);
        if !self.buf.is_empty() {
            tracing::debug!(discarded = self.buf.len(), "idle flush discarding stale candidate");
            self.buf.clear();
        }
        packets
    }

    /// Bytes currently buffered and not yet resolved.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let incoming = if bytes.len() > BUFFER_CAP {
            &bytes[bytes.len() - BUFFER_CAP..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + incoming.len()).saturating_sub(BUFFER_CAP);
        if overflow > 0 {
            tracing::debug!(dropped = overflow, "candidate buffer overflow, dropping head");
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(incoming);
    }

    fn drain(&mut self, finalize: bool, packets: &mut Vec<Packet>) {
        loop {
            let step = match self.strategy {
                Strategy::HeaderFooter => self.step_header_footer(finalize),
                Strategy::FooterOnly => self.step_footer_only(),
                Strategy::FixedLength => self.step_fixed_length(),
                Strategy::Sweep => self.step_sweep(finalize),
            };
            match step {
                Step::Emit(len) => {
                    packets.push(Packet::new(Bytes::copy_from_slice(&self.buf[..len])));
                    self.buf.drain(..len);
                },
                Step::Advance(n) if n > 0 => {
                    self.buf.drain(..n.min(self.buf.len()));
                },
                Step::Advance(_) | Step::Hold => break,
            }
        }
    }

    /// Slide the head to the first full header occurrence, then wait for the
    /// footer and validate head..footer inclusive.
    fn step_header_footer(&self, finalize: bool) -> Step {
        let header = &self.defaults.rx_header;
        let footer = &self.defaults.rx_footer;

        if !self.buf.starts_with(header) {
            if let Some(at) = find_subslice(&self.buf, header) {
                return Step::Advance(at);
            }
            // No full header: only the trailing header.len()-1 bytes could
            // still begin one once more bytes arrive.
            let keep = header.len().saturating_sub(1);
            return Step::Advance(self.buf.len().saturating_sub(keep));
        }

        let Some(at) = find_subslice(&self.buf[header.len()..], footer) else {
            return if finalize { Step::Advance(self.buf.len()) } else { Step::Hold };
        };
        let candidate_len = header.len() + at + footer.len();
        if self.accept(&self.buf[..candidate_len]) {
            Step::Emit(candidate_len)
        } else {
            Step::Advance(1)
        }
    }

    /// Head..first-footer is the candidate.
    fn step_footer_only(&self) -> Step {
        if self.buf.is_empty() {
            return Step::Hold;
        }
        if let Step::Advance(n) = self.head_filter() {
            return Step::Advance(n);
        }
        let Some(at) = find_subslice(&self.buf, &self.defaults.rx_footer) else {
            return Step::Hold;
        };
        let candidate_len = at + self.defaults.rx_footer.len();
        if self.accept(&self.buf[..candidate_len]) {
            Step::Emit(candidate_len)
        } else {
            Step::Advance(1)
        }
    }

    /// Fixed-length frames: filter the head, then verify `rx_length` bytes.
    fn step_fixed_length(&self) -> Step {
        if self.buf.is_empty() {
            return Step::Hold;
        }
        match self.head_filter() {
            Step::Advance(n) => return Step::Advance(n),
            Step::Hold => return Step::Hold,
            Step::Emit(_) => {},
        }
        let length = self.defaults.rx_length.unwrap_or(self.buf.len());
        if self.buf.len() < length {
            return Step::Hold;
        }
        if self.accept(&self.buf[..length]) {
            Step::Emit(length)
        } else {
            Step::Advance(1)
        }
    }

    /// Neither footer nor length: try every plausible length at this head,
    /// shortest valid wins.
    fn step_sweep(&self, finalize: bool) -> Step {
        if self.buf.is_empty() {
            return Step::Hold;
        }
        match self.head_filter() {
            Step::Advance(n) => return Step::Advance(n),
            Step::Hold => return Step::Hold,
            Step::Emit(_) => {},
        }
        let floor = self.defaults.rx_floor();
        let ceiling = self.buf.len().min(MAX_SWEEP_LENGTH);
        for len in floor..=ceiling {
            if self.accept(&self.buf[..len]) {
                return Step::Emit(len);
            }
        }
        if self.buf.len() >= MAX_SWEEP_LENGTH || finalize {
            // Every plausible length at this head is exhausted.
            Step::Advance(1)
        } else {
            Step::Hold
        }
    }

    /// O(1) head filter: `rx_valid_headers` membership plus the declared
    /// header prefix. `Emit(0)` means the head passed.
    fn head_filter(&self) -> Step {
        if !self.defaults.rx_valid_headers.is_empty()
            && !self.defaults.rx_valid_headers.contains(&self.buf[0])
        {
            return Step::Advance(1);
        }
        let header = &self.defaults.rx_header;
        if !header.is_empty() {
            if self.buf.len() < header.len() {
                return if header.starts_with(&self.buf) { Step::Hold } else { Step::Advance(1) };
            }
            if !self.buf.starts_with(header) {
                return Step::Advance(1);
            }
        }
        Step::Emit(0)
    }

    /// Full candidate validation: length floor, fixed length when declared,
    /// checksum trailer.
    fn accept(&self, candidate: &[u8]) -> bool {
        if candidate.len() < self.defaults.rx_floor() {
            return false;
        }
        if let Some(length) = self.defaults.rx_length
            && candidate.len() != length
        {
            return false;
        }
        verify_trailer(
            self.defaults.rx_checksum,
            self.defaults.rx_checksum2,
            candidate,
            self.defaults.rx_header.len(),
            self.defaults.rx_footer.len(),
        )
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
