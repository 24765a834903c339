//! Token codec.
//!
//! The TCG token stream mixes fixed one-byte control tokens with
//! self-describing atoms (integers and byte strings). Atom headers select one
//! of four forms from the leading byte's high bits:
//!
//! ```text
//! 0b0sxx_xxxx               tiny    (value in the header byte itself)
//! 0b10bs_llll               short   (0..15 payload bytes)
//! 0b110b_slll llll_llll     medium  (0..2047 payload bytes)
//! 0b1110_00bs + 3 bytes     long    (0..16M payload bytes)
//! ```
//!
//! `b` marks a byte string, `s` a signed integer. This crate only produces
//! unsigned integers and never uses the long form when encoding.

use crate::errors::{ProtocolError, Result};

/// Largest integer encoded as a tiny atom.
pub const TINY_ATOM_MAX: u64 = 63;

/// Integers at or above this value use the 8-byte short atom form.
pub const WIDE_INTEGER_THRESHOLD: u64 = i32::MAX as u64;

/// Byte strings shorter than this use a short atom.
pub const SHORT_BYTES_LIMIT: usize = 16;

/// Largest byte string the encoder accepts (medium atom).
pub const MEDIUM_BYTES_MAX: usize = 2047;

/// Control tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Token {
    /// Opens a list
    StartList = 0xF0,
    /// Closes a list
    EndList = 0xF1,
    /// Opens a name/value pair
    StartName = 0xF2,
    /// Closes a name/value pair
    EndName = 0xF3,
    /// Method invocation marker
    Call = 0xF8,
    /// End of method data, status list follows
    EndOfData = 0xF9,
    /// Close the session
    EndOfSession = 0xFA,
    /// Begin a transaction
    StartTransaction = 0xFB,
    /// Commit or abort a transaction
    EndTransaction = 0xFC,
}

impl Token {
    /// Wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a control token byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0xF0 => Some(Self::StartList),
            0xF1 => Some(Self::EndList),
            0xF2 => Some(Self::StartName),
            0xF3 => Some(Self::EndName),
            0xF8 => Some(Self::Call),
            0xF9 => Some(Self::EndOfData),
            0xFA => Some(Self::EndOfSession),
            0xFB => Some(Self::StartTransaction),
            0xFC => Some(Self::EndTransaction),
            _ => None,
        }
    }

    /// Name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::StartList => "StartList",
            Self::EndList => "EndList",
            Self::StartName => "StartName",
            Self::EndName => "EndName",
            Self::Call => "Call",
            Self::EndOfData => "EndOfData",
            Self::EndOfSession => "EndOfSession",
            Self::StartTransaction => "StartTransaction",
            Self::EndTransaction => "EndTransaction",
        }
    }
}

/// Whether an atom carries an integer or a byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    /// Unsigned integer
    Integer,
    /// Byte string
    Bytes,
}

/// Decoded atom header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomHeader {
    /// Integer or byte string
    pub kind: AtomKind,
    /// Payload length following the header (0 for tiny atoms)
    pub len: usize,
    /// Extra length bytes that follow the first header byte
    pub extra_header_bytes: usize,
    /// Value carried inside a tiny atom's header byte
    pub tiny: Option<u64>,
}

impl AtomHeader {
    /// Classify the first header byte.
    ///
    /// `rest` supplies the header bytes following the first (medium and long
    /// forms carry part of their length there). The number of bytes taken
    /// from `rest` is reported in [`AtomHeader::extra_header_bytes`].
    pub fn decode(first: u8, rest: &[u8]) -> Result<Self> {
        let underrun = |needed: usize| ProtocolError::BufferUnderrun { offset: 1, needed };

        if first & 0x80 == 0 {
            return Ok(Self {
                kind: AtomKind::Integer,
                len: 0,
                extra_header_bytes: 0,
                tiny: Some(u64::from(first)),
            });
        }

        if first & 0xC0 == 0x80 {
            let kind = if first & 0x20 == 0 { AtomKind::Integer } else { AtomKind::Bytes };
            return Ok(Self {
                kind,
                len: usize::from(first & 0x0F),
                extra_header_bytes: 0,
                tiny: None,
            });
        }

        if first & 0xE0 == 0xC0 {
            let low = *rest.first().ok_or_else(|| underrun(1))?;
            let kind = if first & 0x10 == 0 { AtomKind::Integer } else { AtomKind::Bytes };
            return Ok(Self {
                kind,
                len: (usize::from(first & 0x07) << 8) | usize::from(low),
                extra_header_bytes: 1,
                tiny: None,
            });
        }

        if first & 0xFC == 0xE0 {
            let bytes = rest.get(..3).ok_or_else(|| underrun(3))?;
            let kind = if first & 0x02 == 0 { AtomKind::Integer } else { AtomKind::Bytes };
            let len = (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2]);
            return Ok(Self { kind, len, extra_header_bytes: 3, tiny: None });
        }

        Err(ProtocolError::InvalidTokenHeader(first))
    }
}

/// A decoded atom borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atom<'a> {
    /// Unsigned integer
    Integer(u64),
    /// Byte string
    Bytes(&'a [u8]),
}

/// Encode an unsigned integer atom into `out`, returning bytes written.
///
/// `out` must hold at least 9 bytes.
pub fn encode_uint(value: u64, out: &mut [u8; 9]) -> usize {
    if value <= TINY_ATOM_MAX {
        out[0] = value as u8;
        1
    } else if value < WIDE_INTEGER_THRESHOLD {
        out[0] = 0x84;
        out[1..5].copy_from_slice(&(value as u32).to_be_bytes());
        5
    } else {
        out[0] = 0x88;
        out[1..9].copy_from_slice(&value.to_be_bytes());
        9
    }
}

/// Encode a byte-string atom header for `len` payload bytes.
///
/// Returns the header bytes and their count. Lengths above
/// [`MEDIUM_BYTES_MAX`] are rejected.
pub fn encode_bytes_header(len: usize) -> Result<([u8; 2], usize)> {
    if len < SHORT_BYTES_LIMIT {
        Ok(([0xA0 | len as u8, 0], 1))
    } else if len <= MEDIUM_BYTES_MAX {
        Ok(([0xD0 | (len >> 8) as u8, (len & 0xFF) as u8], 2))
    } else {
        Err(ProtocolError::ValueTooLarge { len, max: MEDIUM_BYTES_MAX })
    }
}
