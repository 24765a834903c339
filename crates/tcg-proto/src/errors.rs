//! Error types for the wire layer.
//!
//! Every fallible operation in this crate returns [`ProtocolError`]. Variants
//! fall into two classes:
//!
//! - **usage**: the caller asked for something unrepresentable (a byte string
//!   longer than a medium atom, a full parameter list, an unknown band). These
//!   are detected before any byte is written.
//! - **protocol**: bytes received from the device violated an expectation
//!   (wrong token, bad frame length, mismatched session).
//!
//! [`ProtocolError::is_usage`] tells the two apart so higher layers can route
//! them into their own taxonomy.

use thiserror::Error;

use crate::{params::SlotKind, uid::Uid};

/// Result alias for wire-layer operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding, decoding, or validating wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Byte string cannot be encoded as a short or medium atom.
    #[error("byte string of {len} bytes exceeds the {max}-byte atom limit")]
    ValueTooLarge {
        /// Length of the rejected value
        len: usize,
        /// Largest encodable length
        max: usize,
    },

    /// No room left in a parameter list.
    #[error("parameter list full: {needed} slots needed, capacity {capacity}")]
    ParameterListFull {
        /// Slots the operation needed
        needed: usize,
        /// Total slot capacity of the list
        capacity: usize,
    },

    /// Byte value larger than one table cell.
    #[error("byte value of {len} bytes exceeds cell capacity {capacity}")]
    ByteValueTooLarge {
        /// Length of the rejected value
        len: usize,
        /// Fixed cell capacity
        capacity: usize,
    },

    /// Band (locking range) number outside `0..=1023`.
    #[error("band number {0} out of range")]
    BandOutOfRange(u16),

    /// A name has no UID in the table for this SSC.
    #[error("unknown {kind}: {name}")]
    UnknownName {
        /// Table the lookup went to (authority, credential, table)
        kind: &'static str,
        /// Display form of the rejected name
        name: String,
    },

    /// Send buffer cannot hold the next write.
    #[error("send buffer full: {needed} bytes needed, {remaining} remaining")]
    BufferFull {
        /// Bytes the write needed
        needed: usize,
        /// Bytes left before capacity
        remaining: usize,
    },

    /// Read ran past the end of received data.
    #[error("receive buffer underrun at offset {offset}: {needed} more bytes needed")]
    BufferUnderrun {
        /// Read cursor when the underrun happened
        offset: usize,
        /// Bytes the read needed
        needed: usize,
    },

    /// `finalize` called before any frame headers were written.
    #[error("payload finalized without frame headers")]
    FrameNotStarted,

    /// Leading byte matches none of the atom header patterns.
    #[error("unrecognized token header 0x{0:02x}")]
    InvalidTokenHeader(u8),

    /// Decode found a token other than the one the context requires.
    #[error("unexpected token 0x{found:02x}, expected {expected}")]
    UnexpectedToken {
        /// What the decoder was looking for
        expected: &'static str,
        /// Leading byte actually found
        found: u8,
    },

    /// Integer atom wider than 64 bits.
    #[error("integer atom of {0} bytes does not fit in 64 bits")]
    IntegerTooWide(usize),

    /// Fixed UID in a response did not match.
    #[error("UID mismatch: expected {expected}, found {found}")]
    UidMismatch {
        /// UID the protocol mandates here
        expected: Uid,
        /// UID actually decoded
        found: Uid,
    },

    /// Byte atom expected to be a UID had the wrong length.
    #[error("UID atom has {0} bytes, expected 8")]
    InvalidUidLength(usize),

    /// Received ComPacket addressed to another ComID.
    #[error("ComID mismatch: expected 0x{expected:08x}, received 0x{found:08x}")]
    ComIdMismatch {
        /// Extended ComID assigned to this channel
        expected: u32,
        /// Extended ComID in the received header
        found: u32,
    },

    /// A frame length field is inconsistent with its container.
    #[error("{frame} length {declared} invalid: {reason}")]
    FrameLength {
        /// Which frame (ComPacket, Packet, SubPacket)
        frame: &'static str,
        /// Value of the length field
        declared: u32,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Packet session identifiers did not match the expected exchange.
    #[error(
        "session mismatch: expected tper={expected_tper} host={expected_host}, \
         received tper={tper} host={host}"
    )]
    SessionMismatch {
        /// Expected TPer session id (0 for session-manager exchanges)
        expected_tper: u64,
        /// Expected host session id (0 for session-manager exchanges)
        expected_host: u64,
        /// Received TPer session id
        tper: u64,
        /// Received host session id
        host: u64,
    },

    /// Session id does not fit the 32-bit Packet header field.
    #[error("session id {0:#x} does not fit a Packet header")]
    SessionIdTooWide(u64),

    /// Padding after the SubPacket body is not zero.
    #[error("non-zero SubPacket padding byte {0:#04x}")]
    NonZeroPadding(u8),

    /// Parameter read cursor reached the write cursor.
    #[error("read past valid data: slot {position} of {len}")]
    ReadPastEnd {
        /// Read cursor position
        position: usize,
        /// Slots written
        len: usize,
    },

    /// Parameter slot holds a different type than requested.
    #[error("parameter slot type mismatch: expected {expected}, found {found}")]
    SlotMismatch {
        /// Type the caller asked for
        expected: SlotKind,
        /// Type stored in the slot
        found: SlotKind,
    },

    /// No `StartName, key, value` triple for the requested key.
    #[error("no value for {0}")]
    MissingValue(String),

    /// Status list had a non-zero value in a reserved position.
    #[error("malformed method status list: {field} = {value}")]
    MalformedStatus {
        /// Which reserved field was non-zero
        field: &'static str,
        /// The non-zero value
        value: u64,
    },

    /// Level 0 header carried an unknown data structure version.
    #[error("unsupported discovery data structure version {0}")]
    UnsupportedDiscoveryVersion(u32),

    /// Discovery blob shorter than its header claims.
    #[error("discovery data truncated: {declared} bytes declared, {available} available")]
    DiscoveryTruncated {
        /// Bytes the header or descriptor declares
        declared: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Feature descriptor body shorter than its fixed layout.
    #[error("{feature} descriptor truncated: {length} bytes, layout needs {needed}")]
    DescriptorTruncated {
        /// Feature name
        feature: &'static str,
        /// Declared descriptor length
        length: usize,
        /// Bytes the layout needs
        needed: usize,
    },
}

impl ProtocolError {
    /// Whether this error reflects caller misuse rather than device data.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::ValueTooLarge { .. }
                | Self::ParameterListFull { .. }
                | Self::ByteValueTooLarge { .. }
                | Self::BandOutOfRange(_)
                | Self::UnknownName { .. }
                | Self::FrameNotStarted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_classification() {
        assert!(ProtocolError::ValueTooLarge { len: 4096, max: 2047 }.is_usage());
        assert!(ProtocolError::BandOutOfRange(1024).is_usage());
        assert!(!ProtocolError::InvalidTokenHeader(0xE4).is_usage());
        assert!(!ProtocolError::ReadPastEnd { position: 0, len: 0 }.is_usage());
    }

    #[test]
    fn display_includes_values() {
        let err = ProtocolError::ComIdMismatch { expected: 0x07FE_0000, found: 0x0800_0000 };
        assert_eq!(err.to_string(), "ComID mismatch: expected 0x07fe0000, received 0x08000000");
    }
}
