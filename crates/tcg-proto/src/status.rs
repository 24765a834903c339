//! Method status codes.
//!
//! The first integer of a method's status list. Zero is success; every other
//! value is reported to the caller as a method error. Codes outside this
//! table are preserved as raw integers by the caller's error type.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// TCG method status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MethodStatus {
    /// Method executed
    Success = 0x00,
    /// Authority lacks access to the object or method
    NotAuthorized = 0x01,
    /// Obsolete
    Obsolete = 0x02,
    /// SP is busy with another session
    SpBusy = 0x03,
    /// SP failed
    SpFailed = 0x04,
    /// SP is disabled
    SpDisabled = 0x05,
    /// SP is frozen
    SpFrozen = 0x06,
    /// No sessions available
    NoSessionsAvailable = 0x07,
    /// Unique column conflict
    UniquenessConflict = 0x08,
    /// Insufficient space
    InsufficientSpace = 0x09,
    /// Insufficient rows
    InsufficientRows = 0x0A,
    /// Method not valid for the object
    InvalidFunction = 0x0B,
    /// Parameter rejected
    InvalidParameter = 0x0C,
    /// Reference rejected
    InvalidReference = 0x0D,
    /// Obsolete
    Obsolete2 = 0x0E,
    /// TPer malfunction
    TperMalfunction = 0x0F,
    /// Transaction failed
    TransactionFailure = 0x10,
    /// Response would overflow
    ResponseOverflow = 0x11,
    /// Authority locked out after too many failed attempts
    AuthorityLockedOut = 0x12,
    /// Unspecified failure
    Fail = 0x3F,
}

impl MethodStatus {
    /// Look up a raw status code.
    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0x00 => Self::Success,
            0x01 => Self::NotAuthorized,
            0x02 => Self::Obsolete,
            0x03 => Self::SpBusy,
            0x04 => Self::SpFailed,
            0x05 => Self::SpDisabled,
            0x06 => Self::SpFrozen,
            0x07 => Self::NoSessionsAvailable,
            0x08 => Self::UniquenessConflict,
            0x09 => Self::InsufficientSpace,
            0x0A => Self::InsufficientRows,
            0x0B => Self::InvalidFunction,
            0x0C => Self::InvalidParameter,
            0x0D => Self::InvalidReference,
            0x0E => Self::Obsolete2,
            0x0F => Self::TperMalfunction,
            0x10 => Self::TransactionFailure,
            0x11 => Self::ResponseOverflow,
            0x12 => Self::AuthorityLockedOut,
            0x3F => Self::Fail,
            _ => return None,
        })
    }

    /// Raw status code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Status name as the TCG Storage Architecture Core document spells it.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::Obsolete | Self::Obsolete2 => "OBSOLETE",
            Self::SpBusy => "SP_BUSY",
            Self::SpFailed => "SP_FAILED",
            Self::SpDisabled => "SP_DISABLED",
            Self::SpFrozen => "SP_FROZEN",
            Self::NoSessionsAvailable => "NO_SESSIONS_AVAILABLE",
            Self::UniquenessConflict => "UNIQUENESS_CONFLICT",
            Self::InsufficientSpace => "INSUFFICIENT_SPACE",
            Self::InsufficientRows => "INSUFFICIENT_ROWS",
            Self::InvalidFunction => "INVALID_FUNCTION",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::InvalidReference => "INVALID_REFERENCE",
            Self::TperMalfunction => "TPER_MALFUNCTION",
            Self::TransactionFailure => "TRANSACTION_FAILURE",
            Self::ResponseOverflow => "RESPONSE_OVERFLOW",
            Self::AuthorityLockedOut => "AUTHORITY_LOCKED_OUT",
            Self::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in (0u64..=0x12).chain([0x3F]) {
            let status = MethodStatus::from_code(code).unwrap();
            assert_eq!(u64::from(status.code()), code);
        }
        assert_eq!(MethodStatus::from_code(0x13), None);
        assert_eq!(MethodStatus::from_code(0x100), None);
    }

    #[test]
    fn display() {
        assert_eq!(MethodStatus::SpDisabled.to_string(), "SP_DISABLED (0x05)");
        assert_eq!(MethodStatus::AuthorityLockedOut.name(), "AUTHORITY_LOCKED_OUT");
    }

    #[test]
    fn serializes_as_code() {
        let mut buf = Vec::new();
        ciborium::into_writer(&MethodStatus::NotAuthorized, &mut buf).unwrap();
        let decoded: MethodStatus = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decoded, MethodStatus::NotAuthorized);
        assert_eq!(buf, [0x01]);
    }
}
