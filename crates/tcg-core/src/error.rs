//! Engine error taxonomy.
//!
//! [`TcgError`] is what every engine operation returns. Its variants map onto
//! the classes a caller has to tell apart:
//!
//! - **usage** ([`TcgError::Usage`]): rejected before any device traffic
//! - **protocol** ([`TcgError::Protocol`]): the device's bytes broke a decode
//!   expectation
//! - **method** ([`TcgError::Method`]): the device ran the call and returned a
//!   non-zero status
//! - **transport** ([`TcgError::Transport`]): send or receive failed
//! - **retry exhausted** ([`TcgError::RetryExhausted`]): the device stayed
//!   pending for the whole retry budget
//!
//! The remaining variants are specific outcomes of individual exchanges
//! (transaction acknowledgements, stack reset, authentication result).

use tcg_proto::{MethodStatus, ProtocolError, Ssc};
use thiserror::Error;

use crate::{session::SessionState, transport::TransportError};

/// Caller misuse, detected before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// Operation not valid in the current session state
    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        /// Session state at the time of the call
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Argument rejected by the wire layer (too large, unknown name, ...)
    #[error(transparent)]
    Protocol(ProtocolError),

    /// Random byte count outside `1..=32`
    #[error("random byte count {0} outside 1..=32")]
    RandomCount(usize),

    /// A Set call with no columns to write
    #[error("nothing to set")]
    NothingToSet,

    /// Feature the active SSC cannot express
    #[error("{feature} is not supported on {ssc} drives")]
    Unsupported {
        /// Active SSC
        ssc: Ssc,
        /// Rejected feature
        feature: &'static str,
    },

    /// More than 16 DataStore tables requested; 0 leaves the layout as is
    #[error("DataStore table count {0} exceeds 16")]
    DataStoreCount(usize),

    /// A credential the operation needs was not supplied or not discovered
    #[error("{0} credential required")]
    MissingCredential(&'static str),

    /// No ComID/SSC assigned yet; run discovery first
    #[error("transport has no assigned ComID; run discovery first")]
    NotDiscovered,
}

/// Stack reset outcomes other than success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackResetError {
    /// Device answered with request code 0
    #[error("no response available")]
    NoResponse,

    /// Device answered a different request
    #[error("unexpected request code {0}")]
    UnexpectedRequestCode(u32),

    /// Response addressed to another ComID
    #[error("response for ComID 0x{found:08x}, expected 0x{expected:08x}")]
    ComIdMismatch {
        /// ComID the reset was issued on
        expected: u32,
        /// ComID in the response
        found: u32,
    },

    /// Device reported failure
    #[error("device reported failure")]
    Failure,

    /// Status value outside the defined set
    #[error("unknown status {0}")]
    UnknownStatus(u32),

    /// Available data length neither 0 nor 4
    #[error("unexpected available data length {0}")]
    UnexpectedLength(u16),
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum TcgError {
    /// Caller misuse
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// Received data violated the wire format
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Device returned a non-zero method status
    #[error("{call} failed with status {}", describe_status(.code))]
    Method {
        /// Method that failed
        call: &'static str,
        /// Raw status code
        code: u64,
    },

    /// Transport send or receive failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Device kept answering "pending"
    #[error("no response after {attempts} receive attempts")]
    RetryExhausted {
        /// Receives performed
        attempts: u32,
    },

    /// Response larger than the receive buffer
    #[error("response of {outstanding} bytes does not fit the receive buffer")]
    ResponseTooLarge {
        /// Bytes the device holds
        outstanding: u32,
    },

    /// Transaction handshake returned an unexpected acknowledgement
    #[error("{operation} transaction not acknowledged (ack {ack})")]
    Transaction {
        /// Start, Commit or Abort
        operation: &'static str,
        /// Raw acknowledgement value
        ack: u64,
    },

    /// Authenticate succeeded at the method level but returned false
    #[error("authentication as {authority} failed")]
    AuthenticationFailed {
        /// Authority the call tried
        authority: String,
    },

    /// Results did not have the shape the method defines
    #[error("{call} returned unexpected results: {reason}")]
    UnexpectedResult {
        /// Method whose results were rejected
        call: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Stack reset did not succeed
    #[error("stack reset failed: {0}")]
    StackReset(#[from] StackResetError),

    /// Discovery found no SSC this engine can drive
    #[error("device reports no supported SSC")]
    UnsupportedDevice,

    /// Session snapshot could not be encoded or decoded
    #[error("session snapshot: {0}")]
    Snapshot(String),
}

impl TcgError {
    /// Device status of a method error, if it is a known code.
    pub fn method_status(&self) -> Option<MethodStatus> {
        match self {
            Self::Method { code, .. } => MethodStatus::from_code(*code),
            _ => None,
        }
    }

    /// Whether the error was raised before any device traffic.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

impl From<ProtocolError> for TcgError {
    fn from(err: ProtocolError) -> Self {
        if err.is_usage() { Self::Usage(UsageError::Protocol(err)) } else { Self::Protocol(err) }
    }
}

fn describe_status(code: &u64) -> String {
    match MethodStatus::from_code(*code) {
        Some(status) => status.to_string(),
        None => format!("0x{code:02x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_routed_by_class() {
        let usage: TcgError = ProtocolError::BandOutOfRange(2000).into();
        assert!(usage.is_usage());

        let protocol: TcgError = ProtocolError::InvalidTokenHeader(0xE5).into();
        assert!(matches!(protocol, TcgError::Protocol(ProtocolError::InvalidTokenHeader(0xE5))));
    }

    #[test]
    fn method_error_maps_status() {
        let err = TcgError::Method { call: "Get", code: 1 };
        assert_eq!(err.method_status(), Some(MethodStatus::NotAuthorized));
        assert_eq!(err.to_string(), "Get failed with status NOT_AUTHORIZED (0x01)");

        let unknown = TcgError::Method { call: "Set", code: 0x40 };
        assert_eq!(unknown.method_status(), None);
        assert_eq!(unknown.to_string(), "Set failed with status 0x40");
    }

    #[test]
    fn usage_display() {
        let err = TcgError::from(UsageError::InvalidState { state: SessionState::Closed, operation: "close_session" });
        assert_eq!(err.to_string(), "usage error: cannot close_session while session is Closed");
    }
}
