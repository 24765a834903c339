//! Session state machine.
//!
//! Tracks the one session a transport may have open: its TPer and host
//! session ids, the packet sequence counter and the host session id counter.
//! The engine drives the transitions; this type only enforces which ones are
//! legal.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐ StartSession sent ┌─────────┐ SyncSession ok ┌──────┐
//! │ Closed │──────────────────>│ Opening │───────────────>│ Open │
//! └────────┘                   └─────────┘                └──────┘
//!     ^                             │                         │
//!     │      error / no sync        │                         │
//!     ├─────────────────────────────┘                         │
//!     │   CloseSession, RevertSP, stack reset                 │
//!     └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Sequence numbers
//!
//! Every packet carries the next sequence number, session manager packets
//! included. Starting a session resets the counter to 1 before the
//! StartSession packet is built.
//!
//! # Snapshots
//!
//! [`Session::to_cbor`] and [`Session::from_cbor`] hand a live session to
//! another process. A snapshot holds ids and counters, never credentials.

use serde::{Deserialize, Serialize};
use tcg_proto::{SessionIds, Uid};

use crate::error::{TcgError, UsageError};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session; both ids zero
    Closed,
    /// StartSession sent, SyncSession not yet decoded
    Opening,
    /// Session ids fixed, methods allowed
    Open,
}

/// Session bookkeeping for one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    state: SessionState,
    tper_session_id: u64,
    host_session_id: u64,
    sequence_number: u32,
    next_host_session_id: u64,
    sp: Option<Uid>,
}

impl Session {
    /// Create a closed session whose first StartSession uses
    /// `first_host_session_id`.
    pub fn new(first_host_session_id: u64) -> Self {
        Self {
            state: SessionState::Closed,
            tper_session_id: 0,
            host_session_id: 0,
            sequence_number: 1,
            next_host_session_id: first_host_session_id,
            sp: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a session is open.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Session ids, both zero unless open.
    pub fn ids(&self) -> SessionIds {
        SessionIds { tper: self.tper_session_id, host: self.host_session_id }
    }

    /// Security provider the session was opened against.
    pub fn sp(&self) -> Option<Uid> {
        self.sp
    }

    /// Sequence number the next packet will carry.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Host session id the next StartSession will use.
    pub fn next_host_session_id(&self) -> u64 {
        self.next_host_session_id
    }

    /// Transition to `Opening` and allocate a host session id.
    ///
    /// # Errors
    /// Returns `InvalidState` unless the session is closed.
    pub fn begin_open(&mut self, sp: Uid) -> Result<u64, UsageError> {
        if self.state != SessionState::Closed {
            return Err(UsageError::InvalidState { state: self.state, operation: "start_session" });
        }

        let host = self.next_host_session_id;
        self.next_host_session_id = self.next_host_session_id.wrapping_add(1);
        self.host_session_id = host;
        self.sequence_number = 1;
        self.sp = Some(sp);
        self.state = SessionState::Opening;
        Ok(host)
    }

    /// Transition to `Open` with the TPer-assigned id.
    ///
    /// # Errors
    /// Returns `InvalidState` unless the session is opening.
    pub fn complete_open(&mut self, tper_session_id: u64) -> Result<(), UsageError> {
        if self.state != SessionState::Opening {
            return Err(UsageError::InvalidState { state: self.state, operation: "complete_open" });
        }

        self.tper_session_id = tper_session_id;
        self.state = SessionState::Open;
        Ok(())
    }

    /// Return to `Closed` after a failed StartSession. The host id counter
    /// keeps its new value.
    pub fn abort_open(&mut self) {
        if self.state == SessionState::Opening {
            self.clear();
        }
    }

    /// Take the sequence number for the next packet.
    pub fn next_sequence(&mut self) -> u32 {
        let current = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        current
    }

    /// Drop the session locally.
    pub fn clear(&mut self) {
        self.state = SessionState::Closed;
        self.tper_session_id = 0;
        self.host_session_id = 0;
        self.sp = None;
    }

    /// Ids of the open session.
    ///
    /// # Errors
    /// Returns `InvalidState` naming `operation` unless the session is open.
    pub fn require_open(&self, operation: &'static str) -> Result<SessionIds, UsageError> {
        if self.state != SessionState::Open {
            return Err(UsageError::InvalidState { state: self.state, operation });
        }
        Ok(self.ids())
    }

    /// Encode as CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>, TcgError> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out).map_err(|e| TcgError::Snapshot(e.to_string()))?;
        Ok(out)
    }

    /// Decode a snapshot written by [`Self::to_cbor`].
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, TcgError> {
        ciborium::from_reader(bytes).map_err(|e| TcgError::Snapshot(e.to_string()))
    }
}
