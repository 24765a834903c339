//! Transactions inside an open session.
//!
//! A transaction is bracketed by two bare tokens rather than method calls:
//!
//! ```text
//! host                         TPer
//!   │  StartTransaction 0        │
//!   │───────────────────────────>│
//!   │  StartTransaction <ack>    │   ack == 0 -> started
//!   │<───────────────────────────│
//!   │          ... methods ...   │
//!   │  EndTransaction 0|1        │   0 = commit, 1 = abort
//!   │───────────────────────────>│
//!   │  EndTransaction <echo>     │   echo must match
//!   │<───────────────────────────│
//! ```
//!
//! A mismatch is reported with the raw value. Nothing is rolled back
//! automatically; the caller decides whether to abort.

use tcg_proto::{Token, frame::PROTOCOL_METHODS};
use tracing::debug;

use crate::{
    engine::{Engine, parse_response},
    env::Environment,
    error::TcgError,
    transport::Transport,
};

const COMMIT: u64 = 0;
const ABORT: u64 = 1;

impl<T: Transport, E: Environment> Engine<T, E> {
    /// Begin a transaction.
    ///
    /// # Errors
    /// Returns [`TcgError::Transaction`] when the TPer acknowledges with a
    /// non-zero value.
    pub fn start_transaction(&mut self) -> Result<(), TcgError> {
        self.transaction_exchange("Start", Token::StartTransaction, 0)
    }

    /// Commit the open transaction.
    pub fn commit_transaction(&mut self) -> Result<(), TcgError> {
        self.transaction_exchange("Commit", Token::EndTransaction, COMMIT)
    }

    /// Abort the open transaction.
    pub fn abort_transaction(&mut self) -> Result<(), TcgError> {
        self.transaction_exchange("Abort", Token::EndTransaction, ABORT)
    }

    fn transaction_exchange(&mut self, operation: &'static str, token: Token, code: u64) -> Result<(), TcgError> {
        let scope = self.session_scope("transaction")?;
        let channel = self.channel()?;

        self.begin_packet(channel, scope)?;
        self.writer.put_token(token)?;
        self.writer.put_uint(code)?;
        self.send_packet(channel)?;

        let len = self.receive(PROTOCOL_METHODS, channel.com_id())?;
        let frame = parse_response(&self.recv_buf[..len], channel, scope)?;
        let mut reader = frame.reader();
        reader.expect_token(token).map_err(TcgError::Protocol)?;
        let ack = reader.read_uint().map_err(TcgError::Protocol)?;

        if ack != code {
            debug!(operation, ack, "transaction not acknowledged");
            return Err(TcgError::Transaction { operation, ack });
        }
        debug!(operation, "transaction acknowledged");
        Ok(())
    }
}
