//! TCG Storage protocol engine.
//!
//! Drives a self-encrypting drive through the TCG Storage SSC protocol on top
//! of the sans-IO wire layer in `tcg-proto`.
//!
//! # Architecture
//!
//! The engine is synchronous and owns everything mutable: one transport, one
//! session, the send and receive buffers and the parameter scratch lists.
//! Each operation borrows them for its duration and returns before the next
//! one starts. Device I/O goes through the [`Transport`] trait and the retry
//! delay through the [`Environment`] trait, so tests replay whole exchanges
//! without a device and without wall-clock time.
//!
//! # Components
//!
//! - [`engine`]: Method invocation with bounded retry, session start/close,
//!   Properties, stack and TPer reset
//! - [`methods`]: Authenticate, Get, Set, Random, GenKey, Erase, Activate,
//!   Reactivate, RevertSP
//! - [`transaction`]: Start, commit and abort
//! - [`session`]: Session state machine and CBOR snapshots
//! - [`drive`]: Whole workflows (discover, PIN change, band locking, ...)
//! - [`mod@env`]: Environment abstraction (sleep)
//! - [`transport`]: Transport abstraction (IF-SEND/IF-RECV)
//! - [`config`]: Engine configuration
//! - [`error`]: Error taxonomy

pub mod config;
pub mod drive;
pub mod engine;
pub mod env;
pub mod error;
pub mod methods;
pub mod session;
pub mod transaction;
pub mod transport;

pub use config::{EngineConfig, RetryConfig};
pub use drive::Drive;
pub use engine::Engine;
pub use env::{Environment, SystemEnv};
pub use error::{TcgError, UsageError};
pub use methods::{ActivateOptions, Cell, ReactivateOptions};
pub use session::{Session, SessionState};
pub use transport::{Channel, Transport, TransportError};
