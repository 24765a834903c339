//! Wire format for the TCG Storage Security Subsystem Class protocol.
//!
//! Method calls travel as a token stream (tiny/short/medium atoms plus
//! one-byte control tokens) wrapped in ComPacket, Packet and SubPacket
//! headers. Arguments and results share one representation, the
//! [`ParameterList`], so encoding and decoding are mirror images of each
//! other.
//!
//! Enterprise SSC devices address table columns and method parameters by
//! name; Opal devices by integer id. Everything that builds or reads a
//! name/value pair takes the active [`Ssc`] and picks the form itself.
//!
//! This crate is sans-IO: it never touches a device, never sleeps and never
//! logs. The engine in `tcg-core` drives it.
//!
//! # Security
//!
//! Header layouts are compile-time verified via `zerocopy`. Every length read
//! from the device is checked against the buffer that holds it before it is
//! used. Byte values that may hold credentials print only their length.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod columns;
pub mod discovery;
pub mod errors;
pub mod frame;
pub mod params;
pub mod status;
pub mod token;
pub mod uid;

pub use discovery::DiscoveredCapabilities;
pub use errors::{ProtocolError, Result};
pub use frame::{FrameScope, PayloadReader, PayloadWriter, ReceivedFrame, SessionIds};
pub use params::{ByteValue, ParameterList, Slot};
pub use status::MethodStatus;
pub use token::Token;
pub use uid::{Authority, Method, SecurityProvider, Ssc, Uid};
