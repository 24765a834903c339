//! Deterministic test harness for the TCG engine.
//!
//! Scripted implementations of the Environment and Transport traits plus
//! byte-exact builders for device replies, so end-to-end exchanges run
//! without a drive and without wall-clock time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod discovery;
pub mod fault;
pub mod response;
pub mod sim_env;
pub mod sim_transport;

pub use discovery::DiscoveryBuilder;
pub use fault::PendingInjector;
pub use response::ResponseBuilder;
pub use sim_env::SimEnv;
pub use sim_transport::{FakeTransport, SentPacket};
