//! Transport abstraction for IF-SEND/IF-RECV.
//!
//! The engine never issues ATA or SCSI commands itself. A caller supplies a
//! [`Transport`] that moves one buffer per call to or from the device's
//! security protocol interface. Production wraps a block device handle; tests
//! use the scripted transport in `tcg-harness`.
//!
//! A transport also carries the [`Channel`] assigned after Level 0
//! Discovery: the extended ComID every ComPacket is addressed to and the SSC
//! family that selects UIDs and addressing for the rest of the connection.

use std::io;

use serde::{Deserialize, Serialize};
use tcg_proto::{Ssc, frame::short_com_id};
use thiserror::Error;

/// Failure of the underlying send/receive.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operating system I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Device rejected the command
    #[error("device error: {0}")]
    Device(String),

    /// Transport has been closed
    #[error("transport closed")]
    Closed,
}

/// ComID and SSC family negotiated by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Extended ComID; the upper 16 bits are the base ComID
    pub extended_com_id: u32,
    /// SSC family the device is driven with
    pub ssc: Ssc,
}

impl Channel {
    /// ComID used in the IF-SEND/IF-RECV command itself.
    pub const fn com_id(self) -> u16 {
        short_com_id(self.extended_com_id)
    }
}

/// Security protocol send/receive against one device.
///
/// Implementations are blocking. One transport belongs to exactly one
/// engine; callers sharing a device across threads serialize access
/// themselves.
pub trait Transport {
    /// Send `payload` with the given security protocol and ComID.
    fn send(&mut self, protocol: u8, com_id: u16, payload: &[u8]) -> Result<(), TransportError>;

    /// Receive into `buf`, returning the number of bytes written.
    ///
    /// Returning fewer bytes than a full ComPacket header is allowed; the
    /// engine reports it as a protocol error.
    fn recv(&mut self, protocol: u8, com_id: u16, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Channel assigned by discovery, if any.
    fn channel(&self) -> Option<Channel>;

    /// Record the channel discovery selected.
    fn assign_channel(&mut self, channel: Channel);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, protocol: u8, com_id: u16, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(protocol, com_id, payload)
    }

    fn recv(&mut self, protocol: u8, com_id: u16, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).recv(protocol, com_id, buf)
    }

    fn channel(&self) -> Option<Channel> {
        (**self).channel()
    }

    fn assign_channel(&mut self, channel: Channel) {
        (**self).assign_channel(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_com_id_is_upper_half() {
        let channel = Channel { extended_com_id: 0x07FE_0000, ssc: Ssc::Enterprise };
        assert_eq!(channel.com_id(), 0x07FE);
    }
}
