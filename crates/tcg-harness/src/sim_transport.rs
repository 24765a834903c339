//! Scripted transport.
//!
//! [`FakeTransport`] plays back a queue of device replies, one per receive,
//! and records every send. An empty queue fails the receive with a device
//! error, so a test that scripts too few replies fails loudly rather than
//! hanging.
//!
//! With a [`PendingInjector`] attached, method-protocol receives are preceded
//! by seeded runs of empty "pending" ComPackets before the scripted reply is
//! delivered. Level 0 Discovery and ComID management traffic is never
//! delayed.

use std::collections::VecDeque;

use tcg_core::transport::{Channel, Transport, TransportError};
use tcg_proto::frame::{LEVEL0_DISCOVERY_COM_ID, PROTOCOL_METHODS};
use tracing::trace;

use crate::{fault::PendingInjector, response::pending_com_packet};

/// One recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    /// Security protocol
    pub protocol: u8,
    /// ComID of the IF-SEND
    pub com_id: u16,
    /// Bytes sent
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Reply {
    Data(Vec<u8>),
    Failure(String),
}

/// Transport replaying scripted replies.
#[derive(Debug, Default)]
pub struct FakeTransport {
    replies: VecDeque<Reply>,
    sent: Vec<SentPacket>,
    receives: Vec<(u8, u16)>,
    channel: Option<Channel>,
    injector: Option<PendingInjector>,
    pending_left: Option<u32>,
}

impl FakeTransport {
    /// Transport with an empty script and no channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport already assigned `channel`, as if discovery had run.
    pub fn with_channel(channel: Channel) -> Self {
        Self { channel: Some(channel), ..Self::default() }
    }

    /// Attach a pending-answer injector.
    pub fn with_pending_faults(mut self, injector: PendingInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Queue a reply.
    pub fn push_reply(&mut self, reply: impl Into<Vec<u8>>) -> &mut Self {
        self.replies.push_back(Reply::Data(reply.into()));
        self
    }

    /// Queue a receive that fails with a device error.
    pub fn push_failure(&mut self, message: impl Into<String>) -> &mut Self {
        self.replies.push_back(Reply::Failure(message.into()));
        self
    }

    /// Every send so far.
    pub fn sent(&self) -> &[SentPacket] {
        &self.sent
    }

    /// Last send, if any.
    pub fn last_sent(&self) -> Option<&SentPacket> {
        self.sent.last()
    }

    /// Protocol and ComID of every receive so far, injected ones included.
    pub fn receives(&self) -> &[(u8, u16)] {
        &self.receives
    }

    /// Replies not yet delivered.
    pub fn remaining_replies(&self) -> usize {
        self.replies.len()
    }

    /// Attached injector.
    pub fn injector(&self) -> Option<&PendingInjector> {
        self.injector.as_ref()
    }

    fn take_injected_pending(&mut self, protocol: u8, com_id: u16) -> bool {
        if protocol != PROTOCOL_METHODS || com_id == LEVEL0_DISCOVERY_COM_ID {
            return false;
        }
        let Some(injector) = self.injector.as_mut() else {
            return false;
        };

        let left = self.pending_left.get_or_insert_with(|| injector.next_run());
        if *left == 0 {
            self.pending_left = None;
            return false;
        }
        *left -= 1;
        true
    }
}

impl Transport for FakeTransport {
    fn send(&mut self, protocol: u8, com_id: u16, payload: &[u8]) -> Result<(), TransportError> {
        trace!(protocol, com_id, len = payload.len(), "fake send");
        self.sent.push(SentPacket { protocol, com_id, payload: payload.to_vec() });
        Ok(())
    }

    fn recv(&mut self, protocol: u8, com_id: u16, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.receives.push((protocol, com_id));

        let data = if self.take_injected_pending(protocol, com_id) {
            trace!(protocol, com_id, "fake receive: injected pending");
            pending_com_packet(u32::from(com_id) << 16)
        } else {
            match self.replies.pop_front() {
                Some(Reply::Data(data)) => data,
                Some(Reply::Failure(message)) => return Err(TransportError::Device(message)),
                None => return Err(TransportError::Device("no scripted reply".to_owned())),
            }
        };

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        trace!(protocol, com_id, len, "fake receive");
        Ok(len)
    }

    fn channel(&self) -> Option<Channel> {
        self.channel
    }

    fn assign_channel(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }
}

#[cfg(test)]
mod tests {
    use tcg_proto::Ssc;

    use super::*;

    #[test]
    fn plays_back_in_order() {
        let mut transport = FakeTransport::new();
        transport.push_reply([1, 2, 3]).push_failure("unplugged");

        let mut buf = [0u8; 8];
        assert_eq!(transport.recv(1, 0x07FE, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], [1, 2, 3]);
        assert!(matches!(transport.recv(1, 0x07FE, &mut buf), Err(TransportError::Device(m)) if m == "unplugged"));
        assert!(transport.recv(1, 0x07FE, &mut buf).is_err());
        assert_eq!(transport.receives().len(), 3);
    }

    #[test]
    fn records_sends_and_channel() {
        let channel = Channel { extended_com_id: 0x0FFE_0000, ssc: Ssc::Opal };
        let mut transport = FakeTransport::new();
        assert_eq!(transport.channel(), None);
        transport.assign_channel(channel);
        transport.send(2, 0x0FFE, &[9, 9]).unwrap();

        assert_eq!(transport.channel(), Some(channel));
        assert_eq!(transport.last_sent(), Some(&SentPacket { protocol: 2, com_id: 0x0FFE, payload: vec![9, 9] }));
    }

    #[test]
    fn injected_pending_precedes_reply() {
        let mut transport = FakeTransport::new().with_pending_faults(PendingInjector::new(3, 1.0, 2));
        transport.push_reply(vec![0xAA; 24]);

        let mut buf = [0u8; 64];
        let mut pending = 0;
        loop {
            let len = transport.recv(PROTOCOL_METHODS, 0x07FE, &mut buf).unwrap();
            if buf[..len] == [0xAA; 24] {
                break;
            }
            pending += 1;
        }
        assert!((1..=2).contains(&pending));
        assert_eq!(transport.injector().unwrap().injected(), pending);
    }

    #[test]
    fn discovery_is_never_delayed() {
        let mut transport = FakeTransport::new().with_pending_faults(PendingInjector::new(3, 1.0, 5));
        transport.push_reply([7]);

        let mut buf = [0u8; 4];
        assert_eq!(transport.recv(PROTOCOL_METHODS, LEVEL0_DISCOVERY_COM_ID, &mut buf).unwrap(), 1);
    }
}
