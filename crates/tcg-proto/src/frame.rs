//! Payload framing.
//!
//! Every method call and response travels inside three nested frames:
//!
//! ```text
//! +------------------------------------------+
//! | ComPacket header (20 bytes)              |
//! |  +-------------------------------------+ |
//! |  | Packet header (24 bytes)            | |
//! |  |  +--------------------------------+ | |
//! |  |  | SubPacket header (12 bytes)    | | |
//! |  |  | token stream ...               | | |
//! |  |  +--------------------------------+ | |
//! |  |  zero padding to 4-byte boundary    | |
//! |  +-------------------------------------+ |
//! +------------------------------------------+
//! ```
//!
//! Each header ends with a 32-bit big-endian length covering everything after
//! it up to the end of its frame (the SubPacket length excludes padding). The
//! lengths are unknown while the body is written, so [`PayloadWriter`]
//! records their offsets and backpatches them in [`PayloadWriter::finalize`].
//!
//! On receive, [`ReceivedFrame::parse`] validates the three headers against
//! each other and against the channel, then hands out the body.
//!
//! Only one Packet per ComPacket and one SubPacket per Packet is supported.
//! Anything else is rejected as a length mismatch.

use bytes::{BufMut, BytesMut};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32},
};

use crate::{
    errors::{ProtocolError, Result},
    params::{ByteValue, ParameterList, Slot},
    token::{Atom, AtomHeader, AtomKind, Token, encode_bytes_header, encode_uint},
    uid::Uid,
};

/// Security protocol carrying method calls and Level 0 Discovery.
pub const PROTOCOL_METHODS: u8 = 0x01;
/// Security protocol for ComID management (stack reset, TPer reset).
pub const PROTOCOL_COM_ID_MANAGEMENT: u8 = 0x02;
/// ComID used to fetch Level 0 Discovery data.
pub const LEVEL0_DISCOVERY_COM_ID: u16 = 0x0001;
/// ComID used for a TPer reset.
pub const TPER_RESET_COM_ID: u16 = 0x0004;

/// ComPacket header length.
pub const COM_PACKET_HEADER_LEN: usize = 20;
/// Packet header length.
pub const PACKET_HEADER_LEN: usize = 24;
/// SubPacket header length.
pub const SUB_PACKET_HEADER_LEN: usize = 12;
/// Offset of the token stream inside a frame.
pub const FRAME_HEADER_LEN: usize = COM_PACKET_HEADER_LEN + PACKET_HEADER_LEN + SUB_PACKET_HEADER_LEN;

/// Short (16-bit) ComID carried in an extended ComID.
pub const fn short_com_id(extended: u32) -> u16 {
    (extended >> 16) as u16
}

/// ComPacket header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ComPacketHeader {
    reserved: U32,
    extended_com_id: U32,
    outstanding_data: U32,
    min_transfer: U32,
    length: U32,
}

impl ComPacketHeader {
    /// Header with the given fields.
    pub fn new(extended_com_id: u32, outstanding_data: u32, min_transfer: u32, length: u32) -> Self {
        Self {
            reserved: U32::ZERO,
            extended_com_id: U32::new(extended_com_id),
            outstanding_data: U32::new(outstanding_data),
            min_transfer: U32::new(min_transfer),
            length: U32::new(length),
        }
    }

    /// Read the header at the start of `data`.
    pub fn peek(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(header, _)| header)
            .map_err(|_| ProtocolError::BufferUnderrun { offset: 0, needed: COM_PACKET_HEADER_LEN })
    }

    /// Extended ComID.
    pub fn extended_com_id(&self) -> u32 {
        self.extended_com_id.get()
    }

    /// Bytes the TPer still holds for this ComID.
    pub fn outstanding_data(&self) -> u32 {
        self.outstanding_data.get()
    }

    /// Minimum transfer size the TPer needs to deliver its data.
    pub fn min_transfer(&self) -> u32 {
        self.min_transfer.get()
    }

    /// Bytes following this header.
    pub fn length(&self) -> u32 {
        self.length.get()
    }

    /// Classify a received header for the receive loop.
    pub fn flow(&self) -> Flow {
        match (self.length(), self.outstanding_data()) {
            (0, outstanding) if outstanding > 1 => Flow::BufferTooSmall { outstanding },
            (0, _) => Flow::Pending,
            _ => Flow::Ready,
        }
    }
}

/// What a received ComPacket header says about the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Response data is present
    Ready,
    /// TPer has not finished; receive again later
    Pending,
    /// Response does not fit the host's receive buffer
    BufferTooSmall {
        /// Bytes the TPer holds
        outstanding: u32,
    },
}

/// Narrow a session id to its 32-bit Packet header field.
pub fn session_id_field(id: u64) -> Result<u32> {
    u32::try_from(id).map_err(|_| ProtocolError::SessionIdTooWide(id))
}

/// Packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    tper_session_id: U32,
    host_session_id: U32,
    sequence_number: U32,
    reserved: U16,
    ack_type: U16,
    acknowledgement: U32,
    length: U32,
}

impl PacketHeader {
    /// Header for the given session, sequence number and length.
    ///
    /// # Errors
    /// [`ProtocolError::SessionIdTooWide`] when either id exceeds 32 bits.
    pub fn new(session: SessionIds, sequence_number: u32, length: u32) -> Result<Self> {
        Ok(Self {
            tper_session_id: U32::new(session_id_field(session.tper)?),
            host_session_id: U32::new(session_id_field(session.host)?),
            sequence_number: U32::new(sequence_number),
            reserved: U16::ZERO,
            ack_type: U16::ZERO,
            acknowledgement: U32::ZERO,
            length: U32::new(length),
        })
    }

    /// Session identifiers carried by this packet.
    pub fn session(&self) -> SessionIds {
        SessionIds {
            tper: u64::from(self.tper_session_id.get()),
            host: u64::from(self.host_session_id.get()),
        }
    }

    /// Sequence number.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number.get()
    }

    /// Bytes following this header.
    pub fn length(&self) -> u32 {
        self.length.get()
    }
}

/// SubPacket header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SubPacketHeader {
    reserved: [u8; 6],
    kind: U16,
    length: U32,
}

impl SubPacketHeader {
    /// Data SubPacket header.
    pub fn new(length: u32) -> Self {
        Self { reserved: [0; 6], kind: U16::ZERO, length: U32::new(length) }
    }

    /// SubPacket kind (0 = data).
    pub fn kind(&self) -> u16 {
        self.kind.get()
    }

    /// Token bytes following this header, excluding padding.
    pub fn length(&self) -> u32 {
        self.length.get()
    }
}

/// TPer and host session identifiers of a Packet.
///
/// Both zero addresses the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SessionIds {
    /// Assigned by the TPer in SyncSession
    pub tper: u64,
    /// Chosen by the host in StartSession
    pub host: u64,
}

impl SessionIds {
    /// Session-manager addressing.
    pub const SESSION_MANAGER: Self = Self { tper: 0, host: 0 };

    /// Whether these address the session manager.
    pub const fn is_session_manager(self) -> bool {
        self.tper == 0 && self.host == 0
    }
}

/// Which exchange a received frame must belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScope {
    /// Session manager call: both session ids zero
    SessionManager,
    /// Call inside an open session: ids must match
    Session(SessionIds),
}

impl FrameScope {
    /// Session ids a frame in this scope carries.
    pub const fn expected(self) -> SessionIds {
        match self {
            Self::SessionManager => SessionIds::SESSION_MANAGER,
            Self::Session(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LengthMarks {
    com_packet: usize,
    packet: usize,
    sub_packet: usize,
}

/// Bounded send buffer with deferred frame lengths.
///
/// # Encoding
///
/// ```text
/// reset() -> begin_frame() -> put_*()... -> finalize() -> as_slice()
/// ```
///
/// Every write checks capacity first and fails with
/// [`ProtocolError::BufferFull`] without writing a partial token.
#[derive(Debug, Clone)]
pub struct PayloadWriter {
    buf: BytesMut,
    capacity: usize,
    marks: Option<LengthMarks>,
}

impl PayloadWriter {
    /// Writer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity), capacity, marks: None }
    }

    /// Discard contents and pending length marks.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.marks = None;
    }

    /// Encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum bytes this writer accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reserve(&self, needed: usize) -> Result<()> {
        let remaining = self.capacity - self.buf.len();
        if needed > remaining {
            return Err(ProtocolError::BufferFull { needed, remaining });
        }
        Ok(())
    }

    /// Append raw bytes outside the token grammar.
    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Append a big-endian u32 outside the token grammar.
    pub fn put_raw_u32(&mut self, value: u32) -> Result<()> {
        self.put_raw(&value.to_be_bytes())
    }

    /// Write the three frame headers with zero lengths and remember where
    /// their lengths go.
    pub fn begin_frame(&mut self, extended_com_id: u32, session: SessionIds, sequence_number: u32) -> Result<()> {
        let packet = PacketHeader::new(session, sequence_number, 0)?;
        self.reserve(FRAME_HEADER_LEN)?;
        let start = self.buf.len();
        self.buf.put_slice(ComPacketHeader::new(extended_com_id, 0, 0, 0).as_bytes());
        self.buf.put_slice(packet.as_bytes());
        self.buf.put_slice(SubPacketHeader::new(0).as_bytes());
        self.marks = Some(LengthMarks {
            com_packet: start + COM_PACKET_HEADER_LEN - 4,
            packet: start + COM_PACKET_HEADER_LEN + PACKET_HEADER_LEN - 4,
            sub_packet: start + FRAME_HEADER_LEN - 4,
        });
        Ok(())
    }

    /// Append a control token.
    pub fn put_token(&mut self, token: Token) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(token.to_u8());
        Ok(())
    }

    /// Append an unsigned integer atom.
    pub fn put_uint(&mut self, value: u64) -> Result<()> {
        let mut atom = [0u8; 9];
        let len = encode_uint(value, &mut atom);
        self.put_raw(&atom[..len])
    }

    /// Append a byte-string atom.
    pub fn put_bytes(&mut self, value: &[u8]) -> Result<()> {
        let (header, header_len) = encode_bytes_header(value.len())?;
        self.reserve(header_len + value.len())?;
        self.buf.put_slice(&header[..header_len]);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Append a UID atom.
    pub fn put_uid(&mut self, uid: Uid) -> Result<()> {
        self.put_bytes(uid.as_bytes())
    }

    /// Append `Call, object, method`.
    pub fn put_call(&mut self, object: Uid, method: Uid) -> Result<()> {
        self.put_token(Token::Call)?;
        self.put_uid(object)?;
        self.put_uid(method)
    }

    /// Append every slot of a parameter list as tokens.
    pub fn put_parameters(&mut self, params: &ParameterList) -> Result<()> {
        for slot in params.slots() {
            match slot {
                Slot::Int(value) => self.put_uint(*value)?,
                Slot::Bytes(value) => self.put_bytes(value.as_slice())?,
                Slot::StartList => self.put_token(Token::StartList)?,
                Slot::EndList => self.put_token(Token::EndList)?,
                Slot::StartName => self.put_token(Token::StartName)?,
                Slot::EndName => self.put_token(Token::EndName)?,
            }
        }
        Ok(())
    }

    /// Append a status list: `StartList, status, 0, 0, EndList`.
    pub fn put_status(&mut self, status: u64) -> Result<()> {
        self.put_token(Token::StartList)?;
        self.put_uint(status)?;
        self.put_uint(0)?;
        self.put_uint(0)?;
        self.put_token(Token::EndList)
    }

    /// Pad to a 4-byte boundary and backpatch the three lengths.
    pub fn finalize(&mut self) -> Result<()> {
        let marks = self.marks.ok_or(ProtocolError::FrameNotStarted)?;
        let body_end = self.buf.len();
        let padding = (4 - body_end % 4) % 4;
        self.reserve(padding)?;
        self.buf.put_bytes(0, padding);
        let end = self.buf.len();

        self.patch(marks.sub_packet, body_end)?;
        self.patch(marks.packet, end)?;
        self.patch(marks.com_packet, end)?;
        self.marks = None;
        Ok(())
    }

    fn patch(&mut self, at: usize, frame_end: usize) -> Result<()> {
        let length = u32::try_from(frame_end - (at + 4))
            .map_err(|_| ProtocolError::BufferFull { needed: frame_end, remaining: 0 })?;
        self.buf[at..at + 4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }
}

/// One decoded item of a token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item<'a> {
    /// Control token
    Token(Token),
    /// Integer or byte string
    Atom(Atom<'a>),
}

/// Cursor over received bytes.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Reader positioned at the first byte of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether every byte has been consumed.
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len()).ok_or(
            ProtocolError::BufferUnderrun { offset: self.pos, needed: len },
        )?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read one raw byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a raw big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a raw big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a raw big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Skip `len` raw bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Next byte without consuming it.
    pub fn peek_byte(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Whether the next byte is `token`.
    pub fn peek_token(&self, token: Token) -> bool {
        self.peek_byte() == Some(token.to_u8())
    }

    /// Consume `token` or fail.
    pub fn expect_token(&mut self, token: Token) -> Result<()> {
        let found = self.peek_byte().ok_or(ProtocolError::BufferUnderrun { offset: self.pos, needed: 1 })?;
        if found != token.to_u8() {
            return Err(ProtocolError::UnexpectedToken { expected: token.name(), found });
        }
        self.pos += 1;
        Ok(())
    }

    /// Decode one atom.
    pub fn read_atom(&mut self) -> Result<Atom<'a>> {
        let first = self.peek_byte().ok_or(ProtocolError::BufferUnderrun { offset: self.pos, needed: 1 })?;
        let rest = &self.data[self.pos + 1..];
        let header = AtomHeader::decode(first, rest).map_err(|err| match err {
            ProtocolError::BufferUnderrun { needed, .. } => {
                ProtocolError::BufferUnderrun { offset: self.pos + 1, needed }
            },
            other => other,
        })?;
        self.pos += 1 + header.extra_header_bytes;

        if let Some(value) = header.tiny {
            return Ok(Atom::Integer(value));
        }

        let payload = self.take(header.len)?;
        match header.kind {
            AtomKind::Bytes => Ok(Atom::Bytes(payload)),
            AtomKind::Integer if payload.len() > 8 => Err(ProtocolError::IntegerTooWide(payload.len())),
            AtomKind::Integer => {
                Ok(Atom::Integer(payload.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))))
            },
        }
    }

    /// Decode the next token or atom.
    pub fn read_item(&mut self) -> Result<Item<'a>> {
        let first = self.peek_byte().ok_or(ProtocolError::BufferUnderrun { offset: self.pos, needed: 1 })?;
        if let Some(token) = Token::from_u8(first) {
            self.pos += 1;
            return Ok(Item::Token(token));
        }
        self.read_atom().map(Item::Atom)
    }

    /// Decode an integer atom.
    pub fn read_uint(&mut self) -> Result<u64> {
        let start = self.pos;
        match self.read_atom() {
            Ok(Atom::Integer(value)) => Ok(value),
            Ok(Atom::Bytes(_)) => {
                self.pos = start;
                Err(ProtocolError::UnexpectedToken { expected: "integer", found: self.data[start] })
            },
            Err(ProtocolError::InvalidTokenHeader(found)) => {
                Err(ProtocolError::UnexpectedToken { expected: "integer", found })
            },
            Err(err) => Err(err),
        }
    }

    /// Decode a byte-string atom.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        match self.read_atom() {
            Ok(Atom::Bytes(bytes)) => Ok(bytes),
            Ok(Atom::Integer(_)) => {
                self.pos = start;
                Err(ProtocolError::UnexpectedToken { expected: "byte string", found: self.data[start] })
            },
            Err(ProtocolError::InvalidTokenHeader(found)) => {
                Err(ProtocolError::UnexpectedToken { expected: "byte string", found })
            },
            Err(err) => Err(err),
        }
    }

    /// Decode a UID atom.
    pub fn read_uid(&mut self) -> Result<Uid> {
        Uid::from_slice(self.read_bytes()?)
    }

    /// Decode a UID atom and check it.
    pub fn expect_uid(&mut self, expected: Uid) -> Result<()> {
        let found = self.read_uid()?;
        if found != expected {
            return Err(ProtocolError::UidMismatch { expected, found });
        }
        Ok(())
    }

    /// Decode one parameter, recursing into lists and pairs, into `out`.
    pub fn read_parameter(&mut self, out: &mut ParameterList) -> Result<()> {
        match self.peek_byte().and_then(Token::from_u8) {
            Some(Token::StartList) => {
                self.pos += 1;
                out.push_start_list()?;
                while !self.peek_token(Token::EndList) {
                    self.read_parameter(out)?;
                }
                self.expect_token(Token::EndList)?;
                out.push_end_list()
            },
            Some(Token::StartName) => {
                self.pos += 1;
                out.push_start_name()?;
                while !self.peek_token(Token::EndName) {
                    self.read_parameter(out)?;
                }
                self.expect_token(Token::EndName)?;
                out.push_end_name()
            },
            Some(other) => Err(ProtocolError::UnexpectedToken { expected: "parameter", found: other.to_u8() }),
            None => match self.read_atom()? {
                Atom::Integer(value) => out.push_int(value),
                Atom::Bytes(bytes) => out.push_bytes(ByteValue::from_slice(bytes)?),
            },
        }
    }

    /// Decode a status list and return its status code.
    ///
    /// The two reserved fields must be zero.
    pub fn read_status(&mut self) -> Result<u64> {
        self.expect_token(Token::StartList)?;
        let status = self.read_uint()?;
        for field in ["first reserved field", "second reserved field"] {
            let value = self.read_uint()?;
            if value != 0 {
                return Err(ProtocolError::MalformedStatus { field, value });
            }
        }
        self.expect_token(Token::EndList)?;
        Ok(status)
    }
}

/// A validated frame borrowing its body from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedFrame<'a> {
    /// ComPacket header
    pub com_packet: ComPacketHeader,
    /// Packet header
    pub packet: PacketHeader,
    /// SubPacket header
    pub sub_packet: SubPacketHeader,
    body: &'a [u8],
}

impl<'a> ReceivedFrame<'a> {
    /// Validate the three headers in `data`.
    ///
    /// Bytes past the ComPacket length are ignored, since some transports
    /// deliver whole blocks.
    pub fn parse(data: &'a [u8], expected_com_id: u32, scope: FrameScope) -> Result<Self> {
        let com_packet = ComPacketHeader::peek(data)?;
        if com_packet.extended_com_id() != expected_com_id {
            return Err(ProtocolError::ComIdMismatch {
                expected: expected_com_id,
                found: com_packet.extended_com_id(),
            });
        }

        let com_end = COM_PACKET_HEADER_LEN + com_packet.length() as usize;
        if com_end > data.len() {
            return Err(ProtocolError::FrameLength {
                frame: "ComPacket",
                declared: com_packet.length(),
                reason: "exceeds received data",
            });
        }
        let data = &data[..com_end];

        let (packet, _) = PacketHeader::read_from_prefix(&data[COM_PACKET_HEADER_LEN..]).map_err(|_| {
            ProtocolError::FrameLength {
                frame: "ComPacket",
                declared: com_packet.length(),
                reason: "too short for a Packet header",
            }
        })?;
        let packet_end = COM_PACKET_HEADER_LEN + PACKET_HEADER_LEN + packet.length() as usize;
        if packet_end != com_end {
            return Err(ProtocolError::FrameLength {
                frame: "Packet",
                declared: packet.length(),
                reason: if packet_end < com_end {
                    "multiple Packets per ComPacket are unsupported"
                } else {
                    "exceeds ComPacket"
                },
            });
        }

        let sub_start = COM_PACKET_HEADER_LEN + PACKET_HEADER_LEN;
        let (sub_packet, _) = SubPacketHeader::read_from_prefix(&data[sub_start..]).map_err(|_| {
            ProtocolError::FrameLength {
                frame: "Packet",
                declared: packet.length(),
                reason: "too short for a SubPacket header",
            }
        })?;
        let sub_len = sub_packet.length() as usize;
        let sub_end = FRAME_HEADER_LEN + sub_len;
        let padded_end = sub_end + (4 - sub_len % 4) % 4;
        if sub_end != packet_end && padded_end != packet_end {
            return Err(ProtocolError::FrameLength {
                frame: "SubPacket",
                declared: sub_packet.length(),
                reason: if sub_end > packet_end {
                    "exceeds Packet"
                } else {
                    "multiple SubPackets per Packet are unsupported"
                },
            });
        }
        if let Some(&byte) = data[sub_end..packet_end].iter().find(|&&byte| byte != 0) {
            return Err(ProtocolError::NonZeroPadding(byte));
        }

        let expected = scope.expected();
        let found = packet.session();
        if found != expected {
            return Err(ProtocolError::SessionMismatch {
                expected_tper: expected.tper,
                expected_host: expected.host,
                tper: found.tper,
                host: found.host,
            });
        }

        Ok(Self { com_packet, packet, sub_packet, body: &data[FRAME_HEADER_LEN..sub_end] })
    }

    /// Token stream inside the SubPacket.
    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Reader over the token stream.
    pub fn reader(&self) -> PayloadReader<'a> {
        PayloadReader::new(self.body)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    const COM_ID: u32 = 0x07FE_0000;

    fn frame_with_body(body: &[u8], session: SessionIds) -> Vec<u8> {
        let mut writer = PayloadWriter::new(1536);
        writer.begin_frame(COM_ID, session, 1).unwrap();
        writer.put_raw(body).unwrap();
        writer.finalize().unwrap();
        writer.as_slice().to_vec()
    }

    #[test]
    fn header_sizes() {
        assert_eq!(size_of::<ComPacketHeader>(), COM_PACKET_HEADER_LEN);
        assert_eq!(size_of::<PacketHeader>(), PACKET_HEADER_LEN);
        assert_eq!(size_of::<SubPacketHeader>(), SUB_PACKET_HEADER_LEN);
    }

    #[test]
    fn finalize_backpatches_lengths_and_pads() {
        let frame = frame_with_body(&[0xF9], SessionIds::SESSION_MANAGER);

        assert_eq!(frame.len(), 60);
        assert_eq!(
            frame,
            hex!(
                "00000000 07FE0000 00000000 00000000 00000028"
                "00000000 00000000 00000001 0000 0000 00000000 00000010"
                "000000000000 0000 00000001"
                "F9000000"
            )
        );
    }

    #[test]
    fn aligned_body_has_no_padding() {
        let frame = frame_with_body(&[1, 2, 3, 4], SessionIds::SESSION_MANAGER);
        assert_eq!(frame.len(), 60);
        let parsed = ReceivedFrame::parse(&frame, COM_ID, FrameScope::SessionManager).unwrap();
        assert_eq!(parsed.sub_packet.length(), 4);
        assert_eq!(parsed.body(), [1, 2, 3, 4]);
    }

    #[test]
    fn finalize_without_frame_fails() {
        let mut writer = PayloadWriter::new(64);
        assert_eq!(writer.finalize(), Err(ProtocolError::FrameNotStarted));
    }

    #[test]
    fn writer_refuses_overflow_without_partial_write() {
        let mut writer = PayloadWriter::new(FRAME_HEADER_LEN + 4);
        writer.begin_frame(COM_ID, SessionIds::SESSION_MANAGER, 1).unwrap();
        assert_eq!(writer.put_bytes(&[0u8; 8]), Err(ProtocolError::BufferFull { needed: 9, remaining: 4 }));
        assert_eq!(writer.len(), FRAME_HEADER_LEN);
        assert_eq!(
            writer.put_bytes(&[0u8; 2048]),
            Err(ProtocolError::ValueTooLarge { len: 2048, max: 2047 })
        );
    }

    #[test]
    fn trailing_transport_bytes_are_trimmed() {
        let mut frame = frame_with_body(&[0xF9], SessionIds::SESSION_MANAGER);
        frame.extend_from_slice(&[0xAA; 452]);
        let parsed = ReceivedFrame::parse(&frame, COM_ID, FrameScope::SessionManager).unwrap();
        assert_eq!(parsed.body(), [0xF9]);
    }

    #[test]
    fn wrong_com_id_is_rejected() {
        let frame = frame_with_body(&[0xF9], SessionIds::SESSION_MANAGER);
        assert_eq!(
            ReceivedFrame::parse(&frame, 0x0800_0000, FrameScope::SessionManager).unwrap_err(),
            ProtocolError::ComIdMismatch { expected: 0x0800_0000, found: COM_ID }
        );
    }

    #[test]
    fn truncated_com_packet_is_rejected() {
        let frame = frame_with_body(&[0xF9], SessionIds::SESSION_MANAGER);
        let err = ReceivedFrame::parse(&frame[..58], COM_ID, FrameScope::SessionManager).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameLength { frame: "ComPacket", .. }));
    }

    #[test]
    fn packet_shorter_than_com_packet_is_rejected() {
        let mut frame = frame_with_body(&[1, 2, 3, 4, 5, 6, 7, 8], SessionIds::SESSION_MANAGER);
        // Packet length 0x14 -> 0x10
        frame[43] = 0x10;
        let err = ReceivedFrame::parse(&frame, COM_ID, FrameScope::SessionManager).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameLength { frame: "Packet", .. }));
    }

    #[test]
    fn sub_packet_padding_beyond_three_bytes_is_rejected() {
        let mut frame = frame_with_body(&[1, 2, 3, 4, 5, 6, 7, 8], SessionIds::SESSION_MANAGER);
        // SubPacket length 8 -> 4 leaves four unexplained bytes
        frame[55] = 4;
        let err = ReceivedFrame::parse(&frame, COM_ID, FrameScope::SessionManager).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameLength { frame: "SubPacket", .. }));
    }

    #[test]
    fn sub_packet_padding_must_be_zero() {
        let mut frame = frame_with_body(&[0xF9], SessionIds::SESSION_MANAGER);
        frame[58] = 0xAA;
        assert_eq!(
            ReceivedFrame::parse(&frame, COM_ID, FrameScope::SessionManager).unwrap_err(),
            ProtocolError::NonZeroPadding(0xAA)
        );
    }

    #[test]
    fn wide_session_ids_do_not_fit_a_packet() {
        let mut writer = PayloadWriter::new(1536);
        let wide = SessionIds { tper: 0x1_0000_0001, host: 100 };

        assert_eq!(writer.begin_frame(COM_ID, wide, 1), Err(ProtocolError::SessionIdTooWide(0x1_0000_0001)));
        assert!(writer.is_empty());
        assert_eq!(session_id_field(u64::from(u32::MAX)), Ok(u32::MAX));
    }

    #[test]
    fn session_scope_is_enforced() {
        let open = SessionIds { tper: 0x1001, host: 100 };
        let frame = frame_with_body(&[0xF9], open);

        assert!(ReceivedFrame::parse(&frame, COM_ID, FrameScope::Session(open)).is_ok());
        assert_eq!(
            ReceivedFrame::parse(&frame, COM_ID, FrameScope::SessionManager).unwrap_err(),
            ProtocolError::SessionMismatch { expected_tper: 0, expected_host: 0, tper: 0x1001, host: 100 }
        );
        let other = SessionIds { tper: 0x1001, host: 101 };
        assert!(ReceivedFrame::parse(&frame, COM_ID, FrameScope::Session(other)).is_err());
    }

    #[test]
    fn flow_classification() {
        assert_eq!(ComPacketHeader::new(COM_ID, 0, 0, 0).flow(), Flow::Pending);
        assert_eq!(ComPacketHeader::new(COM_ID, 1, 0, 0).flow(), Flow::Pending);
        assert_eq!(
            ComPacketHeader::new(COM_ID, 2, 0, 0).flow(),
            Flow::BufferTooSmall { outstanding: 2 }
        );
        assert_eq!(ComPacketHeader::new(COM_ID, 0, 0, 40).flow(), Flow::Ready);
    }

    #[test]
    fn reader_decodes_atoms() {
        let data = hex!("05 84 00001000 A3 616263 D0 10 00112233445566778899AABBCCDDEEFF 88 FFFFFFFFFFFFFFFF");
        let mut reader = PayloadReader::new(&data);
        assert_eq!(reader.read_uint().unwrap(), 5);
        assert_eq!(reader.read_uint().unwrap(), 0x1000);
        assert_eq!(reader.read_bytes().unwrap(), b"abc");
        assert_eq!(reader.read_bytes().unwrap().len(), 16);
        assert_eq!(reader.read_uint().unwrap(), u64::MAX);
        assert!(reader.is_at_end());
    }

    #[test]
    fn reader_reports_wrong_kind() {
        let data = hex!("A1 41");
        let mut reader = PayloadReader::new(&data);
        assert_eq!(reader.read_uint(), Err(ProtocolError::UnexpectedToken { expected: "integer", found: 0xA1 }));
        assert_eq!(reader.position(), 0);

        let mut reader = PayloadReader::new(&[0xF1]);
        assert_eq!(reader.read_uint(), Err(ProtocolError::UnexpectedToken { expected: "integer", found: 0xF1 }));
    }

    #[test]
    fn reader_rejects_wide_integers() {
        let data = hex!("89 010203040506070809");
        let mut reader = PayloadReader::new(&data);
        assert_eq!(reader.read_uint(), Err(ProtocolError::IntegerTooWide(9)));
    }

    #[test]
    fn expect_uid_checks_value() {
        let data = hex!("A8 00000000000000FF A8 0000000000000001");
        let mut reader = PayloadReader::new(&data);
        reader.expect_uid(Uid::SESSION_MANAGER).unwrap();
        assert_eq!(
            reader.expect_uid(Uid::SESSION_MANAGER),
            Err(ProtocolError::UidMismatch { expected: Uid::SESSION_MANAGER, found: Uid::THIS_SP })
        );
    }

    #[test]
    fn status_list_decoding() {
        assert_eq!(PayloadReader::new(&hex!("F0 00 00 00 F1")).read_status(), Ok(0));
        assert_eq!(PayloadReader::new(&hex!("F0 05 00 00 F1")).read_status(), Ok(5));
        assert_eq!(
            PayloadReader::new(&hex!("F0 00 01 00 F1")).read_status(),
            Err(ProtocolError::MalformedStatus { field: "first reserved field", value: 1 })
        );
        assert_eq!(
            PayloadReader::new(&hex!("F0 00 00 01 F1")).read_status(),
            Err(ProtocolError::MalformedStatus { field: "second reserved field", value: 1 })
        );
    }

    #[test]
    fn nested_parameters_decode_into_slots() {
        let data = hex!("F0 F2 03 A4 70696E31 F3 F2 09 F0 00 03 F1 F3 F1");
        let mut reader = PayloadReader::new(&data);
        let mut out = ParameterList::new();
        reader.read_parameter(&mut out).unwrap();

        assert!(reader.is_at_end());
        assert_eq!(out.len(), 13);
        assert_eq!(out.get_id_bytes(3).unwrap().as_slice(), b"pin1");
        assert_eq!(out.get_column_int_list(crate::uid::Ssc::Opal, crate::columns::LOCK_ON_RESET).unwrap(), [0, 3]);
    }

    #[test]
    fn truncated_list_is_an_underrun() {
        let mut reader = PayloadReader::new(&hex!("F0 01 02"));
        let mut out = ParameterList::new();
        assert!(matches!(reader.read_parameter(&mut out), Err(ProtocolError::BufferUnderrun { .. })));
    }

    fn arb_slot_tree() -> impl Strategy<Value = Vec<Slot>> {
        let leaf = prop_oneof![
            any::<u64>().prop_map(|v| vec![Slot::Int(v)]),
            prop::collection::vec(any::<u8>(), 0..40)
                .prop_map(|b| vec![Slot::Bytes(ByteValue::from_slice(&b).unwrap())]),
        ];
        leaf.prop_recursive(3, 40, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(|children| {
                    let mut slots = vec![Slot::StartList];
                    slots.extend(children.into_iter().flatten());
                    slots.push(Slot::EndList);
                    slots
                }),
                (any::<u64>(), inner).prop_map(|(key, value)| {
                    let mut slots = vec![Slot::StartName, Slot::Int(key)];
                    slots.extend(value);
                    slots.push(Slot::EndName);
                    slots
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn parameters_survive_the_wire(tree in arb_slot_tree()) {
            let mut params = ParameterList::with_capacity(400);
            for slot in &tree {
                params.push(slot.clone()).unwrap();
            }

            let mut writer = PayloadWriter::new(64 * 1024);
            writer.begin_frame(COM_ID, SessionIds::SESSION_MANAGER, 1).unwrap();
            writer.put_parameters(&params).unwrap();
            writer.finalize().unwrap();

            let frame = ReceivedFrame::parse(writer.as_slice(), COM_ID, FrameScope::SessionManager).unwrap();
            let mut reader = frame.reader();
            let mut decoded = ParameterList::with_capacity(400);
            reader.read_parameter(&mut decoded).unwrap();

            prop_assert!(reader.is_at_end());
            prop_assert_eq!(decoded.slots(), params.slots());
        }

        #[test]
        fn frame_lengths_round_trip(body_len in 0usize..200) {
            let body = vec![0x01u8; body_len];
            let mut writer = PayloadWriter::new(1536);
            writer.begin_frame(COM_ID, SessionIds::SESSION_MANAGER, 1).unwrap();
            writer.put_raw(&body).unwrap();
            writer.finalize().unwrap();

            let padded = body_len.div_ceil(4) * 4;
            prop_assert_eq!(writer.len(), FRAME_HEADER_LEN + padded);

            let frame = ReceivedFrame::parse(writer.as_slice(), COM_ID, FrameScope::SessionManager).unwrap();
            prop_assert_eq!(frame.sub_packet.length() as usize, body_len);
            prop_assert_eq!(frame.packet.length() as usize, SUB_PACKET_HEADER_LEN + padded);
            prop_assert_eq!(frame.com_packet.length() as usize, PACKET_HEADER_LEN + SUB_PACKET_HEADER_LEN + padded);
            prop_assert_eq!(frame.body(), body.as_slice());
        }
    }
}
