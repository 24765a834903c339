//! Byte-exact device replies.
//!
//! [`ResponseBuilder`] frames replies the way a TPer does: the three headers
//! addressed to the ComID and session under test, a token stream, and zero
//! padding. Every builder goes through the same [`PayloadWriter`] the engine
//! uses, so header layout cannot drift between the two sides.

use tcg_proto::{
    FrameScope, Method, ParameterList, PayloadWriter, SessionIds, Ssc, Token, Uid, discovery::SessionLimits,
    frame::COM_PACKET_HEADER_LEN,
};

/// Room for any reply a test builds.
const REPLY_CAPACITY: usize = 4096;

/// A ComPacket with zero length and nothing outstanding: "still working".
pub fn pending_com_packet(extended_com_id: u32) -> Vec<u8> {
    com_packet_header(extended_com_id, 0, 0, 0)
}

/// Just a ComPacket header with the given fields.
pub fn com_packet_header(extended_com_id: u32, outstanding: u32, min_transfer: u32, length: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(COM_PACKET_HEADER_LEN);
    for field in [0, extended_com_id, outstanding, min_transfer, length] {
        header.extend_from_slice(&field.to_be_bytes());
    }
    header
}

/// Builds TPer replies for one ComID and session.
#[derive(Debug, Clone, Copy)]
pub struct ResponseBuilder {
    extended_com_id: u32,
    ssc: Ssc,
    session: SessionIds,
}

impl ResponseBuilder {
    /// Replies addressed to the session manager on `extended_com_id`.
    pub fn new(extended_com_id: u32, ssc: Ssc) -> Self {
        Self { extended_com_id, ssc, session: SessionIds::SESSION_MANAGER }
    }

    /// Same builder, addressed to the session with `ids`.
    pub fn in_session(self, ids: SessionIds) -> Self {
        Self { session: ids, ..self }
    }

    /// Same builder, addressed as `scope` dictates.
    pub fn in_scope(self, scope: FrameScope) -> Self {
        self.in_session(scope.expected())
    }

    /// Frame an arbitrary token stream.
    pub fn frame(&self, body: impl FnOnce(&mut PayloadWriter) -> tcg_proto::Result<()>) -> tcg_proto::Result<Vec<u8>> {
        let mut writer = PayloadWriter::new(REPLY_CAPACITY);
        writer.begin_frame(self.extended_com_id, self.session, 0)?;
        body(&mut writer)?;
        writer.finalize()?;
        Ok(writer.as_slice().to_vec())
    }

    /// `[ results ] EndOfData [ status 0 0 ]`.
    pub fn method(&self, results: &ParameterList, status: u64) -> tcg_proto::Result<Vec<u8>> {
        self.method_with_footer(results, [status, 0, 0])
    }

    /// Method reply with every status footer field chosen by the caller.
    pub fn method_with_footer(&self, results: &ParameterList, footer: [u64; 3]) -> tcg_proto::Result<Vec<u8>> {
        self.frame(|writer| {
            put_results(writer, results)?;
            put_footer(writer, footer)
        })
    }

    /// Session manager reply: `Call SMUID method [ results ] EndOfData
    /// [ status 0 0 ]`.
    pub fn session_manager(&self, method: Method, results: &ParameterList, status: u64) -> tcg_proto::Result<Vec<u8>> {
        let method = method.uid(self.ssc);
        self.frame(|writer| {
            writer.put_call(Uid::SESSION_MANAGER, method)?;
            put_results(writer, results)?;
            put_footer(writer, [status, 0, 0])
        })
    }

    /// SyncSession carrying the echoed host id and the assigned TPer id.
    pub fn sync_session(&self, host_session_id: u64, tper_session_id: u64) -> tcg_proto::Result<Vec<u8>> {
        let mut results = ParameterList::new();
        results.push_int(host_session_id)?;
        results.push_int(tper_session_id)?;
        self.session_manager(Method::SyncSession, &results, 0)
    }

    /// Properties reply listing `limits` by name.
    pub fn properties(&self, limits: &SessionLimits) -> tcg_proto::Result<Vec<u8>> {
        let mut results = ParameterList::new();
        results.push_start_list()?;
        for (name, value) in [
            ("MaxComPacketSize", limits.max_com_packet_size),
            ("MaxResponseComPacketSize", limits.max_response_com_packet_size),
            ("MaxPacketSize", limits.max_packet_size),
            ("MaxAuthentications", limits.max_authentications),
            ("DefSessionTimeout", limits.default_session_timeout),
            ("MaxSessionTimeout", limits.max_session_timeout),
            ("MinSessionTimeout", limits.min_session_timeout),
        ] {
            results.push_named_int(name, value)?;
        }
        results.push_end_list()?;
        self.session_manager(Method::Properties, &results, 0)
    }

    /// Get reply holding one row of cells.
    pub fn row(&self, cells: &ParameterList) -> tcg_proto::Result<Vec<u8>> {
        let mut results = ParameterList::new();
        results.push_start_list()?;
        for slot in cells.slots() {
            results.push(slot.clone())?;
        }
        results.push_end_list()?;
        self.method(&results, 0)
    }

    /// Authenticate reply: `[ success ]`.
    pub fn authenticated(&self, success: bool) -> tcg_proto::Result<Vec<u8>> {
        let mut results = ParameterList::new();
        results.push_int(u64::from(success))?;
        self.method(&results, 0)
    }

    /// Successful method with no results.
    pub fn ok(&self) -> tcg_proto::Result<Vec<u8>> {
        self.method(&ParameterList::new(), 0)
    }

    /// Method failed with `status`, no results.
    pub fn failed(&self, status: u64) -> tcg_proto::Result<Vec<u8>> {
        self.method(&ParameterList::new(), status)
    }

    /// CloseSession confirmation.
    pub fn end_of_session(&self) -> tcg_proto::Result<Vec<u8>> {
        self.frame(|writer| writer.put_token(Token::EndOfSession))
    }

    /// Transaction acknowledgement: `token value`.
    pub fn transaction(&self, token: Token, value: u64) -> tcg_proto::Result<Vec<u8>> {
        self.frame(|writer| {
            writer.put_token(token)?;
            writer.put_uint(value)
        })
    }

    /// Empty ComPacket: the TPer is still working.
    pub fn pending(&self) -> Vec<u8> {
        pending_com_packet(self.extended_com_id)
    }

    /// Empty ComPacket announcing `outstanding` bytes the host cannot take.
    pub fn too_large(&self, outstanding: u32) -> Vec<u8> {
        com_packet_header(self.extended_com_id, outstanding, outstanding, 0)
    }
}

fn put_results(writer: &mut PayloadWriter, results: &ParameterList) -> tcg_proto::Result<()> {
    writer.put_token(Token::StartList)?;
    writer.put_parameters(results)?;
    writer.put_token(Token::EndList)?;
    writer.put_token(Token::EndOfData)
}

fn put_footer(writer: &mut PayloadWriter, footer: [u64; 3]) -> tcg_proto::Result<()> {
    writer.put_token(Token::StartList)?;
    for field in footer {
        writer.put_uint(field)?;
    }
    writer.put_token(Token::EndList)
}

/// Stack reset reply with `available` bytes of status.
///
/// `status` is appended only when `available` is 4.
pub fn stack_reset_reply(extended_com_id: u32, request_code: u32, available: u16, status: u32) -> Vec<u8> {
    let mut reply = Vec::with_capacity(16);
    reply.extend_from_slice(&extended_com_id.to_be_bytes());
    reply.extend_from_slice(&request_code.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    reply.extend_from_slice(&available.to_be_bytes());
    if available == 4 {
        reply.extend_from_slice(&status.to_be_bytes());
    }
    reply
}
