//! Protocol engine.
//!
//! [`Engine`] owns one transport, the session state for it, and the scratch
//! buffers every exchange reuses: the send buffer, the receive buffer and two
//! parameter lists (arguments and results). Each operation borrows them for
//! its duration; nothing is shared between engines.
//!
//! # Exchange
//!
//! ```text
//! ┌──────┐ encode ┌─────────┐ send ┌──────────────────┐ ready ┌──────────┐
//! │ Idle │───────>│ Sending │─────>│ AwaitingResponse │──────>│ Decoding │──> Idle
//! └──────┘        └─────────┘      └──────────────────┘       └──────────┘
//!                                     │          ^
//!                            pending  │          │ delay
//!                                     v          │
//!                                  ┌────────────────┐  budget spent
//!                                  │   RetryDelay   │──────────────> Failed
//!                                  └────────────────┘
//! ```
//!
//! Only a ComPacket with zero length and at most one byte outstanding is
//! retried. Any other outcome leaves the loop at once.
//!
//! Session-level operations (StartSession, CloseSession, Properties, stack
//! and TPer reset) live here. Table methods are in [`crate::methods`],
//! transactions in [`crate::transaction`].

use tcg_proto::{
    DiscoveredCapabilities, FrameScope, Method, ParameterList, PayloadReader, PayloadWriter, ReceivedFrame,
    SecurityProvider, Ssc, Token, Uid,
    discovery::SessionLimits,
    frame::{
        ComPacketHeader, Flow, LEVEL0_DISCOVERY_COM_ID, PROTOCOL_COM_ID_MANAGEMENT, PROTOCOL_METHODS,
        TPER_RESET_COM_ID, session_id_field, short_com_id,
    },
};
use tracing::{debug, trace, warn};

use crate::{
    config::EngineConfig,
    env::Environment,
    error::{StackResetError, TcgError, UsageError},
    session::{Session, SessionState},
    transport::{Channel, Transport},
};

/// Receive buffer size for Level 0 Discovery.
pub const LEVEL0_BUFFER_LEN: usize = 4096;

/// Request code of a stack reset in ComID management.
const STACK_RESET_REQUEST_CODE: u32 = 2;

/// TCG protocol engine bound to one transport.
pub struct Engine<T, E> {
    transport: T,
    env: E,
    config: EngineConfig,
    pub(crate) session: Session,
    pub(crate) writer: PayloadWriter,
    pub(crate) recv_buf: Vec<u8>,
    pub(crate) args: ParameterList,
    pub(crate) results: ParameterList,
}

impl<T: Transport, E: Environment> Engine<T, E> {
    /// Create an engine with default configuration.
    pub fn new(transport: T, env: E) -> Self {
        Self::with_config(transport, env, EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(transport: T, env: E, config: EngineConfig) -> Self {
        Self {
            transport,
            env,
            session: Session::new(config.first_host_session_id),
            writer: PayloadWriter::new(config.buffer_size),
            recv_buf: vec![0; config.buffer_size],
            args: ParameterList::with_capacity(config.parameter_capacity),
            results: ParameterList::with_capacity(config.parameter_capacity),
            config,
        }
    }

    /// Session state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Replace the session state with a restored snapshot.
    ///
    /// # Errors
    /// Returns `InvalidState` if a session is currently open or opening.
    pub fn restore_session(&mut self, session: Session) -> Result<(), TcgError> {
        if self.session.state() != SessionState::Closed {
            return Err(UsageError::InvalidState { state: self.session.state(), operation: "restore_session" }.into());
        }
        self.session = session;
        Ok(())
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Environment in use.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Consume the engine, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Channel assigned to the transport.
    ///
    /// # Errors
    /// Returns `NotDiscovered` until a channel has been assigned.
    pub fn channel(&self) -> Result<Channel, TcgError> {
        self.transport.channel().ok_or_else(|| UsageError::NotDiscovered.into())
    }

    /// Read and parse the Level 0 Discovery response.
    ///
    /// Needs no session and no channel. Anomalies the parser accepted are
    /// logged and kept in `notes`.
    pub fn level0_discovery(&mut self) -> Result<DiscoveredCapabilities, TcgError> {
        let mut blob = vec![0u8; LEVEL0_BUFFER_LEN];
        let len = self.transport.recv(PROTOCOL_METHODS, LEVEL0_DISCOVERY_COM_ID, &mut blob)?;
        let capabilities = DiscoveredCapabilities::parse(&blob[..len.min(blob.len())]).map_err(TcgError::Protocol)?;

        for note in &capabilities.notes {
            warn!(?note, "level 0 discovery anomaly");
        }
        debug!(
            ssc = ?capabilities.ssc(),
            com_ids = ?capabilities.com_ids,
            opal = capabilities.is_opal(),
            opal_v2 = capabilities.is_opal_v2(),
            enterprise = capabilities.is_enterprise(),
            "level 0 discovery parsed"
        );
        Ok(capabilities)
    }

    /// Pick the ComID and SSC family from discovery and assign them to the
    /// transport.
    ///
    /// The first reported ComID is used. Opal is chosen when the Opal or Opal
    /// v2 classifier holds, Enterprise otherwise.
    ///
    /// # Errors
    /// Returns `UnsupportedDevice` when no SSC descriptor or ComID was seen.
    pub fn select_channel(&mut self, capabilities: &DiscoveredCapabilities) -> Result<Channel, TcgError> {
        let ssc_seen =
            capabilities.enterprise.is_some() || capabilities.opal.is_some() || capabilities.opal_v2.is_some();
        let extended_com_id = capabilities.extended_com_id().filter(|_| ssc_seen).ok_or(TcgError::UnsupportedDevice)?;
        let ssc = if capabilities.is_opal() || capabilities.is_opal_v2() {
            Ssc::Opal
        } else {
            Ssc::Enterprise
        };

        let channel = Channel { extended_com_id, ssc };
        self.transport.assign_channel(channel);
        debug!(com_id = format_args!("0x{extended_com_id:08x}"), %ssc, "channel assigned");
        Ok(channel)
    }

    /// Call the session manager's Properties method.
    ///
    /// # Errors
    /// Any of the seven reported limits missing is a protocol error.
    pub fn properties(&mut self) -> Result<SessionLimits, TcgError> {
        self.invoke(Uid::SESSION_MANAGER, Method::Properties, FrameScope::SessionManager, |_| Ok(()))?;

        let property = |name: &str| self.results.get_named_int(name).map_err(TcgError::Protocol);
        let limits = SessionLimits {
            max_packet_size: property("MaxPacketSize")?,
            max_com_packet_size: property("MaxComPacketSize")?,
            max_response_com_packet_size: property("MaxResponseComPacketSize")?,
            max_authentications: property("MaxAuthentications")?,
            default_session_timeout: property("DefSessionTimeout")?,
            max_session_timeout: property("MaxSessionTimeout")?,
            min_session_timeout: property("MinSessionTimeout")?,
        };
        debug!(?limits, "properties received");
        Ok(limits)
    }

    /// Open a read-write session to `sp`.
    ///
    /// # Errors
    /// Returns `InvalidState` if a session is already open. A failed
    /// exchange leaves the session closed; the host session id consumed by
    /// the attempt is not reused.
    pub fn start_session(&mut self, sp: SecurityProvider) -> Result<(), TcgError> {
        self.open_session(sp, Method::StartSession)
    }

    /// Open a session with StartTLSSession.
    ///
    /// Only the handshake is performed; later traffic is not encrypted.
    pub fn start_tls_session(&mut self, sp: SecurityProvider) -> Result<(), TcgError> {
        self.open_session(sp, Method::StartTlsSession)
    }

    fn open_session(&mut self, sp: SecurityProvider, method: Method) -> Result<(), TcgError> {
        let channel = self.channel()?;
        let sp_uid = sp.uid(channel.ssc);
        let host = self.session.begin_open(sp_uid)?;
        debug!(%sp, host_session_id = host, %method, "starting session");

        match self.sync_session(host, sp_uid, method) {
            Ok(tper) => {
                self.session.complete_open(tper)?;
                debug!(host_session_id = host, tper_session_id = tper, "session open");
                Ok(())
            },
            Err(err) => {
                self.session.abort_open();
                debug!(host_session_id = host, %err, "session start failed");
                Err(err)
            },
        }
    }

    fn sync_session(&mut self, host: u64, sp: Uid, method: Method) -> Result<u64, TcgError> {
        self.invoke(Uid::SESSION_MANAGER, method, FrameScope::SessionManager, |args| {
            args.push_int(host)?;
            args.push_uid(sp)?;
            args.push_int(1)?;
            Ok(())
        })?;

        let call = method.response_method().name();
        let echoed = self.results.get_int().map_err(TcgError::Protocol)?;
        let tper = self.results.get_int().map_err(TcgError::Protocol)?;
        if echoed != host {
            return Err(TcgError::UnexpectedResult {
                call,
                reason: format!("host session id {echoed}, expected {host}"),
            });
        }
        session_id_field(tper)?;
        Ok(tper)
    }

    /// Close the open session.
    ///
    /// The local session is cleared once the exchange completes, even if the
    /// confirmation does not decode: the device drops the session either way.
    ///
    /// # Errors
    /// Returns `InvalidState` if no session is open. Transport and retry
    /// failures leave the session as it was.
    pub fn close_session(&mut self) -> Result<(), TcgError> {
        let scope = self.session_scope("close_session")?;
        let channel = self.channel()?;

        self.begin_packet(channel, scope)?;
        self.writer.put_token(Token::EndOfSession)?;
        self.send_packet(channel)?;
        let len = self.receive(PROTOCOL_METHODS, channel.com_id())?;

        let confirmed = parse_response(&self.recv_buf[..len], channel, scope)
            .and_then(|frame| frame.reader().expect_token(Token::EndOfSession).map_err(TcgError::Protocol));
        if let Err(err) = confirmed {
            warn!(%err, "close session not confirmed, clearing anyway");
        }

        let ids = self.session.ids();
        self.session.clear();
        debug!(host_session_id = ids.host, tper_session_id = ids.tper, "session closed");
        Ok(())
    }

    /// Reset the TCG stack on a ComID.
    ///
    /// `extended_com_id` defaults to the assigned channel's. The device is
    /// polled while it reports no data yet, within the retry budget. On
    /// success the local session is cleared.
    pub fn stack_reset(&mut self, extended_com_id: Option<u32>) -> Result<(), TcgError> {
        let extended_com_id = match extended_com_id {
            Some(com_id) => com_id,
            None => self.channel()?.extended_com_id,
        };
        let com_id = short_com_id(extended_com_id);

        self.writer.reset();
        self.writer.put_raw_u32(extended_com_id)?;
        self.writer.put_raw_u32(STACK_RESET_REQUEST_CODE)?;
        debug!(com_id = format_args!("0x{extended_com_id:08x}"), "stack reset");
        self.transport.send(PROTOCOL_COM_ID_MANAGEMENT, com_id, self.writer.as_slice())?;

        let attempts = self.config.retry.attempts();
        for attempt in 1..=attempts {
            let len = self.transport.recv(PROTOCOL_COM_ID_MANAGEMENT, com_id, &mut self.recv_buf)?;
            let len = len.min(self.recv_buf.len());
            match read_stack_reset_response(&self.recv_buf[..len], extended_com_id)? {
                Some(0) => {
                    self.session.clear();
                    debug!(attempt, "stack reset complete");
                    return Ok(());
                },
                Some(1) => return Err(StackResetError::Failure.into()),
                Some(status) => return Err(StackResetError::UnknownStatus(status).into()),
                None if attempt < attempts => {
                    trace!(attempt, "stack reset pending");
                    self.env.sleep(self.config.retry.delay);
                },
                None => {},
            }
        }

        debug!(attempts, "stack reset still pending, giving up");
        Err(TcgError::RetryExhausted { attempts })
    }

    /// Reset the TPer. No response is read.
    ///
    /// The device drops any open session, so the local one is cleared.
    pub fn tper_reset(&mut self) -> Result<(), TcgError> {
        debug!("TPer reset");
        self.transport.send(PROTOCOL_COM_ID_MANAGEMENT, TPER_RESET_COM_ID, &[0])?;
        self.session.clear();
        Ok(())
    }

    /// Scope of an exchange inside the open session.
    pub(crate) fn session_scope(&self, operation: &'static str) -> Result<FrameScope, TcgError> {
        Ok(FrameScope::Session(self.session.require_open(operation)?))
    }

    /// Run one method call and leave its results in `self.results`.
    ///
    /// `build` fills the argument list; it runs before anything is sent.
    /// Session manager methods are checked for their `Call SMUID <method>`
    /// prefix. A non-zero status becomes [`TcgError::Method`].
    pub(crate) fn invoke(
        &mut self,
        object: Uid,
        method: Method,
        scope: FrameScope,
        build: impl FnOnce(&mut ParameterList) -> Result<(), TcgError>,
    ) -> Result<(), TcgError> {
        let channel = self.channel()?;
        self.args.reset();
        build(&mut self.args)?;

        self.begin_packet(channel, scope)?;
        self.writer.put_call(object, method.uid(channel.ssc))?;
        self.writer.put_token(Token::StartList)?;
        self.writer.put_parameters(&self.args)?;
        self.writer.put_token(Token::EndList)?;
        self.writer.put_token(Token::EndOfData)?;
        self.writer.put_status(0)?;
        debug!(%method, %object, args = self.args.len(), "method call");
        self.send_packet(channel)?;

        let len = self.receive(PROTOCOL_METHODS, channel.com_id())?;
        let frame = parse_response(&self.recv_buf[..len], channel, scope)?;
        let prefix = method.response_has_call_prefix().then(|| method.response_method().uid(channel.ssc));
        self.results.reset();
        let status = decode_method_response(frame.reader(), prefix, &mut self.results).map_err(TcgError::Protocol)?;

        if status != 0 {
            debug!(%method, status, "method failed");
            return Err(TcgError::Method { call: method.name(), code: status });
        }
        trace!(%method, results = self.results.len(), "method succeeded");
        Ok(())
    }

    /// Start a packet addressed by `scope` in the send buffer.
    pub(crate) fn begin_packet(&mut self, channel: Channel, scope: FrameScope) -> Result<(), TcgError> {
        self.writer.reset();
        self.writer.begin_frame(channel.extended_com_id, scope.expected(), self.session.sequence_number())?;
        Ok(())
    }

    /// Finalize the packet in the send buffer and send it.
    pub(crate) fn send_packet(&mut self, channel: Channel) -> Result<(), TcgError> {
        self.writer.finalize()?;
        let sequence = self.session.next_sequence();
        trace!(len = self.writer.len(), sequence, "sending packet");
        self.transport.send(PROTOCOL_METHODS, channel.com_id(), self.writer.as_slice())?;
        Ok(())
    }

    /// Receive a response, retrying while the device reports it pending.
    pub(crate) fn receive(&mut self, protocol: u8, com_id: u16) -> Result<usize, TcgError> {
        let attempts = self.config.retry.attempts();
        for attempt in 1..=attempts {
            let len = self.transport.recv(protocol, com_id, &mut self.recv_buf)?;
            let len = len.min(self.recv_buf.len());
            let header = ComPacketHeader::peek(&self.recv_buf[..len]).map_err(TcgError::Protocol)?;

            match header.flow() {
                Flow::Ready => {
                    trace!(attempt, len, "response received");
                    return Ok(len);
                },
                Flow::BufferTooSmall { outstanding } => {
                    return Err(TcgError::ResponseTooLarge { outstanding });
                },
                Flow::Pending if attempt < attempts => {
                    trace!(attempt, delay = ?self.config.retry.delay, "response pending");
                    self.env.sleep(self.config.retry.delay);
                },
                Flow::Pending => {},
            }
        }

        debug!(attempts, "response still pending, giving up");
        Err(TcgError::RetryExhausted { attempts })
    }
}

impl<T, E> std::fmt::Debug for Engine<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("session", &self.session).field("config", &self.config).finish_non_exhaustive()
    }
}

/// Validate the three frame headers of a received response.
pub(crate) fn parse_response(data: &[u8], channel: Channel, scope: FrameScope) -> Result<ReceivedFrame<'_>, TcgError> {
    ReceivedFrame::parse(data, channel.extended_com_id, scope).map_err(TcgError::Protocol)
}

/// Decode `[Call SMUID method] [ results ] EndOfData [ status 0 0 ]`.
fn decode_method_response(
    mut reader: PayloadReader<'_>,
    prefix: Option<Uid>,
    results: &mut ParameterList,
) -> tcg_proto::Result<u64> {
    if let Some(method) = prefix {
        reader.expect_token(Token::Call)?;
        reader.expect_uid(Uid::SESSION_MANAGER)?;
        reader.expect_uid(method)?;
    }

    reader.expect_token(Token::StartList)?;
    while !reader.peek_token(Token::EndList) {
        reader.read_parameter(results)?;
    }
    reader.expect_token(Token::EndList)?;
    reader.expect_token(Token::EndOfData)?;
    reader.read_status()
}

/// Decode a stack reset response: `Some(status)` when complete, `None`
/// while the device has no data yet.
fn read_stack_reset_response(data: &[u8], extended_com_id: u32) -> Result<Option<u32>, TcgError> {
    let mut reader = PayloadReader::new(data);
    let mut field = || -> Result<u32, TcgError> { reader.read_u32().map_err(TcgError::Protocol) };

    let found = field()?;
    if found != extended_com_id {
        return Err(StackResetError::ComIdMismatch { expected: extended_com_id, found }.into());
    }
    match field()? {
        STACK_RESET_REQUEST_CODE => {},
        0 => return Err(StackResetError::NoResponse.into()),
        other => return Err(StackResetError::UnexpectedRequestCode(other).into()),
    }

    let _reserved = reader.read_u16().map_err(TcgError::Protocol)?;
    match reader.read_u16().map_err(TcgError::Protocol)? {
        0 => Ok(None),
        4 => Ok(Some(reader.read_u32().map_err(TcgError::Protocol)?)),
        other => Err(StackResetError::UnexpectedLength(other).into()),
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use tcg_proto::ProtocolError;

    use super::*;

    #[test]
    fn stack_reset_response_complete() {
        let data = hex!("07FE0000 00000002 0000 0004 00000000");
        assert_eq!(read_stack_reset_response(&data, 0x07FE_0000).unwrap(), Some(0));
    }

    #[test]
    fn stack_reset_response_pending() {
        let data = hex!("07FE0000 00000002 0000 0000");
        assert_eq!(read_stack_reset_response(&data, 0x07FE_0000).unwrap(), None);
    }

    #[test]
    fn stack_reset_response_errors() {
        let wrong_com_id = hex!("08000000 00000002 0000 0000");
        assert!(matches!(
            read_stack_reset_response(&wrong_com_id, 0x07FE_0000),
            Err(TcgError::StackReset(StackResetError::ComIdMismatch { found: 0x0800_0000, .. }))
        ));

        let no_response = hex!("07FE0000 00000000 0000 0000");
        assert!(matches!(
            read_stack_reset_response(&no_response, 0x07FE_0000),
            Err(TcgError::StackReset(StackResetError::NoResponse))
        ));

        let odd_length = hex!("07FE0000 00000002 0000 0002 0000");
        assert!(matches!(
            read_stack_reset_response(&odd_length, 0x07FE_0000),
            Err(TcgError::StackReset(StackResetError::UnexpectedLength(2)))
        ));

        assert!(matches!(read_stack_reset_response(&[0x07], 0x07FE_0000), Err(TcgError::Protocol(_))));
    }

    #[test]
    fn method_response_with_prefix() {
        let body = hex!(
            "F8 A8 00000000000000FF A8 000000000000FF03"
            "F0 24 82 1000 F1 F9 F0 00 00 00 F1"
        );
        let mut results = ParameterList::new();
        let prefix = Some(Method::SyncSession.uid(Ssc::Opal));
        let status = decode_method_response(PayloadReader::new(&body), prefix, &mut results).unwrap();
        assert_eq!(status, 0);
        assert_eq!(results.ints().collect::<Vec<_>>(), [0x24, 0x1000]);
    }

    #[test]
    fn method_response_reports_status() {
        let body = hex!("F0 F1 F9 F0 05 00 00 F1");
        let mut results = ParameterList::new();
        assert_eq!(decode_method_response(PayloadReader::new(&body), None, &mut results).unwrap(), 5);
        assert!(results.is_empty());
    }

    #[test]
    fn method_response_missing_end_of_data() {
        let body = hex!("F0 F1 F0 00 00 00 F1");
        let mut results = ParameterList::new();
        assert!(matches!(
            decode_method_response(PayloadReader::new(&body), None, &mut results),
            Err(ProtocolError::UnexpectedToken { .. })
        ));
    }
}
