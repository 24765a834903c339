//! Session lifecycle against a scripted drive.
//!
//! Each test scripts the replies a TPer would send and checks the engine's
//! session state together with what went out on the wire:
//! - Full discovery: Level 0, Properties, MSID read, close
//! - Sessions do not nest, and methods need one
//! - A failed StartSession, or one assigning an oversized id, leaves the
//!   session closed
//! - StartTLSSession expects SyncTLSSession
//! - RevertSP, stack reset and TPer reset drop the session
//! - Snapshots carry a live session to a fresh engine

use std::time::Duration;

use tcg_core::{Channel, Drive, Engine, Session, SessionState, TcgError, UsageError, error::StackResetError};
use tcg_harness::{DiscoveryBuilder, FakeTransport, ResponseBuilder, SimEnv, response::stack_reset_reply};
use tcg_proto::{
    ByteValue, Method, ParameterList, ProtocolError, SecurityProvider, SessionIds, Ssc, Uid,
    columns::PIN,
    discovery::SessionLimits,
    frame::{PROTOCOL_COM_ID_MANAGEMENT, PROTOCOL_METHODS, TPER_RESET_COM_ID},
};

const COM_ID: u32 = 0x07FE_0000;
const IDS: SessionIds = SessionIds { tper: 0x1001, host: 100 };
const MSID_ROW: Uid = Uid::from_u64(0x0000_000B_0000_8402);

fn limits() -> SessionLimits {
    SessionLimits {
        max_packet_size: 2028,
        max_com_packet_size: 2048,
        max_response_com_packet_size: 2048,
        max_authentications: 2,
        default_session_timeout: 0,
        max_session_timeout: 0,
        min_session_timeout: 0,
    }
}

fn replies(ssc: Ssc) -> ResponseBuilder {
    ResponseBuilder::new(COM_ID, ssc)
}

fn engine(ssc: Ssc) -> Engine<FakeTransport, SimEnv> {
    Engine::new(FakeTransport::with_channel(Channel { extended_com_id: COM_ID, ssc }), SimEnv::new())
}

fn open_engine(ssc: Ssc) -> Engine<FakeTransport, SimEnv> {
    let mut engine = engine(ssc);
    engine.transport_mut().push_reply(replies(ssc).sync_session(IDS.host, IDS.tper).unwrap());
    engine.start_session(SecurityProvider::Admin).unwrap();
    engine
}

#[test]
fn discovery_reads_msid_and_closes() {
    let sm = replies(Ssc::Enterprise);
    let session = sm.in_session(IDS);
    let mut msid_row = ParameterList::new();
    msid_row.push_column_bytes(Ssc::Enterprise, PIN, ByteValue::try_from("MSID-PIN").unwrap()).unwrap();

    let mut transport = FakeTransport::new();
    transport
        .push_reply(DiscoveryBuilder::enterprise(0x07FE).build())
        .push_reply(sm.properties(&limits()).unwrap())
        .push_reply(sm.sync_session(IDS.host, IDS.tper).unwrap())
        .push_reply(session.row(&msid_row).unwrap())
        .push_reply(session.end_of_session().unwrap());

    let mut drive = Drive::new(Engine::new(transport, SimEnv::new()));
    let capabilities = drive.discover().unwrap();
    assert!(capabilities.is_enterprise());
    assert_eq!(capabilities.limits, limits());

    assert_eq!(drive.msid().map(ByteValue::as_slice), Some(&b"MSID-PIN"[..]));
    let engine = drive.engine();
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert!(engine.session().ids().is_session_manager());
    assert_eq!(engine.channel().unwrap(), Channel { extended_com_id: COM_ID, ssc: Ssc::Enterprise });

    let transport = engine.transport();
    assert_eq!(transport.remaining_replies(), 0);
    assert_eq!(transport.sent().len(), 4);
    assert!(transport.sent().iter().all(|packet| packet.protocol == PROTOCOL_METHODS && packet.com_id == 0x07FE));
    assert_eq!(transport.receives()[0], (PROTOCOL_METHODS, 1));
}

#[test]
fn discovery_without_ssc_is_unsupported() {
    let mut transport = FakeTransport::new();
    transport.push_reply(DiscoveryBuilder::new().capable_tper().capable_locking().build());

    let mut drive = Drive::new(Engine::new(transport, SimEnv::new()));
    assert!(matches!(drive.discover(), Err(TcgError::UnsupportedDevice)));
    assert!(drive.engine().transport().sent().is_empty());
    assert!(drive.capabilities().is_none());
}

#[test]
fn sessions_do_not_nest() {
    let mut engine = open_engine(Ssc::Opal);
    let sent = engine.transport().sent().len();

    let err = engine.start_session(SecurityProvider::Locking).unwrap_err();
    assert!(matches!(err, TcgError::Usage(UsageError::InvalidState { state: SessionState::Open, .. })));
    assert_eq!(engine.transport().sent().len(), sent);
    assert_eq!(engine.session().ids(), IDS);
}

#[test]
fn methods_need_a_session() {
    let mut engine = engine(Ssc::Opal);

    let err = engine.get(MSID_ROW).unwrap_err();
    assert!(err.is_usage());
    assert!(matches!(
        err,
        TcgError::Usage(UsageError::InvalidState { state: SessionState::Closed, operation: "get" })
    ));
    assert!(matches!(engine.close_session(), Err(TcgError::Usage(_))));
    assert!(engine.transport().sent().is_empty());
}

#[test]
fn methods_need_a_channel() {
    let mut engine = Engine::new(FakeTransport::new(), SimEnv::new());
    let err = engine.start_session(SecurityProvider::Admin).unwrap_err();

    assert!(matches!(err, TcgError::Usage(UsageError::NotDiscovered)));
    assert_eq!(engine.session().state(), SessionState::Closed);
}

#[test]
fn failed_start_leaves_session_closed() {
    let mut engine = engine(Ssc::Enterprise);
    let sm = replies(Ssc::Enterprise);
    engine
        .transport_mut()
        .push_reply(sm.session_manager(Method::SyncSession, &ParameterList::new(), 0x07).unwrap())
        .push_reply(sm.sync_session(101, 0x2002).unwrap());

    let err = engine.start_session(SecurityProvider::Locking).unwrap_err();
    assert!(matches!(err, TcgError::Method { call: "StartSession", code: 0x07 }));
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert!(engine.session().ids().is_session_manager());

    engine.start_session(SecurityProvider::Locking).unwrap();
    assert_eq!(engine.session().ids(), SessionIds { tper: 0x2002, host: 101 });
    assert_eq!(engine.session().sp(), Some(SecurityProvider::Locking.uid(Ssc::Enterprise)));
}

#[test]
fn sync_must_echo_host_session_id() {
    let mut engine = engine(Ssc::Opal);
    engine.transport_mut().push_reply(replies(Ssc::Opal).sync_session(999, 0x1001).unwrap());

    let err = engine.start_session(SecurityProvider::Admin).unwrap_err();
    assert!(matches!(err, TcgError::UnexpectedResult { call: "SyncSession", .. }));
    assert_eq!(engine.session().state(), SessionState::Closed);
}

#[test]
fn tper_session_id_must_fit_packet_header() {
    let mut engine = engine(Ssc::Opal);
    engine.transport_mut().push_reply(replies(Ssc::Opal).sync_session(IDS.host, 0x1_0000_0001).unwrap());

    let err = engine.start_session(SecurityProvider::Admin).unwrap_err();
    assert!(matches!(err, TcgError::Protocol(ProtocolError::SessionIdTooWide(0x1_0000_0001))));
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert!(engine.session().ids().is_session_manager());
    assert!(matches!(engine.get(MSID_ROW), Err(TcgError::Usage(_))));
}

#[test]
fn tls_session_expects_sync_tls_reply() {
    let mut engine = engine(Ssc::Opal);
    let sm = replies(Ssc::Opal);
    let mut ids = ParameterList::new();
    ids.push_int(101).unwrap();
    ids.push_int(0x3003).unwrap();
    engine
        .transport_mut()
        .push_reply(sm.sync_session(100, 0x3003).unwrap())
        .push_reply(sm.session_manager(Method::SyncTlsSession, &ids, 0).unwrap());

    let err = engine.start_tls_session(SecurityProvider::Locking).unwrap_err();
    assert!(matches!(err, TcgError::Protocol(ProtocolError::UidMismatch { .. })));
    assert_eq!(engine.session().state(), SessionState::Closed);

    engine.start_tls_session(SecurityProvider::Locking).unwrap();
    assert_eq!(engine.session().ids(), SessionIds { tper: 0x3003, host: 101 });
}

#[test]
fn close_clears_even_without_confirmation() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_reply(replies(Ssc::Opal).in_session(IDS).ok().unwrap());

    engine.close_session().unwrap();
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert!(engine.session().ids().is_session_manager());
}

#[test]
fn close_keeps_session_on_transport_failure() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_failure("unplugged");

    assert!(matches!(engine.close_session(), Err(TcgError::Transport(_))));
    assert!(engine.session().is_open());
}

#[test]
fn revert_sp_drops_session() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_reply(replies(Ssc::Opal).in_session(IDS).ok().unwrap());

    engine.revert_sp(None).unwrap();
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert!(engine.session().ids().is_session_manager());
    assert_eq!(engine.transport().sent().len(), 2);
}

#[test]
fn stack_reset_polls_then_drops_session() {
    let mut engine = open_engine(Ssc::Enterprise);
    engine
        .transport_mut()
        .push_reply(stack_reset_reply(COM_ID, 2, 0, 0))
        .push_reply(stack_reset_reply(COM_ID, 2, 4, 0));

    engine.stack_reset(None).unwrap();
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert_eq!(engine.env().sleeps(), [Duration::from_millis(50)]);

    let request = engine.transport().last_sent().unwrap();
    assert_eq!(request.protocol, PROTOCOL_COM_ID_MANAGEMENT);
    assert_eq!(request.com_id, 0x07FE);
    assert_eq!(request.payload, [0x07, 0xFE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02]);
}

#[test]
fn stack_reset_failure_keeps_session() {
    let mut engine = open_engine(Ssc::Enterprise);
    engine.transport_mut().push_reply(stack_reset_reply(COM_ID, 2, 4, 1));

    let err = engine.stack_reset(None).unwrap_err();
    assert!(matches!(err, TcgError::StackReset(StackResetError::Failure)));
    assert!(engine.session().is_open());
}

#[test]
fn tper_reset_sends_without_reading() {
    let mut engine = open_engine(Ssc::Opal);
    engine.tper_reset().unwrap();

    let request = engine.transport().last_sent().unwrap();
    assert_eq!((request.protocol, request.com_id), (PROTOCOL_COM_ID_MANAGEMENT, TPER_RESET_COM_ID));
    assert_eq!(request.payload, [0]);
    assert_eq!(engine.session().state(), SessionState::Closed);
    assert_eq!(engine.transport().receives().len(), 1);
}

#[test]
fn snapshot_moves_session_to_new_engine() {
    let first = open_engine(Ssc::Enterprise);
    let snapshot = first.session().to_cbor().unwrap();

    let mut second = engine(Ssc::Enterprise);
    second.restore_session(Session::from_cbor(&snapshot).unwrap()).unwrap();
    assert_eq!(second.session().ids(), IDS);

    let mut row = ParameterList::new();
    row.push_column_bytes(Ssc::Enterprise, PIN, ByteValue::try_from("abc").unwrap()).unwrap();
    second.transport_mut().push_reply(replies(Ssc::Enterprise).in_session(IDS).row(&row).unwrap());
    let cells = second.get(MSID_ROW).unwrap();
    assert_eq!(cells.get_column_bytes(Ssc::Enterprise, PIN).unwrap().as_slice(), b"abc");

    let mut open = open_engine(Ssc::Enterprise);
    let err = open.restore_session(Session::new(1)).unwrap_err();
    assert!(matches!(err, TcgError::Usage(UsageError::InvalidState { state: SessionState::Open, .. })));
}
