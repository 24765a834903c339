//! Method calls inside an open session.
//!
//! Covers the request bytes the engine encodes and how it reads replies:
//! - Byte-exact StartSession packet
//! - Status codes and malformed status lists
//! - Authenticate keyed by `Challenge` on Enterprise, by id on Opal
//! - Random count validation before any traffic
//! - Transaction acknowledgements

use tcg_core::{Cell, Channel, Engine, TcgError, UsageError};
use tcg_harness::{FakeTransport, ResponseBuilder, SimEnv};
use tcg_proto::{
    Authority, ByteValue, MethodStatus, ParameterList, ProtocolError, SecurityProvider, SessionIds, Ssc, Token, Uid,
    columns::RANGE_START,
};

const COM_ID: u32 = 0x07FE_0000;
const IDS: SessionIds = SessionIds { tper: 0x1001, host: 100 };
const BAND_1: Uid = Uid::from_u64(0x0000_0802_0000_0002);

fn session_replies(ssc: Ssc) -> ResponseBuilder {
    ResponseBuilder::new(COM_ID, ssc).in_session(IDS)
}

fn open_engine(ssc: Ssc) -> Engine<FakeTransport, SimEnv> {
    let mut transport = FakeTransport::with_channel(Channel { extended_com_id: COM_ID, ssc });
    transport.push_reply(ResponseBuilder::new(COM_ID, ssc).sync_session(IDS.host, IDS.tper).unwrap());
    let mut engine = Engine::new(transport, SimEnv::new());
    engine.start_session(SecurityProvider::Admin).unwrap();
    engine
}

fn last_payload(engine: &Engine<FakeTransport, SimEnv>) -> Vec<u8> {
    engine.transport().last_sent().map(|packet| packet.payload.clone()).unwrap_or_default()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[test]
fn start_session_packet_bytes() {
    let engine = open_engine(Ssc::Enterprise);
    let packet = &engine.transport().sent()[0].payload;

    let layout = format!(
        "{} {} {} {}",
        hex::encode(&packet[..20]),
        hex::encode(&packet[20..44]),
        hex::encode(&packet[44..56]),
        hex::encode(&packet[56..]),
    );
    insta::assert_snapshot!(layout, @"0000000007fe0000000000000000000000000050 000000000000000000000001000000000000000000000038 00000000000000000000002a f8a800000000000000ffa8000000000000ff02f08400000064a8000002050000000101f1f9f0000000f10000");
}

#[test]
fn non_zero_status_is_a_method_error() {
    let mut engine = open_engine(Ssc::Enterprise);
    engine.transport_mut().push_reply(session_replies(Ssc::Enterprise).failed(5).unwrap());

    let err = engine.get(BAND_1).unwrap_err();
    assert!(matches!(err, TcgError::Method { call: "Get", code: 5 }));
    assert_eq!(err.method_status(), Some(MethodStatus::SpDisabled));
    assert!(engine.session().is_open());
}

#[test]
fn reserved_status_fields_must_be_zero() {
    let mut engine = open_engine(Ssc::Enterprise);
    let reply = session_replies(Ssc::Enterprise).method_with_footer(&ParameterList::new(), [0, 1, 0]).unwrap();
    engine.transport_mut().push_reply(reply);

    let err = engine.get(BAND_1).unwrap_err();
    assert!(matches!(err, TcgError::Protocol(ProtocolError::MalformedStatus { value: 1, .. })));
}

#[test]
fn reply_for_another_session_is_rejected() {
    let mut engine = open_engine(Ssc::Opal);
    let stranger = ResponseBuilder::new(COM_ID, Ssc::Opal).in_session(SessionIds { tper: 0x1001, host: 7 });
    engine.transport_mut().push_reply(stranger.ok().unwrap());

    assert!(matches!(engine.get(BAND_1), Err(TcgError::Protocol(ProtocolError::SessionMismatch { .. }))));
}

#[test]
fn enterprise_authenticate_uses_challenge_name() {
    let mut engine = open_engine(Ssc::Enterprise);
    engine.transport_mut().push_reply(session_replies(Ssc::Enterprise).authenticated(true).unwrap());

    let pin = ByteValue::try_from("secret").unwrap();
    engine.authenticate(Authority::BandMaster(1), &pin).unwrap();

    let payload = last_payload(&engine);
    assert!(contains(&payload, b"Challenge"));
    assert!(contains(&payload, b"secret"));
}

#[test]
fn opal_authenticate_uses_id() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_reply(session_replies(Ssc::Opal).authenticated(true).unwrap());

    engine.authenticate(Authority::Admin(1), &ByteValue::try_from("pw").unwrap()).unwrap();
    let payload = last_payload(&engine);
    assert!(!contains(&payload, b"Challenge"));
    assert!(contains(&payload, &[0xF2, 0x00, 0xA2, b'p', b'w', 0xF3]));
}

#[test]
fn rejected_credential() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_reply(session_replies(Ssc::Opal).authenticated(false).unwrap());

    let err = engine.authenticate(Authority::Sid, &ByteValue::try_from("wrong").unwrap()).unwrap_err();
    assert!(matches!(err, TcgError::AuthenticationFailed { ref authority } if authority == "SID"));
    assert!(engine.session().is_open());
}

#[test]
fn challenge_round_trip() {
    let mut engine = open_engine(Ssc::Enterprise);
    let mut challenge = ParameterList::new();
    challenge.push_bytes(ByteValue::from_slice(&[0xC0; 20]).unwrap()).unwrap();
    let replies = session_replies(Ssc::Enterprise);
    engine
        .transport_mut()
        .push_reply(replies.method(&challenge, 0).unwrap())
        .push_reply(replies.authenticated(true).unwrap());

    let nonce = engine.request_challenge(Authority::MakerSymK).unwrap();
    assert_eq!(nonce.as_slice(), [0xC0; 20]);
    assert!(!contains(&engine.transport().sent()[1].payload, b"Challenge"));

    engine.answer_challenge(Authority::MakerSymK, &ByteValue::from_slice(&[0x5A; 32]).unwrap()).unwrap();
    assert!(contains(&last_payload(&engine), b"Challenge"));
}

#[test]
fn random_count_checked_before_sending() {
    let mut engine = open_engine(Ssc::Opal);
    let sent = engine.transport().sent().len();

    for count in [0, 33] {
        let err = engine.random(count).unwrap_err();
        assert!(matches!(err, TcgError::Usage(UsageError::RandomCount(c)) if c == count));
    }
    assert_eq!(engine.transport().sent().len(), sent);
}

#[test]
fn random_returns_requested_bytes() {
    let mut engine = open_engine(Ssc::Opal);
    let replies = session_replies(Ssc::Opal);
    let mut sixteen = ParameterList::new();
    sixteen.push_bytes(ByteValue::from_slice(&[0x42; 16]).unwrap()).unwrap();
    let mut eight = ParameterList::new();
    eight.push_bytes(ByteValue::from_slice(&[0x42; 8]).unwrap()).unwrap();
    engine
        .transport_mut()
        .push_reply(replies.method(&sixteen, 0).unwrap())
        .push_reply(replies.method(&eight, 0).unwrap());

    assert_eq!(engine.random(16).unwrap(), [0x42; 16]);
    assert!(matches!(engine.random(16), Err(TcgError::UnexpectedResult { call: "Random", .. })));
}

#[test]
fn random_takes_exactly_one_result() {
    let mut engine = open_engine(Ssc::Opal);
    let mut extra = ParameterList::new();
    extra.push_bytes(ByteValue::from_slice(&[0x42; 16]).unwrap()).unwrap();
    extra.push_int(1).unwrap();
    engine.transport_mut().push_reply(session_replies(Ssc::Opal).method(&extra, 0).unwrap());

    let err = engine.random(16).unwrap_err();
    assert!(matches!(err, TcgError::UnexpectedResult { call: "Random", .. }));
}

#[test]
fn set_without_cells_is_rejected() {
    let mut engine = open_engine(Ssc::Opal);
    assert!(matches!(engine.set(BAND_1, &[]), Err(TcgError::Usage(UsageError::NothingToSet))));
    assert_eq!(engine.transport().sent().len(), 1);
}

#[test]
fn opal_set_packet_carries_values_pair() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_reply(session_replies(Ssc::Opal).ok().unwrap());

    engine.set(BAND_1, &[Cell::int(RANGE_START, 0x40)]).unwrap();
    // Values = [ RangeStart = 0x40 ]
    let values = [0xF2, 0x01, 0xF0, 0xF2, 0x03, 0x84, 0x00, 0x00, 0x00, 0x40, 0xF3, 0xF1, 0xF3];
    assert!(contains(&last_payload(&engine), &values));
}

#[test]
fn transaction_commit() {
    let mut engine = open_engine(Ssc::Enterprise);
    let replies = session_replies(Ssc::Enterprise);
    engine
        .transport_mut()
        .push_reply(replies.transaction(Token::StartTransaction, 0).unwrap())
        .push_reply(replies.transaction(Token::EndTransaction, 0).unwrap());

    engine.start_transaction().unwrap();
    assert!(contains(&last_payload(&engine)[56..], &[0xFB, 0x00]));
    engine.commit_transaction().unwrap();
    assert!(contains(&last_payload(&engine)[56..], &[0xFC, 0x00]));
}

#[test]
fn transaction_commit_not_acknowledged() {
    let mut engine = open_engine(Ssc::Enterprise);
    engine.transport_mut().push_reply(session_replies(Ssc::Enterprise).transaction(Token::EndTransaction, 1).unwrap());

    let err = engine.commit_transaction().unwrap_err();
    assert!(matches!(err, TcgError::Transaction { operation: "Commit", ack: 1 }));
}

#[test]
fn transaction_abort_expects_abort_ack() {
    let mut engine = open_engine(Ssc::Opal);
    engine.transport_mut().push_reply(session_replies(Ssc::Opal).transaction(Token::EndTransaction, 1).unwrap());

    engine.abort_transaction().unwrap();
    assert!(contains(&last_payload(&engine)[56..], &[0xFC, 0x01]));
}
