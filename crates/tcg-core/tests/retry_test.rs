//! Bounded retry on "pending" responses.
//!
//! A TPer that has not finished a call answers with an empty ComPacket. The
//! engine sleeps and receives again, at most `retries` times:
//! - Eleven pending answers exhaust the default budget after ten sleeps
//! - A response too large for the buffer is never retried
//! - Seeded pending runs within the budget never change the outcome

use std::time::Duration;

use proptest::prelude::*;
use tcg_core::{Channel, Engine, EngineConfig, RetryConfig, SessionState, TcgError};
use tcg_harness::{FakeTransport, PendingInjector, ResponseBuilder, SimEnv};
use tcg_proto::{ParameterList, SecurityProvider, SessionIds, Ssc, Uid, discovery::SessionLimits};

const COM_ID: u32 = 0x0FFE_0000;
const CHANNEL: Channel = Channel { extended_com_id: COM_ID, ssc: Ssc::Opal };
const IDS: SessionIds = SessionIds { tper: 0x55, host: 100 };
const LOCKING_INFO: Uid = Uid::from_u64(0x0000_0801_0000_0001);

fn replies() -> ResponseBuilder {
    ResponseBuilder::new(COM_ID, Ssc::Opal)
}

#[test]
fn pending_exhausts_default_budget() {
    let mut transport = FakeTransport::with_channel(CHANNEL);
    for _ in 0..11 {
        transport.push_reply(replies().pending());
    }
    let mut engine = Engine::new(transport, SimEnv::new());

    let err = engine.properties().unwrap_err();
    assert!(matches!(err, TcgError::RetryExhausted { attempts: 11 }));
    assert_eq!(engine.transport().receives().len(), 11);
    assert_eq!(engine.env().sleep_count(), 10);
    assert_eq!(engine.env().total_slept(), Duration::from_millis(500));
}

#[test]
fn pending_then_ready() {
    let mut transport = FakeTransport::with_channel(CHANNEL);
    for _ in 0..3 {
        transport.push_reply(replies().pending());
    }
    transport.push_reply(replies().properties(&SessionLimits::default()).unwrap());
    let mut engine = Engine::new(transport, SimEnv::new());

    assert_eq!(engine.properties().unwrap(), SessionLimits::default());
    assert_eq!(engine.env().sleep_count(), 3);
    assert_eq!(engine.transport().sent().len(), 1);
}

#[test]
fn configured_budget() {
    let config = EngineConfig {
        retry: RetryConfig { retries: 2, delay: Duration::from_millis(5) },
        ..EngineConfig::default()
    };
    let mut transport = FakeTransport::with_channel(CHANNEL);
    for _ in 0..5 {
        transport.push_reply(replies().pending());
    }
    let mut engine = Engine::with_config(transport, SimEnv::new(), config);

    assert!(matches!(engine.properties(), Err(TcgError::RetryExhausted { attempts: 3 })));
    assert_eq!(engine.env().sleeps(), [Duration::from_millis(5); 2]);
    assert_eq!(engine.transport().remaining_replies(), 2);
}

#[test]
fn too_large_is_not_retried() {
    let mut transport = FakeTransport::with_channel(CHANNEL);
    transport.push_reply(replies().too_large(8192)).push_reply(replies().pending());
    let mut engine = Engine::new(transport, SimEnv::new());

    let err = engine.properties().unwrap_err();
    assert!(matches!(err, TcgError::ResponseTooLarge { outstanding: 8192 }));
    assert_eq!(engine.transport().receives().len(), 1);
    assert_eq!(engine.env().sleep_count(), 0);
}

#[test]
fn short_receive_is_a_protocol_error() {
    let mut transport = FakeTransport::with_channel(CHANNEL);
    transport.push_reply([0u8; 7]);
    let mut engine = Engine::new(transport, SimEnv::new());

    assert!(matches!(engine.properties(), Err(TcgError::Protocol(_))));
}

proptest! {
    #[test]
    fn pending_runs_within_budget_are_invisible(seed in any::<u64>(), max_run in 1u32..=10) {
        let session = replies().in_session(IDS);
        let mut row = ParameterList::new();
        row.push_id_int(1, 7).unwrap();

        let mut transport =
            FakeTransport::with_channel(CHANNEL).with_pending_faults(PendingInjector::new(seed, 0.5, max_run));
        transport
            .push_reply(replies().sync_session(IDS.host, IDS.tper).unwrap())
            .push_reply(session.row(&row).unwrap())
            .push_reply(session.end_of_session().unwrap());
        let mut engine = Engine::new(transport, SimEnv::new());

        engine.start_session(SecurityProvider::Locking).unwrap();
        let cells = engine.get(LOCKING_INFO).unwrap();
        engine.close_session().unwrap();

        prop_assert_eq!(cells.get_id_int(1).unwrap(), 7);
        prop_assert_eq!(engine.session().state(), SessionState::Closed);
        let injected = engine.transport().injector().map_or(0, PendingInjector::injected);
        prop_assert_eq!(engine.env().sleep_count(), injected as usize);
        prop_assert_eq!(engine.transport().receives().len(), 3 + injected as usize);
    }
}
