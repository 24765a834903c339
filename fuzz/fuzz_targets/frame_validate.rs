//! Header validation of received ComPackets.
//!
//! The first byte picks the scope and the next four the expected ComID;
//! the rest is the received buffer. An accepted frame's body must lie
//! inside the buffer and inside the declared SubPacket length.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tcg_proto::{
    FrameScope, ReceivedFrame, SessionIds,
    frame::{ComPacketHeader, FRAME_HEADER_LEN},
};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let Some((com_id, buffer)) = rest.split_first_chunk::<4>() else {
        return;
    };
    let expected_com_id = u32::from_be_bytes(*com_id);
    let scope = if selector & 1 == 0 {
        FrameScope::SessionManager
    } else {
        FrameScope::Session(SessionIds { tper: u64::from(selector >> 1), host: 100 })
    };

    if let Ok(header) = ComPacketHeader::peek(buffer) {
        let _ = header.flow();
    }

    if let Ok(frame) = ReceivedFrame::parse(buffer, expected_com_id, scope) {
        assert_eq!(frame.com_packet.extended_com_id(), expected_com_id);
        assert_eq!(frame.packet.session(), scope.expected());
        assert!(frame.body().len() <= buffer.len() - FRAME_HEADER_LEN);
        assert_eq!(frame.body().len() as u64, u64::from(frame.sub_packet.length()));
    }
});
