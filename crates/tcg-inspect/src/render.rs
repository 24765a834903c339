//! Text rendering of discovery records and frames.

use std::io::Write;

use tcg_core::TcgError;
use tcg_proto::{
    DiscoveredCapabilities, FrameScope, PayloadReader, ReceivedFrame, SessionIds, Token,
    discovery::SscFeature,
    frame::{COM_PACKET_HEADER_LEN, ComPacketHeader, Flow, Item},
    token::Atom,
};

use crate::InspectError;

const INDENT: &str = "  ";

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn ssc_line(ssc: &SscFeature) -> String {
    format!(
        "base ComID 0x{:04X}, {} ComID(s), range crossing {}",
        ssc.base_com_id,
        ssc.com_id_count,
        yes_no(ssc.range_crossing)
    )
}

/// Every descriptor the parser kept, then the classification.
pub fn discovery(out: &mut impl Write, caps: &DiscoveredCapabilities) -> Result<(), InspectError> {
    writeln!(out, "Level 0 Discovery, data structure version {}", caps.data_structure_version)?;
    match caps.life_cycle_state {
        Some(state) => writeln!(out, "life cycle state: 0x{state:02X}")?,
        None => writeln!(out, "life cycle state: not reported")?,
    }

    if let Some(tper) = caps.tper {
        writeln!(out, "TPer: {tper:?}")?;
    }
    if let Some(locking) = caps.locking {
        writeln!(out, "Locking: {locking:?}")?;
    }
    if let Some(geometry) = &caps.geometry {
        writeln!(
            out,
            "Geometry: block size {}, granularity {}, lowest aligned LBA {}, alignment required {}",
            geometry.logical_block_size,
            geometry.alignment_granularity,
            geometry.lowest_aligned_lba,
            yes_no(geometry.alignment_required)
        )?;
    }
    if let Some(enterprise) = &caps.enterprise {
        writeln!(out, "Enterprise SSC: {}", ssc_line(enterprise))?;
    }
    if let Some(opal) = &caps.opal {
        writeln!(out, "Opal SSC: {}", ssc_line(opal))?;
    }
    if let Some(v2) = &caps.opal_v2 {
        writeln!(
            out,
            "Opal SSC v2: {}, {} admins, {} users, initial SID PIN {}, SID PIN on revert {}",
            ssc_line(&v2.ssc),
            v2.admin_authorities,
            v2.user_authorities,
            v2.initial_sid_pin_indicator,
            v2.sid_pin_revert_behavior
        )?;
    }
    if let Some(sum) = &caps.single_user_mode {
        writeln!(out, "Single User Mode: {} locking objects, {:?}", sum.locking_objects, sum.flags)?;
    }
    if let Some(store) = &caps.data_store {
        writeln!(
            out,
            "DataStore: {} tables, {} bytes total, alignment {}",
            store.max_tables, store.max_total_size, store.size_alignment
        )?;
    }
    if let Some(messaging) = &caps.secure_messaging {
        writeln!(
            out,
            "Secure Messaging: {:?}, SPs {:X?}, cipher suites {:X?}",
            messaging.flags, messaging.sps, messaging.cipher_suites
        )?;
    }
    if let Some(ports) = &caps.logical_ports {
        writeln!(out, "Logical ports:")?;
        for port in ports {
            writeln!(out, "{INDENT}0x{:08X} {}", port.id, if port.locked { "locked" } else { "unlocked" })?;
        }
    }
    if caps.activation {
        writeln!(out, "Activation: reported")?;
    }

    let com_ids: Vec<String> = caps.com_ids.iter().map(|com_id| format!("0x{com_id:04X}")).collect();
    writeln!(out, "ComIDs: [{}]", com_ids.join(", "))?;
    writeln!(
        out,
        "Classification: enterprise {}, opal {}, opal v2 {}, single user mode {}",
        yes_no(caps.is_enterprise()),
        yes_no(caps.is_opal()),
        yes_no(caps.is_opal_v2()),
        yes_no(caps.single_user_mode_supported())
    )?;
    match caps.ssc() {
        Some(ssc) => writeln!(out, "SSC: {ssc}")?,
        None => writeln!(out, "SSC: unsupported")?,
    }
    for note in &caps.notes {
        writeln!(out, "note: {note:?}")?;
    }
    Ok(())
}

/// Headers of a ComPacket, then its token stream.
///
/// A ComPacket without data prints its header and what the receive loop
/// would do with it.
pub fn payload(out: &mut impl Write, data: &[u8], com_id: Option<u32>) -> Result<(), InspectError> {
    let header = ComPacketHeader::peek(data).map_err(TcgError::from)?;
    writeln!(
        out,
        "ComPacket  com_id=0x{:08X} outstanding={} min_transfer={} length={}",
        header.extended_com_id(),
        header.outstanding_data(),
        header.min_transfer(),
        header.length()
    )?;
    let flow = header.flow();
    if flow != Flow::Ready {
        writeln!(out, "no data: {flow:?}")?;
        return Ok(());
    }

    let frame = parse_frame(data, com_id.unwrap_or_else(|| header.extended_com_id()))?;
    let session = frame.packet.session();
    writeln!(
        out,
        "Packet     tper=0x{:X} host=0x{:X} sequence={} length={}",
        session.tper,
        session.host,
        frame.packet.sequence_number(),
        frame.packet.length()
    )?;
    writeln!(out, "SubPacket  kind={} length={}", frame.sub_packet.kind(), frame.sub_packet.length())?;
    tokens(out, frame.body())
}

/// Validate all three headers, addressed to whatever session the Packet
/// header names.
fn parse_frame(data: &[u8], com_id: u32) -> Result<ReceivedFrame<'_>, TcgError> {
    let mut ids = PayloadReader::new(data.get(COM_PACKET_HEADER_LEN..).unwrap_or_default());
    let session = SessionIds { tper: u64::from(ids.read_u32()?), host: u64::from(ids.read_u32()?) };
    let scope = if session.is_session_manager() { FrameScope::SessionManager } else { FrameScope::Session(session) };
    Ok(ReceivedFrame::parse(data, com_id, scope)?)
}

fn tokens(out: &mut impl Write, body: &[u8]) -> Result<(), InspectError> {
    let mut reader = PayloadReader::new(body);
    let mut depth = 0usize;

    while !reader.is_at_end() {
        match reader.read_item().map_err(TcgError::from)? {
            Item::Token(token) => {
                if matches!(token, Token::EndList | Token::EndName) {
                    depth = depth.saturating_sub(1);
                }
                writeln!(out, "{}{token:?}", INDENT.repeat(depth))?;
                if matches!(token, Token::StartList | Token::StartName) {
                    depth += 1;
                }
            },
            Item::Atom(atom) => writeln!(out, "{}{}", INDENT.repeat(depth), describe_atom(atom))?,
        }
    }
    Ok(())
}

fn describe_atom(atom: Atom<'_>) -> String {
    match atom {
        Atom::Integer(value) => format!("{value} (0x{value:X})"),
        Atom::Bytes(bytes) if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') => {
            format!("{:?}", String::from_utf8_lossy(bytes))
        },
        Atom::Bytes(bytes) if bytes.len() == 8 => format!("uid {}", hex::encode_upper(bytes)),
        Atom::Bytes(bytes) => format!("bytes[{}] {}", bytes.len(), hex::encode_upper(bytes)),
    }
}
