//! Level 0 Discovery.
//!
//! The discovery blob is a 48-byte header followed by Feature Descriptors:
//!
//! ```text
//! +---------------------------+
//! | parameter data length u32 |  counts everything after itself
//! | data structure version u32|  must be 1
//! | reserved [8]              |
//! | vendor specific [32]      |
//! +---------------------------+
//! | code u16 | ver:4 rsv:4 | length u8 | body (length bytes) |  repeated
//! ```
//!
//! Descriptors are parsed from their own body and the scan always advances
//! by the declared length, so unknown codes and longer future layouts are
//! skipped cleanly.
//!
//! Parsing never logs. Conditions worth a warning (clamped lists, unknown
//! codes) are collected in [`DiscoveredCapabilities::notes`] for the caller.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use zerocopy::{
    FromBytes, Immutable, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32, U64},
};

use crate::{
    errors::{ProtocolError, Result},
    frame::PayloadReader,
    uid::Ssc,
};

/// The only data structure version understood.
pub const SUPPORTED_VERSION: u32 = 1;

/// ComIDs kept per SSC descriptor.
pub const MAX_COM_IDS: usize = 2;
/// Logical ports kept.
pub const MAX_LOGICAL_PORTS: usize = 20;
/// Secure Messaging SP UIDs kept.
pub const MAX_SECURE_MESSAGING_SPS: usize = 2;
/// Secure Messaging cipher suites kept.
pub const MAX_CIPHER_SUITES: usize = 20;

/// Feature codes.
pub mod feature {
    /// Padding; skipped
    pub const EMPTY: u16 = 0x0000;
    /// TPer
    pub const TPER: u16 = 0x0001;
    /// Locking
    pub const LOCKING: u16 = 0x0002;
    /// Geometry reporting
    pub const GEOMETRY: u16 = 0x0003;
    /// Secure Messaging
    pub const SECURE_MESSAGING: u16 = 0x0004;
    /// Enterprise SSC
    pub const ENTERPRISE_SSC: u16 = 0x0100;
    /// Opal SSC
    pub const OPAL_SSC: u16 = 0x0200;
    /// Single User Mode
    pub const SINGLE_USER_MODE: u16 = 0x0201;
    /// Additional DataStore tables
    pub const DATASTORE: u16 = 0x0202;
    /// Opal SSC v2.00
    pub const OPAL_SSC_V2: u16 = 0x0203;
    /// Vendor logical ports
    pub const LOGICAL_PORT: u16 = 0xC001;
    /// Vendor activation
    pub const ACTIVATION: u16 = 0xC004;
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DiscoveryHeader {
    parameter_data_length: U32,
    data_structure_version: U32,
    reserved: [u8; 8],
    vendor: [u8; 32],
}

/// Discovery header length.
pub const DISCOVERY_HEADER_LEN: usize = size_of::<DiscoveryHeader>();

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FeatureHeader {
    code: U16,
    version: u8,
    length: u8,
}

const FEATURE_HEADER_LEN: usize = size_of::<FeatureHeader>();

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SscBody {
    base_com_id: U16,
    com_id_count: U16,
    range_crossing: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct OpalV2Body {
    ssc: SscBody,
    admin_authorities: U16,
    user_authorities: U16,
    initial_sid_pin: u8,
    sid_pin_on_revert: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SingleUserModeBody {
    locking_objects: U32,
    flags: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DataStoreBody {
    reserved: [u8; 2],
    max_tables: U16,
    max_total_size: U32,
    size_alignment: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct GeometryBody {
    align: u8,
    reserved: [u8; 7],
    logical_block_size: U32,
    alignment_granularity: U64,
    lowest_aligned_lba: U64,
}

fn layout<T: FromBytes + KnownLayout + Immutable>(feature: &'static str, body: &[u8]) -> Result<T> {
    T::read_from_prefix(body)
        .map(|(value, _)| value)
        .map_err(|_| ProtocolError::DescriptorTruncated { feature, length: body.len(), needed: size_of::<T>() })
}

bitflags! {
    /// TPer feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TperFeatures: u8 {
        /// Synchronous protocol
        const SYNC = 0x01;
        /// Asynchronous protocol
        const ASYNC = 0x02;
        /// ACK/NAK
        const ACK_NAK = 0x04;
        /// Buffer management
        const BUFFER_MANAGEMENT = 0x08;
        /// Streaming
        const STREAMING = 0x10;
        /// ComID management
        const COM_ID_MANAGEMENT = 0x40;
    }
}

bitflags! {
    /// Locking feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LockingFeatures: u8 {
        /// Locking SP present
        const LOCKING_SUPPORTED = 0x01;
        /// Locking SP activated
        const LOCKING_ENABLED = 0x02;
        /// At least one range locked
        const LOCKED = 0x04;
        /// Media is encrypted
        const MEDIA_ENCRYPTION = 0x08;
        /// Shadow MBR enabled
        const MBR_ENABLED = 0x10;
        /// Shadow MBR done
        const MBR_DONE = 0x20;
    }
}

bitflags! {
    /// Single User Mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SingleUserModeFlags: u8 {
        /// At least one range is in single user mode
        const ANY = 0x01;
        /// Every range is in single user mode
        const ALL = 0x02;
        /// Range start/length owned by admins
        const POLICY = 0x04;
    }
}

bitflags! {
    /// Secure Messaging bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SecureMessagingFlags: u8 {
        /// Session resumption
        const SESSION_RESUMPTION = 0x04;
        /// Compression
        const COMPRESSION = 0x08;
        /// Renegotiation
        const RENEGOTIATION = 0x10;
        /// Server certificate
        const SERVER_CERTIFICATE = 0x20;
        /// Certificate request
        const CERTIFICATE_REQUEST = 0x40;
        /// Secure messaging activated
        const ACTIVATED = 0x80;
    }
}

/// Enterprise, Opal or Opal v2 SSC descriptor fields shared by all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SscFeature {
    /// First ComID
    pub base_com_id: u16,
    /// Number of ComIDs as reported
    pub com_id_count: u16,
    /// Whether commands may span locking ranges
    pub range_crossing: bool,
}

/// Opal SSC v2.00 descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpalV2Feature {
    /// Shared SSC fields
    pub ssc: SscFeature,
    /// LockingSP admin authorities supported
    pub admin_authorities: u16,
    /// LockingSP user authorities supported
    pub user_authorities: u16,
    /// Initial C_PIN_SID PIN indicator
    pub initial_sid_pin_indicator: u8,
    /// C_PIN_SID PIN behavior on TPer revert
    pub sid_pin_revert_behavior: u8,
}

/// Single User Mode descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SingleUserMode {
    /// Locking objects supported
    pub locking_objects: u32,
    /// Any/All/Policy
    pub flags: SingleUserModeFlags,
}

/// DataStore table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataStoreFeature {
    /// Maximum number of DataStore tables
    pub max_tables: u16,
    /// Maximum combined size in bytes
    pub max_total_size: u32,
    /// Table size alignment in bytes
    pub size_alignment: u32,
}

/// Geometry descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geometry {
    /// Ranges must be aligned
    pub alignment_required: bool,
    /// Logical block size in bytes
    pub logical_block_size: u32,
    /// Alignment granularity in blocks
    pub alignment_granularity: u64,
    /// Lowest aligned LBA
    pub lowest_aligned_lba: u64,
}

/// Secure Messaging descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecureMessaging {
    /// Feature bits
    pub flags: SecureMessagingFlags,
    /// SP UIDs, at most [`MAX_SECURE_MESSAGING_SPS`]
    pub sps: Vec<u64>,
    /// Cipher suites, at most [`MAX_CIPHER_SUITES`]
    pub cipher_suites: Vec<u32>,
}

/// One logical port record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPort {
    /// Port identifier
    pub id: u32,
    /// Whether the port is locked
    pub locked: bool,
}

/// Session limits reported by the Properties method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionLimits {
    /// `MaxPacketSize`
    pub max_packet_size: u64,
    /// `MaxComPacketSize`
    pub max_com_packet_size: u64,
    /// `MaxResponseComPacketSize`
    pub max_response_com_packet_size: u64,
    /// `MaxAuthentications`
    pub max_authentications: u64,
    /// `DefSessionTimeout`
    pub default_session_timeout: u64,
    /// `MaxSessionTimeout`
    pub max_session_timeout: u64,
    /// `MinSessionTimeout`
    pub min_session_timeout: u64,
}

/// Something the parser accepted but a caller may want to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryNote {
    /// More ComIDs reported than kept
    ComIdsClamped {
        /// Count the device reported
        reported: u16,
    },
    /// More logical ports reported than kept
    LogicalPortsClamped {
        /// Records in the descriptor
        reported: usize,
    },
    /// More Secure Messaging SPs reported than kept
    SecureMessagingSpsClamped {
        /// Count the device reported
        reported: u16,
    },
    /// More cipher suites reported than kept
    CipherSuitesClamped {
        /// Count the device reported
        reported: u16,
    },
    /// Feature code this parser does not know
    UnknownFeature {
        /// Feature code
        code: u16,
        /// Body length skipped
        length: u8,
    },
}

/// Everything learned about a device before and during session setup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveredCapabilities {
    /// Header data structure version
    pub data_structure_version: u32,
    /// Drive security life-cycle state from the vendor header bytes
    pub life_cycle_state: Option<u8>,
    /// TPer descriptor
    pub tper: Option<TperFeatures>,
    /// Locking descriptor
    pub locking: Option<LockingFeatures>,
    /// Enterprise SSC descriptor
    pub enterprise: Option<SscFeature>,
    /// Opal SSC descriptor
    pub opal: Option<SscFeature>,
    /// Opal SSC v2.00 descriptor
    pub opal_v2: Option<OpalV2Feature>,
    /// ComID count of the last SSC descriptor seen, as reported
    pub com_id_count: u16,
    /// ComIDs derived from the last SSC descriptor, at most [`MAX_COM_IDS`]
    pub com_ids: Vec<u16>,
    /// Range crossing of the last SSC descriptor seen
    pub range_crossing: bool,
    /// Single User Mode descriptor
    pub single_user_mode: Option<SingleUserMode>,
    /// DataStore table descriptor
    pub data_store: Option<DataStoreFeature>,
    /// Geometry descriptor
    pub geometry: Option<Geometry>,
    /// Secure Messaging descriptor
    pub secure_messaging: Option<SecureMessaging>,
    /// Logical ports, at most [`MAX_LOGICAL_PORTS`]
    pub logical_ports: Option<Vec<LogicalPort>>,
    /// Activation descriptor present
    pub activation: bool,
    /// Filled by the Properties method after discovery
    pub limits: SessionLimits,
    /// Accepted anomalies
    pub notes: Vec<DiscoveryNote>,
}

impl DiscoveredCapabilities {
    /// Parse a Level 0 Discovery blob.
    ///
    /// Bytes past the declared parameter length are ignored.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let (header, _) = DiscoveryHeader::read_from_prefix(blob).map_err(|_| ProtocolError::DiscoveryTruncated {
            declared: DISCOVERY_HEADER_LEN,
            available: blob.len(),
        })?;

        let version = header.data_structure_version.get();
        if version != SUPPORTED_VERSION {
            return Err(ProtocolError::UnsupportedDiscoveryVersion(version));
        }

        let end = 4 + header.parameter_data_length.get() as usize;
        if end > blob.len() || end < DISCOVERY_HEADER_LEN {
            return Err(ProtocolError::DiscoveryTruncated { declared: end, available: blob.len() });
        }

        let mut caps = Self {
            data_structure_version: version,
            life_cycle_state: (header.vendor[0] == 0x01).then_some(header.vendor[1]),
            ..Self::default()
        };

        let mut pos = DISCOVERY_HEADER_LEN;
        while pos < end {
            let (feature, _) = FeatureHeader::read_from_prefix(&blob[pos..end]).map_err(|_| {
                ProtocolError::DiscoveryTruncated { declared: end, available: pos + FEATURE_HEADER_LEN }
            })?;
            let body_start = pos + FEATURE_HEADER_LEN;
            let body_end = body_start + usize::from(feature.length);
            if body_end > end {
                return Err(ProtocolError::DiscoveryTruncated { declared: body_end, available: end });
            }
            caps.apply(feature.code.get(), &blob[body_start..body_end])?;
            pos = body_end;
        }

        Ok(caps)
    }

    fn apply(&mut self, code: u16, body: &[u8]) -> Result<()> {
        match code {
            feature::EMPTY => {},
            feature::TPER => {
                let flags = *body.first().ok_or_else(|| truncated("TPer", body, 1))?;
                self.tper = Some(TperFeatures::from_bits_truncate(flags));
            },
            feature::LOCKING => {
                let flags = *body.first().ok_or_else(|| truncated("Locking", body, 1))?;
                self.locking = Some(LockingFeatures::from_bits_truncate(flags));
            },
            feature::GEOMETRY => {
                let raw: GeometryBody = layout("Geometry", body)?;
                self.geometry = Some(Geometry {
                    alignment_required: raw.align & 0x01 != 0,
                    logical_block_size: raw.logical_block_size.get(),
                    alignment_granularity: raw.alignment_granularity.get(),
                    lowest_aligned_lba: raw.lowest_aligned_lba.get(),
                });
            },
            feature::SECURE_MESSAGING => self.secure_messaging = Some(self.parse_secure_messaging(body)?),
            feature::ENTERPRISE_SSC => {
                let raw: SscBody = layout("Enterprise SSC", body)?;
                self.enterprise = Some(self.record_ssc(raw));
            },
            feature::OPAL_SSC => {
                let raw: SscBody = layout("Opal SSC", body)?;
                self.opal = Some(self.record_ssc(raw));
            },
            feature::OPAL_SSC_V2 => {
                let raw: OpalV2Body = layout("Opal SSC v2", body)?;
                self.opal_v2 = Some(OpalV2Feature {
                    ssc: self.record_ssc(raw.ssc),
                    admin_authorities: raw.admin_authorities.get(),
                    user_authorities: raw.user_authorities.get(),
                    initial_sid_pin_indicator: raw.initial_sid_pin,
                    sid_pin_revert_behavior: raw.sid_pin_on_revert,
                });
            },
            feature::SINGLE_USER_MODE => {
                let raw: SingleUserModeBody = layout("Single User Mode", body)?;
                self.single_user_mode = Some(SingleUserMode {
                    locking_objects: raw.locking_objects.get(),
                    flags: SingleUserModeFlags::from_bits_truncate(raw.flags),
                });
            },
            feature::DATASTORE => {
                let raw: DataStoreBody = layout("DataStore", body)?;
                self.data_store = Some(DataStoreFeature {
                    max_tables: raw.max_tables.get(),
                    max_total_size: raw.max_total_size.get(),
                    size_alignment: raw.size_alignment.get(),
                });
            },
            feature::LOGICAL_PORT => self.logical_ports = Some(self.parse_logical_ports(body)),
            feature::ACTIVATION => self.activation = true,
            code => self.notes.push(DiscoveryNote::UnknownFeature { code, length: body.len() as u8 }),
        }
        Ok(())
    }

    fn record_ssc(&mut self, raw: SscBody) -> SscFeature {
        let ssc = SscFeature {
            base_com_id: raw.base_com_id.get(),
            com_id_count: raw.com_id_count.get(),
            range_crossing: raw.range_crossing & 0x01 != 0,
        };
        if usize::from(ssc.com_id_count) > MAX_COM_IDS {
            self.notes.push(DiscoveryNote::ComIdsClamped { reported: ssc.com_id_count });
        }
        let kept = usize::from(ssc.com_id_count).min(MAX_COM_IDS) as u16;
        self.com_id_count = ssc.com_id_count;
        self.com_ids = (0..kept).map(|i| ssc.base_com_id.wrapping_add(i)).collect();
        self.range_crossing = ssc.range_crossing;
        ssc
    }

    fn parse_logical_ports(&mut self, body: &[u8]) -> Vec<LogicalPort> {
        let records = body.chunks_exact(8);
        let reported = records.len();
        if reported > MAX_LOGICAL_PORTS {
            self.notes.push(DiscoveryNote::LogicalPortsClamped { reported });
        }
        records
            .take(MAX_LOGICAL_PORTS)
            .map(|record| LogicalPort {
                id: u32::from_be_bytes([record[0], record[1], record[2], record[3]]),
                locked: record[4] != 0,
            })
            .collect()
    }

    fn parse_secure_messaging(&mut self, body: &[u8]) -> Result<SecureMessaging> {
        let as_truncated = |err| match err {
            ProtocolError::BufferUnderrun { offset, needed } => {
                truncated("Secure Messaging", body, offset + needed)
            },
            other => other,
        };
        let mut reader = PayloadReader::new(body);
        let flags = SecureMessagingFlags::from_bits_truncate(reader.read_u8().map_err(as_truncated)?);
        reader.skip(3).map_err(as_truncated)?;

        let sp_count = reader.read_u16().map_err(as_truncated)?;
        if usize::from(sp_count) > MAX_SECURE_MESSAGING_SPS {
            self.notes.push(DiscoveryNote::SecureMessagingSpsClamped { reported: sp_count });
        }
        let mut sps = Vec::with_capacity(MAX_SECURE_MESSAGING_SPS);
        for i in 0..usize::from(sp_count) {
            let sp = reader.read_u64().map_err(as_truncated)?;
            if i < MAX_SECURE_MESSAGING_SPS {
                sps.push(sp);
            }
        }

        let suite_count = reader.read_u16().map_err(as_truncated)?;
        if usize::from(suite_count) > MAX_CIPHER_SUITES {
            self.notes.push(DiscoveryNote::CipherSuitesClamped { reported: suite_count });
        }
        let mut cipher_suites = Vec::with_capacity(MAX_CIPHER_SUITES);
        for i in 0..usize::from(suite_count) {
            let suite = reader.read_u32().map_err(as_truncated)?;
            if i < MAX_CIPHER_SUITES {
                cipher_suites.push(suite);
            }
        }

        Ok(SecureMessaging { flags, sps, cipher_suites })
    }

    fn common_requirements(&self) -> bool {
        let tper = self.tper.unwrap_or_default();
        let locking = self.locking.unwrap_or_default();
        self.data_structure_version == SUPPORTED_VERSION
            && self.tper.is_some()
            && self.locking.is_some()
            && tper.contains(TperFeatures::SYNC | TperFeatures::STREAMING)
            && locking.contains(LockingFeatures::LOCKING_SUPPORTED | LockingFeatures::MEDIA_ENCRYPTION)
    }

    /// Opal SSC drive.
    pub fn is_opal(&self) -> bool {
        self.common_requirements() && self.opal.is_some() && self.com_id_count >= 1
    }

    /// Opal SSC v2.00 drive with at least 4 admin and 8 user authorities.
    pub fn is_opal_v2(&self) -> bool {
        self.common_requirements()
            && self.com_id_count >= 1
            && self.opal_v2.is_some_and(|v2| v2.admin_authorities >= 4 && v2.user_authorities >= 8)
    }

    /// Enterprise SSC drive with at least two ComIDs.
    pub fn is_enterprise(&self) -> bool {
        self.common_requirements() && self.enterprise.is_some() && self.com_id_count >= 2
    }

    /// Opal (v1 or v2) drive reporting Single User Mode.
    pub fn single_user_mode_supported(&self) -> bool {
        (self.is_opal() || self.is_opal_v2()) && self.single_user_mode.is_some()
    }

    /// SSC family to drive the device with, if any.
    pub fn ssc(&self) -> Option<Ssc> {
        if self.is_opal() || self.is_opal_v2() {
            Some(Ssc::Opal)
        } else if self.is_enterprise() {
            Some(Ssc::Enterprise)
        } else {
            None
        }
    }

    /// Extended ComID of the first reported ComID.
    pub fn extended_com_id(&self) -> Option<u32> {
        self.com_ids.first().map(|&com_id| u32::from(com_id) << 16)
    }
}

fn truncated(feature: &'static str, body: &[u8], needed: usize) -> ProtocolError {
    ProtocolError::DescriptorTruncated { feature, length: body.len(), needed }
}
