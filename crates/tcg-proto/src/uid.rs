//! Object and method identifiers.
//!
//! Every addressable entity on a TCG device (security provider, table row,
//! authority, method) is named by an 8-byte UID. The concrete value depends on
//! the active Security Subsystem Class: Opal and Enterprise assign different
//! UIDs to the same logical method or object, so every lookup takes an
//! [`Ssc`].
//!
//! Names are closed enums. An identifier outside a table's range (a band
//! number above 1023, `User17`) is a usage error, never a silently wrong UID.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Highest band (locking range) number.
pub const MAX_BAND: u16 = 1023;

/// 8-byte object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid([u8; 8]);

impl Uid {
    /// Session manager object.
    pub const SESSION_MANAGER: Self = Self::from_u64(0x0000_0000_0000_00FF);
    /// The SP the current session is open to.
    pub const THIS_SP: Self = Self::from_u64(0x0000_0000_0000_0001);

    /// UID from its big-endian integer form.
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// UID from exactly eight bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| ProtocolError::InvalidUidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Big-endian integer form.
    pub const fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.to_u64())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

/// Security Subsystem Class.
///
/// Decides which UIDs are used and how table columns are addressed: Opal by
/// integer column id, Enterprise by column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ssc {
    /// TCG Enterprise SSC
    Enterprise,
    /// TCG Opal SSC (v1 and v2)
    Opal,
}

impl Ssc {
    /// Whether table columns are addressed by integer id.
    pub const fn uses_column_ids(self) -> bool {
        matches!(self, Self::Opal)
    }
}

impl fmt::Display for Ssc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enterprise => "Enterprise",
            Self::Opal => "Opal",
        })
    }
}

/// Methods the engine invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Exchange host and TPer communication limits
    Properties,
    /// Open a session
    StartSession,
    /// TPer reply to StartSession
    SyncSession,
    /// Open a TLS-PSK session
    StartTlsSession,
    /// TPer reply to StartTlsSession
    SyncTlsSession,
    /// Session manager CloseSession
    CloseSession,
    /// Prove knowledge of an authority credential
    Authenticate,
    /// Read table cells
    Get,
    /// Write table cells
    Set,
    /// Regenerate a media encryption key
    GenKey,
    /// Cryptographically erase a band
    Erase,
    /// Activate an SP from Manufactured-Inactive
    Activate,
    /// Re-run activation with a new configuration
    Reactivate,
    /// Revert an SP to factory state
    RevertSp,
    /// Ask the TPer for random bytes
    Random,
}

impl Method {
    /// Method UID under the given SSC.
    pub const fn uid(self, ssc: Ssc) -> Uid {
        let value = match (self, ssc) {
            (Self::Properties, _) => 0x0000_0000_0000_FF01,
            (Self::StartSession, _) => 0x0000_0000_0000_FF02,
            (Self::SyncSession, _) => 0x0000_0000_0000_FF03,
            (Self::StartTlsSession, _) => 0x0000_0000_0000_FF12,
            (Self::SyncTlsSession, _) => 0x0000_0000_0000_FF13,
            (Self::CloseSession, _) => 0x0000_0000_0000_FF06,
            (Self::Authenticate, Ssc::Opal) => 0x0000_0006_0000_001C,
            (Self::Authenticate, Ssc::Enterprise) => 0x0000_0006_0000_000C,
            (Self::Get, Ssc::Opal) => 0x0000_0006_0000_0016,
            (Self::Get, Ssc::Enterprise) => 0x0000_0006_0000_0006,
            (Self::Set, Ssc::Opal) => 0x0000_0006_0000_0017,
            (Self::Set, Ssc::Enterprise) => 0x0000_0006_0000_0007,
            (Self::GenKey, _) => 0x0000_0006_0000_0010,
            (Self::Erase, _) => 0x0000_0006_0000_0803,
            (Self::Activate, _) => 0x0000_0006_0000_0203,
            (Self::Reactivate, _) => 0x0000_0006_0000_0801,
            (Self::RevertSp, _) => 0x0000_0006_0000_0011,
            (Self::Random, _) => 0x0000_0006_0000_0601,
        };
        Uid::from_u64(value)
    }

    /// Method name for logs and error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Properties => "Properties",
            Self::StartSession => "StartSession",
            Self::SyncSession => "SyncSession",
            Self::StartTlsSession => "StartTlsSession",
            Self::SyncTlsSession => "SyncTlsSession",
            Self::CloseSession => "CloseSession",
            Self::Authenticate => "Authenticate",
            Self::Get => "Get",
            Self::Set => "Set",
            Self::GenKey => "GenKey",
            Self::Erase => "Erase",
            Self::Activate => "Activate",
            Self::Reactivate => "Reactivate",
            Self::RevertSp => "RevertSP",
            Self::Random => "Random",
        }
    }

    /// Whether the response repeats the `Call, SMUID, method` prefix.
    ///
    /// Session-manager methods answer with a call of their own; every other
    /// method answers with a bare result list.
    pub const fn response_has_call_prefix(self) -> bool {
        matches!(self, Self::Properties | Self::StartSession | Self::StartTlsSession)
    }

    /// Method UID the response prefix must carry.
    pub const fn response_method(self) -> Self {
        match self {
            Self::StartSession => Self::SyncSession,
            Self::StartTlsSession => Self::SyncTlsSession,
            other => other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Security providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityProvider {
    /// Administrative SP
    Admin,
    /// Locking SP
    Locking,
}

impl SecurityProvider {
    /// SP UID under the given SSC.
    pub const fn uid(self, ssc: Ssc) -> Uid {
        Uid::from_u64(match (self, ssc) {
            (Self::Admin, _) => 0x0000_0205_0000_0001,
            (Self::Locking, Ssc::Opal) => 0x0000_0205_0000_0002,
            (Self::Locking, Ssc::Enterprise) => 0x0000_0205_0001_0001,
        })
    }
}

impl fmt::Display for SecurityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Admin => "AdminSP",
            Self::Locking => "LockingSP",
        })
    }
}

/// Authorities.
///
/// Numbered authorities carry their index: `BandMaster(0..=15)`,
/// `User(1..=16)`, `Admin(1..=4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Authority {
    /// Unauthenticated
    Anybody,
    /// Maker symmetric key authority
    MakerSymK,
    /// Security identifier (drive owner)
    Sid,
    /// Manufactured security identifier
    Msid,
    /// Physical security identifier (printed on label)
    Psid,
    /// Enterprise erase authority
    EraseMaster,
    /// Enterprise per-band authority
    BandMaster(u16),
    /// Opal user authority
    User(u16),
    /// Opal admin authority
    Admin(u16),
}

impl Authority {
    /// Authority that owns a band under the given SSC.
    pub const fn for_band(ssc: Ssc, band: u16) -> Self {
        match ssc {
            Ssc::Enterprise => Self::BandMaster(band),
            Ssc::Opal => Self::Admin(1),
        }
    }

    /// Authority row UID.
    pub fn uid(self) -> Result<Uid> {
        let value = match self {
            Self::Anybody => 0x0000_0009_0000_0001,
            Self::MakerSymK => 0x0000_0009_0000_0004,
            Self::Sid => 0x0000_0009_0000_0006,
            Self::Msid => 0x0000_0009_0000_8402,
            Self::Psid => 0x0000_0009_0001_FF01,
            Self::EraseMaster => 0x0000_0009_0000_8401,
            Self::BandMaster(n) if n <= 15 => 0x0000_0009_0000_8001 + u64::from(n),
            Self::User(n) if (1..=16).contains(&n) => 0x0000_0009_0003_0000 + u64::from(n),
            Self::Admin(n) if (1..=4).contains(&n) => 0x0000_0009_0001_0000 + u64::from(n),
            _ => return Err(self.unknown("authority")),
        };
        Ok(Uid::from_u64(value))
    }

    /// C_PIN row UID holding this authority's credential.
    pub fn credential_uid(self) -> Result<Uid> {
        let value = match self {
            Self::Sid => 0x0000_000B_0000_0001,
            Self::Msid => 0x0000_000B_0000_8402,
            Self::EraseMaster => 0x0000_000B_0000_8401,
            Self::BandMaster(n) if n <= 15 => 0x0000_000B_0000_8001 + u64::from(n),
            Self::User(n) if (1..=16).contains(&n) => 0x0000_000B_0003_0000 + u64::from(n),
            Self::Admin(n) if (1..=4).contains(&n) => 0x0000_000B_0001_0000 + u64::from(n),
            _ => return Err(self.unknown("credential")),
        };
        Ok(Uid::from_u64(value))
    }

    fn unknown(self, kind: &'static str) -> ProtocolError {
        ProtocolError::UnknownName { kind, name: self.to_string() }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anybody => f.write_str("Anybody"),
            Self::MakerSymK => f.write_str("MakerSymK"),
            Self::Sid => f.write_str("SID"),
            Self::Msid => f.write_str("MSID"),
            Self::Psid => f.write_str("PSID"),
            Self::EraseMaster => f.write_str("EraseMaster"),
            Self::BandMaster(n) => write!(f, "BandMaster{n}"),
            Self::User(n) => write!(f, "User{n}"),
            Self::Admin(n) => write!(f, "Admin{n}"),
        }
    }
}

/// Locking table row for a band.
///
/// Enterprise numbers bands consecutively from `0000080200000001`. Opal keeps
/// the global range at `0000080200000001` and places range `n` at
/// `000008020003nnnn`.
pub fn band_uid(ssc: Ssc, band: u16) -> Result<Uid> {
    check_band(band)?;
    let value = match ssc {
        Ssc::Enterprise => 0x0000_0802_0000_0001 + u64::from(band),
        Ssc::Opal if band == 0 => 0x0000_0802_0000_0001,
        Ssc::Opal => 0x0000_0802_0003_0000 + u64::from(band),
    };
    Ok(Uid::from_u64(value))
}

/// Media encryption key row for a band.
pub fn band_key_uid(band: u16) -> Result<Uid> {
    check_band(band)?;
    let value = if band == 0 { 0x0000_0806_0000_0001 } else { 0x0000_0806_0003_0000 + u64::from(band) };
    Ok(Uid::from_u64(value))
}

fn check_band(band: u16) -> Result<()> {
    if band > MAX_BAND { Err(ProtocolError::BandOutOfRange(band)) } else { Ok(()) }
}

/// Locking ports in the Enterprise/Opal Port table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    /// Vendor diagnostics port
    Diagnostics,
    /// Firmware download port
    FirmwareDownload,
    /// Unified diagnostics port
    Uds,
    /// Cross-segment firmware download port
    CrossSegmentFirmwareDownload,
    /// IEEE 1667 silo activation port
    Ieee1667Activation,
}

impl Port {
    /// Port row UID.
    pub const fn uid(self) -> Uid {
        Uid::from_u64(match self {
            Self::Diagnostics => 0x0001_0002_0001_0001,
            Self::FirmwareDownload => 0x0001_0002_0001_0002,
            Self::Uds => 0x0001_0002_0001_0003,
            Self::CrossSegmentFirmwareDownload => 0x0001_0002_0001_000E,
            Self::Ieee1667Activation => 0x0001_0002_0001_000F,
        })
    }
}

/// Tables and singleton objects outside the authority and locking tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Default DataStore table
    DataStore,
    /// Additional DataStore table `1..=16`
    DataStoreN(u8),
    /// Shadow MBR table
    Mbr,
    /// MBRControl object
    MbrControl,
    /// TPerInfo object
    TperInfo,
    /// Locking table
    Locking,
}

impl Table {
    /// Table or object UID.
    pub fn uid(self) -> Result<Uid> {
        let value = match self {
            Self::DataStore => 0x0000_8001_0000_0000,
            Self::DataStoreN(n) if (1..=16).contains(&n) => 0x0000_1000_0000_0000 + (u64::from(n) << 32),
            Self::Mbr => 0x0000_0804_0000_0000,
            Self::MbrControl => 0x0000_0803_0000_0001,
            Self::TperInfo => 0x0000_0201_0003_0001,
            Self::Locking => 0x0000_0802_0000_0000,
            Self::DataStoreN(n) => {
                return Err(ProtocolError::UnknownName { kind: "table", name: format!("DataStore{n}") });
            },
        };
        Ok(Uid::from_u64(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_display_is_upper_hex() {
        assert_eq!(Uid::SESSION_MANAGER.to_string(), "00000000000000FF");
        assert_eq!(format!("{:?}", Uid::THIS_SP), "Uid(0000000000000001)");
    }

    #[test]
    fn uid_from_slice_checks_length() {
        assert_eq!(Uid::from_slice(&[0, 0, 0, 0, 0, 0, 0, 0xFF]).unwrap(), Uid::SESSION_MANAGER);
        assert_eq!(Uid::from_slice(&[1, 2, 3]), Err(ProtocolError::InvalidUidLength(3)));
    }

    #[test]
    fn methods_differ_between_sscs() {
        assert_eq!(Method::Get.uid(Ssc::Opal).to_u64(), 0x0000_0006_0000_0016);
        assert_eq!(Method::Get.uid(Ssc::Enterprise).to_u64(), 0x0000_0006_0000_0006);
        assert_eq!(Method::Authenticate.uid(Ssc::Opal).to_u64(), 0x0000_0006_0000_001C);
        assert_eq!(Method::StartSession.uid(Ssc::Opal), Method::StartSession.uid(Ssc::Enterprise));
    }

    #[test]
    fn locking_sp_depends_on_ssc() {
        assert_eq!(SecurityProvider::Locking.uid(Ssc::Opal).to_u64(), 0x0000_0205_0000_0002);
        assert_eq!(SecurityProvider::Locking.uid(Ssc::Enterprise).to_u64(), 0x0000_0205_0001_0001);
        assert_eq!(SecurityProvider::Admin.uid(Ssc::Opal), SecurityProvider::Admin.uid(Ssc::Enterprise));
    }

    #[test]
    fn band_rows() {
        assert_eq!(band_uid(Ssc::Enterprise, 0).unwrap().to_u64(), 0x0000_0802_0000_0001);
        assert_eq!(band_uid(Ssc::Enterprise, 1).unwrap().to_u64(), 0x0000_0802_0000_0002);
        assert_eq!(band_uid(Ssc::Opal, 0).unwrap().to_u64(), 0x0000_0802_0000_0001);
        assert_eq!(band_uid(Ssc::Opal, 5).unwrap().to_u64(), 0x0000_0802_0003_0005);
        assert_eq!(band_key_uid(0).unwrap().to_u64(), 0x0000_0806_0000_0001);
        assert_eq!(band_key_uid(2).unwrap().to_u64(), 0x0000_0806_0003_0002);
        assert_eq!(band_uid(Ssc::Opal, 1024), Err(ProtocolError::BandOutOfRange(1024)));
        assert_eq!(band_key_uid(1024), Err(ProtocolError::BandOutOfRange(1024)));
    }

    #[test]
    fn authority_rows() {
        assert_eq!(Authority::Sid.uid().unwrap().to_u64(), 0x0000_0009_0000_0006);
        assert_eq!(Authority::Sid.credential_uid().unwrap().to_u64(), 0x0000_000B_0000_0001);
        assert_eq!(Authority::BandMaster(3).uid().unwrap().to_u64(), 0x0000_0009_0000_8004);
        assert_eq!(Authority::User(16).credential_uid().unwrap().to_u64(), 0x0000_000B_0003_0010);
        assert_eq!(Authority::Admin(1).uid().unwrap().to_u64(), 0x0000_0009_0001_0001);
    }

    #[test]
    fn authority_table() {
        let rows: Vec<String> = [
            Authority::Anybody,
            Authority::MakerSymK,
            Authority::Sid,
            Authority::Msid,
            Authority::Psid,
            Authority::EraseMaster,
            Authority::BandMaster(1),
            Authority::User(1),
            Authority::Admin(1),
        ]
        .into_iter()
        .map(|authority| format!("{:<12}{}", authority.to_string(), authority.uid().unwrap()))
        .collect();

        insta::assert_snapshot!(rows.join("\n"), @r"
        Anybody     0000000900000001
        MakerSymK   0000000900000004
        SID         0000000900000006
        MSID        0000000900008402
        PSID        000000090001FF01
        EraseMaster 0000000900008401
        BandMaster1 0000000900008002
        User1       0000000900030001
        Admin1      0000000900010001
        ");
    }

    #[test]
    fn out_of_range_authorities_are_rejected() {
        let err = Authority::User(17).uid().unwrap_err();
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "unknown authority: User17");
        assert!(Authority::Admin(0).uid().is_err());
        assert!(Authority::BandMaster(16).credential_uid().is_err());
        assert!(Authority::Psid.credential_uid().is_err());
    }

    #[test]
    fn table_rows() {
        assert_eq!(Table::DataStore.uid().unwrap().to_u64(), 0x0000_8001_0000_0000);
        assert_eq!(Table::DataStoreN(1).uid().unwrap().to_u64(), 0x0000_1001_0000_0000);
        assert_eq!(Table::DataStoreN(16).uid().unwrap().to_u64(), 0x0000_1010_0000_0000);
        assert!(Table::DataStoreN(17).uid().is_err());
        assert_eq!(Port::Ieee1667Activation.uid().to_u64(), 0x0001_0002_0001_000F);
    }
}
