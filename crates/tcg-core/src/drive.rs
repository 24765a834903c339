//! Drive-level workflows.
//!
//! [`Drive`] wraps an [`Engine`] and runs whole operations: open a session to
//! the right SP, authenticate as the right authority, run one method, close.
//! It remembers what discovery found and the MSID credential, in memory only.
//!
//! Which authority an operation needs depends on the SSC family:
//!
//! | Operation             | SP        | Opal      | Enterprise        |
//! |-----------------------|-----------|-----------|-------------------|
//! | band range / locking  | LockingSP | Admin1    | BandMasterN       |
//! | read band settings    | LockingSP | Admin1    | none              |
//! | authority enabled     | LockingSP | Admin1    | EraseMaster (set) |
//! | erase band            | LockingSP | Admin1    | EraseMaster       |
//! | port locking, TPerInfo| AdminSP   | SID       | SID               |
//! | activate              | AdminSP   | SID       | unsupported       |
//! | factory restore       | AdminSP   | PSID      | PSID              |
//!
//! Arguments are validated before the session is opened, so a usage error
//! never leaves a session behind. A failure after that returns the first
//! error and leaves the session as it was; [`Drive::stack_reset`] recovers.

use tcg_proto::{
    Authority, ByteValue, DiscoveredCapabilities, SecurityProvider, Ssc, Uid,
    columns::{
        self, Column, ENABLED, LOCK_ON_RESET, MBR_DONE, MBR_DONE_ON_RESET, MBR_ENABLE, PIN, PORT_LOCK_ON_RESET,
        PORT_LOCKED, PROGRAMMATIC_RESET_ENABLE, RANGE_LENGTH, RANGE_START, READ_LOCK_ENABLED, READ_LOCKED,
        ResetType, WRITE_LOCK_ENABLED, WRITE_LOCKED,
    },
    uid::{Port, Table, band_uid},
};
use tracing::debug;

use crate::{
    engine::Engine,
    env::Environment,
    error::{TcgError, UsageError},
    methods::{ActivateOptions, Cell, MAX_RANDOM_BYTES, ReactivateOptions},
    transport::Transport,
};

/// Start and length of a band, in logical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandRange {
    /// First LBA
    pub start: u64,
    /// Number of blocks
    pub length: u64,
}

/// Events that re-lock a band, port or MBR shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockOnReset {
    /// Lock on power cycle
    pub power_cycle: bool,
    /// Lock on a host-issued TPer reset (Opal only)
    pub programmatic: bool,
}

impl LockOnReset {
    fn from_list(values: &[u64]) -> Self {
        Self {
            power_cycle: values.contains(&ResetType::PowerCycle.to_u64()),
            programmatic: values.contains(&ResetType::Programmatic.to_u64()),
        }
    }

    fn to_list(self, ssc: Ssc) -> Result<Vec<u64>, UsageError> {
        if self.programmatic && ssc == Ssc::Enterprise {
            return Err(UsageError::Unsupported { ssc, feature: "programmatic lock on reset" });
        }
        let mut values = Vec::new();
        if self.power_cycle {
            values.push(ResetType::PowerCycle.to_u64());
        }
        if self.programmatic {
            values.push(ResetType::Programmatic.to_u64());
        }
        Ok(values)
    }
}

/// Locking state of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandLocking {
    /// Read locking armed
    pub read_lock_enabled: bool,
    /// Write locking armed
    pub write_lock_enabled: bool,
    /// Reads currently blocked
    pub read_locked: bool,
    /// Writes currently blocked
    pub write_locked: bool,
    /// Re-lock events
    pub lock_on_reset: LockOnReset,
}

/// Changes to a band's locking state; `None` leaves a column alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandLockingUpdate {
    /// New ReadLockEnabled
    pub read_lock_enabled: Option<bool>,
    /// New WriteLockEnabled
    pub write_lock_enabled: Option<bool>,
    /// New ReadLocked
    pub read_locked: Option<bool>,
    /// New WriteLocked
    pub write_locked: Option<bool>,
    /// New LockOnReset
    pub lock_on_reset: Option<LockOnReset>,
}

/// MBR shadowing control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrControl {
    /// Shadow MBR presented to the host
    pub enable: bool,
    /// Shadowing finished for this power cycle
    pub done: bool,
    /// Events that clear `done`
    pub done_on_reset: LockOnReset,
}

/// Changes to MBR control; `None` leaves a column alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrControlUpdate {
    /// New Enable
    pub enable: Option<bool>,
    /// New Done
    pub done: Option<bool>,
    /// New DoneOnReset
    pub done_on_reset: Option<LockOnReset>,
}

/// Locking state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortLocking {
    /// Port currently locked
    pub locked: bool,
    /// Port re-locks on power cycle
    pub lock_on_power_cycle: bool,
}

/// Changes to a port; `None` leaves a column alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortLockingUpdate {
    /// New PortLocked
    pub locked: Option<bool>,
    /// New LockOnReset
    pub lock_on_power_cycle: Option<bool>,
}

/// High-level operations against one drive.
#[derive(Debug)]
pub struct Drive<T, E> {
    engine: Engine<T, E>,
    capabilities: Option<DiscoveredCapabilities>,
    msid: Option<ByteValue>,
}

impl<T: Transport, E: Environment> Drive<T, E> {
    /// Wrap an engine. Run [`Self::discover`] before anything else.
    pub fn new(engine: Engine<T, E>) -> Self {
        Self { engine, capabilities: None, msid: None }
    }

    /// Underlying engine.
    pub fn engine(&self) -> &Engine<T, E> {
        &self.engine
    }

    /// Underlying engine, mutably.
    pub fn engine_mut(&mut self) -> &mut Engine<T, E> {
        &mut self.engine
    }

    /// Consume the drive, returning the engine.
    pub fn into_engine(self) -> Engine<T, E> {
        self.engine
    }

    /// Capabilities from the last discovery.
    pub fn capabilities(&self) -> Option<&DiscoveredCapabilities> {
        self.capabilities.as_ref()
    }

    /// MSID credential read by [`Self::discover`].
    pub fn msid(&self) -> Option<&ByteValue> {
        self.msid.as_ref()
    }

    /// Level 0 Discovery, channel selection and Properties.
    ///
    /// # Errors
    /// [`TcgError::UnsupportedDevice`] when no Enterprise or Opal SSC
    /// descriptor is present.
    pub fn discover_without_msid(&mut self) -> Result<&DiscoveredCapabilities, TcgError> {
        let mut capabilities = self.engine.level0_discovery()?;
        self.engine.select_channel(&capabilities)?;
        capabilities.limits = self.engine.properties()?;
        Ok(&*self.capabilities.insert(capabilities))
    }

    /// Full discovery: [`Self::discover_without_msid`], then read the MSID
    /// credential from the Admin SP.
    pub fn discover(&mut self) -> Result<&DiscoveredCapabilities, TcgError> {
        self.discover_without_msid()?;
        let ssc = self.ssc()?;
        let msid_row = Authority::Msid.credential_uid()?;

        let msid = self.in_session(SecurityProvider::Admin, None, |engine| {
            let row = engine.get(msid_row)?;
            Ok(row.get_column_bytes(ssc, PIN)?)
        })?;
        debug!(msid_len = msid.len(), "MSID read");
        self.msid = Some(msid);

        self.capabilities.as_ref().ok_or_else(|| UsageError::NotDiscovered.into())
    }

    /// Change the PIN of `authority` on `sp`.
    ///
    /// Authenticates as `authority` with `old`, or with the MSID when `old`
    /// is `None`.
    pub fn set_pin(
        &mut self,
        sp: SecurityProvider,
        authority: Authority,
        new: &ByteValue,
        old: Option<&ByteValue>,
    ) -> Result<(), TcgError> {
        self.ssc()?;
        let row = authority.credential_uid()?;
        let old = match old {
            Some(pin) => pin.clone(),
            None => self.msid.clone().ok_or(UsageError::MissingCredential("MSID"))?,
        };

        debug!(%sp, %authority, "set PIN");
        self.in_session(sp, Some((authority, &old)), |engine| engine.set(row, &[Cell::bytes(PIN, new.clone())]))
    }

    /// Whether `authority` is enabled in the Locking SP.
    ///
    /// Opal reads as Admin1 with `pin`; Enterprise reads as `authority`.
    pub fn get_authority_enabled(&mut self, authority: Authority, pin: &ByteValue) -> Result<bool, TcgError> {
        let ssc = self.ssc()?;
        let object = authority.uid()?;
        let reader = match ssc {
            Ssc::Opal => Authority::Admin(1),
            Ssc::Enterprise => authority,
        };

        self.in_session(SecurityProvider::Locking, Some((reader, pin)), |engine| {
            let row = engine.get(object)?;
            Ok(row.get_column_int(ssc, ENABLED)? != 0)
        })
    }

    /// Enable or disable `authority` in the Locking SP.
    ///
    /// Opal writes as Admin1, Enterprise as EraseMaster.
    pub fn set_authority_enabled(
        &mut self,
        authority: Authority,
        enabled: bool,
        pin: &ByteValue,
    ) -> Result<(), TcgError> {
        let ssc = self.ssc()?;
        let object = authority.uid()?;
        let writer = match ssc {
            Ssc::Opal => Authority::Admin(1),
            Ssc::Enterprise => Authority::EraseMaster,
        };

        debug!(%authority, enabled, "set authority enabled");
        self.in_session(SecurityProvider::Locking, Some((writer, pin)), |engine| {
            engine.set(object, &[Cell::bool(ENABLED, enabled)])
        })
    }

    /// Start and length of `band`.
    pub fn get_band(&mut self, band: u16, pin: &ByteValue) -> Result<BandRange, TcgError> {
        let (ssc, object, auth) = self.band_read(band, pin)?;
        self.in_session(SecurityProvider::Locking, auth, |engine| {
            let row = engine.get(object)?;
            Ok(BandRange { start: row.get_column_int(ssc, RANGE_START)?, length: row.get_column_int(ssc, RANGE_LENGTH)? })
        })
    }

    /// Move or resize `band`.
    pub fn set_band(&mut self, band: u16, range: BandRange, pin: &ByteValue) -> Result<(), TcgError> {
        let ssc = self.ssc()?;
        let object = band_uid(ssc, band)?;

        debug!(band, start = range.start, length = range.length, "set band");
        let cells = [Cell::int(RANGE_START, range.start), Cell::int(RANGE_LENGTH, range.length)];
        self.in_session(SecurityProvider::Locking, Some((Authority::for_band(ssc, band), pin)), |engine| {
            engine.set(object, &cells)
        })
    }

    /// Locking state of `band`.
    pub fn get_band_locking(&mut self, band: u16, pin: &ByteValue) -> Result<BandLocking, TcgError> {
        let (ssc, object, auth) = self.band_read(band, pin)?;
        self.in_session(SecurityProvider::Locking, auth, |engine| {
            let mut row = engine.get(object)?;
            let flag = |column: Column| row.get_column_int(ssc, column).map(|value| value != 0);
            let read_lock_enabled = flag(READ_LOCK_ENABLED)?;
            let write_lock_enabled = flag(WRITE_LOCK_ENABLED)?;
            let read_locked = flag(READ_LOCKED)?;
            let write_locked = flag(WRITE_LOCKED)?;

            let mut lock_on_reset = LockOnReset::from_list(&row.get_column_int_list(ssc, LOCK_ON_RESET)?);
            if ssc == Ssc::Enterprise {
                lock_on_reset.programmatic = false;
            }
            Ok(BandLocking { read_lock_enabled, write_lock_enabled, read_locked, write_locked, lock_on_reset })
        })
    }

    /// Change the locking state of `band`.
    ///
    /// # Errors
    /// [`UsageError::NothingToSet`] when `update` changes nothing;
    /// [`UsageError::Unsupported`] for programmatic lock-on-reset on
    /// Enterprise.
    pub fn set_band_locking(&mut self, band: u16, update: &BandLockingUpdate, pin: &ByteValue) -> Result<(), TcgError> {
        let ssc = self.ssc()?;
        let object = band_uid(ssc, band)?;

        let mut cells = flag_cells([
            (READ_LOCK_ENABLED, update.read_lock_enabled),
            (WRITE_LOCK_ENABLED, update.write_lock_enabled),
            (READ_LOCKED, update.read_locked),
            (WRITE_LOCKED, update.write_locked),
        ]);
        if let Some(lock_on_reset) = update.lock_on_reset {
            cells.push(Cell::int_list(LOCK_ON_RESET, lock_on_reset.to_list(ssc)?));
        }
        if cells.is_empty() {
            return Err(UsageError::NothingToSet.into());
        }

        debug!(band, columns = cells.len(), "set band locking");
        self.in_session(SecurityProvider::Locking, Some((Authority::for_band(ssc, band), pin)), |engine| {
            engine.set(object, &cells)
        })
    }

    /// MBR shadowing control. Needs no authentication.
    pub fn get_mbr_control(&mut self) -> Result<MbrControl, TcgError> {
        let ssc = self.require_opal("MBR shadowing")?;
        let object = Table::MbrControl.uid()?;

        self.in_session(SecurityProvider::Locking, None, |engine| {
            let mut row = engine.get(object)?;
            let enable = row.get_column_int(ssc, MBR_ENABLE)? != 0;
            let done = row.get_column_int(ssc, MBR_DONE)? != 0;
            let done_on_reset = LockOnReset::from_list(&row.get_column_int_list(ssc, MBR_DONE_ON_RESET)?);
            Ok(MbrControl { enable, done, done_on_reset })
        })
    }

    /// Change MBR shadowing control as Admin1.
    pub fn set_mbr_control(&mut self, update: &MbrControlUpdate, admin1_pin: &ByteValue) -> Result<(), TcgError> {
        let ssc = self.require_opal("MBR shadowing")?;
        let object = Table::MbrControl.uid()?;

        let mut cells = flag_cells([(MBR_ENABLE, update.enable), (MBR_DONE, update.done)]);
        if let Some(done_on_reset) = update.done_on_reset {
            cells.push(Cell::int_list(MBR_DONE_ON_RESET, done_on_reset.to_list(ssc)?));
        }
        if cells.is_empty() {
            return Err(UsageError::NothingToSet.into());
        }

        self.in_session(SecurityProvider::Locking, Some((Authority::Admin(1), admin1_pin)), |engine| {
            engine.set(object, &cells)
        })
    }

    /// Locking state of `port`, read as SID.
    pub fn get_port_locking(&mut self, port: Port, sid_pin: &ByteValue) -> Result<PortLocking, TcgError> {
        let ssc = self.ssc()?;
        self.in_session(SecurityProvider::Admin, Some((Authority::Sid, sid_pin)), |engine| {
            let mut row = engine.get(port.uid())?;
            let locked = row.get_column_int(ssc, PORT_LOCKED)? != 0;
            let lock_on_reset = LockOnReset::from_list(&row.get_column_int_list(ssc, PORT_LOCK_ON_RESET)?);
            Ok(PortLocking { locked, lock_on_power_cycle: lock_on_reset.power_cycle })
        })
    }

    /// Change the locking state of `port` as SID.
    pub fn set_port_locking(
        &mut self,
        port: Port,
        update: &PortLockingUpdate,
        sid_pin: &ByteValue,
    ) -> Result<(), TcgError> {
        let ssc = self.ssc()?;
        let mut cells = flag_cells([(PORT_LOCKED, update.locked)]);
        if let Some(power_cycle) = update.lock_on_power_cycle {
            let list = LockOnReset { power_cycle, programmatic: false }.to_list(ssc)?;
            cells.push(Cell::int_list(PORT_LOCK_ON_RESET, list));
        }
        if cells.is_empty() {
            return Err(UsageError::NothingToSet.into());
        }

        debug!(?port, columns = cells.len(), "set port locking");
        self.in_session(SecurityProvider::Admin, Some((Authority::Sid, sid_pin)), |engine| {
            engine.set(port.uid(), &cells)
        })
    }

    /// Allow or forbid host-issued TPer resets.
    pub fn set_tper_reset_enabled(&mut self, enabled: bool, sid_pin: &ByteValue) -> Result<(), TcgError> {
        self.ssc()?;
        let object = Table::TperInfo.uid()?;
        self.in_session(SecurityProvider::Admin, Some((Authority::Sid, sid_pin)), |engine| {
            engine.set(object, &[Cell::bool(PROGRAMMATIC_RESET_ENABLE, enabled)])
        })
    }

    /// Regenerate the encryption key of `band`, destroying its data.
    pub fn gen_key(&mut self, band: u16, pin: &ByteValue) -> Result<(), TcgError> {
        let ssc = self.ssc()?;
        band_uid(ssc, band)?;
        self.in_session(SecurityProvider::Locking, Some((Authority::for_band(ssc, band), pin)), |engine| {
            engine.gen_key(band)
        })
    }

    /// Cryptographically erase `band`.
    ///
    /// Opal erases as Admin1, Enterprise as EraseMaster.
    pub fn erase_band(&mut self, band: u16, pin: &ByteValue) -> Result<(), TcgError> {
        let ssc = self.ssc()?;
        band_uid(ssc, band)?;
        let authority = match ssc {
            Ssc::Opal => Authority::Admin(1),
            Ssc::Enterprise => Authority::EraseMaster,
        };

        debug!(band, "erase band");
        self.in_session(SecurityProvider::Locking, Some((authority, pin)), |engine| engine.erase(band))
    }

    /// Activate the Locking SP as SID.
    ///
    /// # Errors
    /// [`UsageError::Unsupported`] on Enterprise drives, or when Single User
    /// Mode is requested from a drive that does not report it.
    pub fn activate_locking(&mut self, options: &ActivateOptions, sid_pin: &ByteValue) -> Result<(), TcgError> {
        self.check_activation(options)?;
        self.in_session(SecurityProvider::Admin, Some((Authority::Sid, sid_pin)), |engine| engine.activate(options))
    }

    /// Reactivate the Locking SP as Admin1.
    ///
    /// The TPer keeps the session open; close it or reset the stack
    /// afterwards.
    pub fn reactivate_locking(&mut self, options: &ReactivateOptions, admin1_pin: &ByteValue) -> Result<(), TcgError> {
        self.check_activation(&options.activate)?;
        self.engine.start_session(SecurityProvider::Locking)?;
        self.engine.authenticate(Authority::Admin(1), admin1_pin)?;
        self.engine.reactivate(options)
    }

    /// Revert the Locking SP as Admin1.
    pub fn revert_locking_sp(&mut self, keep_global_range_key: bool, admin1_pin: &ByteValue) -> Result<(), TcgError> {
        self.ssc()?;
        debug!(keep_global_range_key, "revert Locking SP");
        self.engine.start_session(SecurityProvider::Locking)?;
        self.engine.authenticate(Authority::Admin(1), admin1_pin)?;
        self.engine.revert_sp(Some(keep_global_range_key))
    }

    /// Return the drive to factory state with the PSID printed on its label.
    ///
    /// # Errors
    /// [`UsageError::MissingCredential`] when `psid` is empty.
    pub fn restore_to_factory(&mut self, psid: &ByteValue) -> Result<(), TcgError> {
        self.ssc()?;
        if psid.is_empty() {
            return Err(UsageError::MissingCredential("PSID").into());
        }

        debug!("factory restore");
        self.engine.start_session(SecurityProvider::Admin)?;
        self.engine.authenticate(Authority::Psid, psid)?;
        self.engine.revert_sp(None)
    }

    /// `count` random bytes from `sp`, without authentication.
    pub fn generate_random(&mut self, sp: SecurityProvider, count: usize) -> Result<Vec<u8>, TcgError> {
        self.ssc()?;
        if !(1..=MAX_RANDOM_BYTES).contains(&count) {
            return Err(UsageError::RandomCount(count).into());
        }
        self.in_session(sp, None, |engine| engine.random(count))
    }

    /// Reset the TCG stack on the assigned ComID, dropping any session.
    pub fn stack_reset(&mut self) -> Result<(), TcgError> {
        self.engine.stack_reset(None)
    }

    fn ssc(&self) -> Result<Ssc, TcgError> {
        Ok(self.engine.channel()?.ssc)
    }

    fn require_opal(&self, feature: &'static str) -> Result<Ssc, TcgError> {
        match self.ssc()? {
            Ssc::Opal => Ok(Ssc::Opal),
            ssc => Err(UsageError::Unsupported { ssc, feature }.into()),
        }
    }

    fn check_activation(&self, options: &ActivateOptions) -> Result<(), TcgError> {
        self.require_opal("Activate")?;
        if options.data_store_tables > columns::MAX_DATASTORE_TABLES {
            return Err(UsageError::DataStoreCount(options.data_store_tables).into());
        }
        let sum_supported = self.capabilities.as_ref().is_some_and(DiscoveredCapabilities::single_user_mode_supported);
        if options.single_user_mode.is_some() && !sum_supported {
            return Err(UsageError::Unsupported { ssc: Ssc::Opal, feature: "Single User Mode" }.into());
        }
        Ok(())
    }

    /// Band row, plus the authority reading it: Admin1 on Opal, none on
    /// Enterprise.
    fn band_read<'p>(
        &self,
        band: u16,
        pin: &'p ByteValue,
    ) -> Result<(Ssc, Uid, Option<(Authority, &'p ByteValue)>), TcgError> {
        let ssc = self.ssc()?;
        let object = band_uid(ssc, band)?;
        let auth = match ssc {
            Ssc::Opal => Some((Authority::Admin(1), pin)),
            Ssc::Enterprise => None,
        };
        Ok((ssc, object, auth))
    }

    fn in_session<R>(
        &mut self,
        sp: SecurityProvider,
        auth: Option<(Authority, &ByteValue)>,
        body: impl FnOnce(&mut Engine<T, E>) -> Result<R, TcgError>,
    ) -> Result<R, TcgError> {
        self.engine.start_session(sp)?;
        if let Some((authority, pin)) = auth {
            self.engine.authenticate(authority, pin)?;
        }
        let value = body(&mut self.engine)?;
        self.engine.close_session()?;
        Ok(value)
    }
}

fn flag_cells<const N: usize>(flags: [(Column, Option<bool>); N]) -> Vec<Cell> {
    flags.into_iter().filter_map(|(column, value)| value.map(|value| Cell::bool(column, value))).collect()
}
