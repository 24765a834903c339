//! Table columns and method parameter keys.
//!
//! A [`Column`] carries both addressing forms. Opal sends the integer id,
//! Enterprise the name; [`crate::params::ParameterList`] picks one from the
//! active [`crate::uid::Ssc`].

/// A table column with its Opal id and Enterprise name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Column {
    /// Opal column number
    pub id: u64,
    /// Enterprise column name
    pub name: &'static str,
}

impl Column {
    /// Column with the given id and name.
    pub const fn new(id: u64, name: &'static str) -> Self {
        Self { id, name }
    }
}

/// C_PIN.PIN
pub const PIN: Column = Column::new(3, "PIN");
/// Authority.Enabled
pub const ENABLED: Column = Column::new(5, "Enabled");

/// Locking.RangeStart
pub const RANGE_START: Column = Column::new(3, "RangeStart");
/// Locking.RangeLength
pub const RANGE_LENGTH: Column = Column::new(4, "RangeLength");
/// Locking.ReadLockEnabled
pub const READ_LOCK_ENABLED: Column = Column::new(5, "ReadLockEnabled");
/// Locking.WriteLockEnabled
pub const WRITE_LOCK_ENABLED: Column = Column::new(6, "WriteLockEnabled");
/// Locking.ReadLocked
pub const READ_LOCKED: Column = Column::new(7, "ReadLocked");
/// Locking.WriteLocked
pub const WRITE_LOCKED: Column = Column::new(8, "WriteLocked");
/// Locking.LockOnReset
pub const LOCK_ON_RESET: Column = Column::new(9, "LockOnReset");

/// MBRControl.Enable
pub const MBR_ENABLE: Column = Column::new(1, "Enable");
/// MBRControl.Done
pub const MBR_DONE: Column = Column::new(2, "Done");
/// MBRControl.DoneOnReset
pub const MBR_DONE_ON_RESET: Column = Column::new(3, "DoneOnReset");

/// TPerInfo.ProgrammaticResetEnable
pub const PROGRAMMATIC_RESET_ENABLE: Column = Column::new(8, "ProgrammaticResetEnable");

/// Port.LockOnReset
pub const PORT_LOCK_ON_RESET: Column = Column::new(2, "LockOnReset");
/// Port.PortLocked
pub const PORT_LOCKED: Column = Column::new(3, "PortLocked");

/// Parameter keys of method calls.
pub mod keys {
    /// Set: `Where` (row selector, always empty here)
    pub const SET_WHERE: u64 = 0;
    /// Set: `Values`
    pub const SET_VALUES: u64 = 1;
    /// Authenticate: Opal proof
    pub const AUTHENTICATE_PROOF: u64 = 0;
    /// Authenticate: Enterprise proof
    pub const AUTHENTICATE_CHALLENGE: &str = "Challenge";
    /// Activate/Reactivate: single-user mode selection list
    pub const SUM_SELECTION_LIST: u64 = 0x06_0000;
    /// Activate/Reactivate: range policy
    pub const RANGE_POLICY: u64 = 0x06_0001;
    /// Activate: DataStore table sizes
    pub const ACTIVATE_DATASTORE_SIZES: u64 = 0x06_0002;
    /// Reactivate: new Admin1 PIN
    pub const REACTIVATE_ADMIN1_PIN: u64 = 0x06_0002;
    /// Reactivate: DataStore table sizes
    pub const REACTIVATE_DATASTORE_SIZES: u64 = 0x06_0003;
    /// RevertSP: keep the global range key
    pub const KEEP_GLOBAL_RANGE_KEY: u64 = 0x06_0000;
}

/// Values of the Locking.LockOnReset and Port.LockOnReset lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResetType {
    /// Power cycle
    PowerCycle = 0,
    /// TPer reset issued by the host
    Programmatic = 3,
}

impl ResetType {
    /// Wire value.
    pub const fn to_u64(self) -> u64 {
        self as u64
    }
}

/// Range ownership policy passed to Activate/Reactivate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RangePolicy {
    /// Users own their single-user ranges
    User = 0,
    /// Admins own all ranges
    Admins = 1,
}

/// DataStore table size requested by Activate, in bytes.
pub const DATASTORE_TABLE_SIZE: u64 = 0x4000;

/// Largest number of DataStore tables Activate may request.
pub const MAX_DATASTORE_TABLES: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locking_columns_share_ids_with_other_tables() {
        assert_eq!(RANGE_START.id, PIN.id);
        assert_ne!(RANGE_START.name, PIN.name);
        assert_eq!(LOCK_ON_RESET, Column::new(9, "LockOnReset"));
    }

    #[test]
    fn reset_type_values() {
        assert_eq!(ResetType::PowerCycle.to_u64(), 0);
        assert_eq!(ResetType::Programmatic.to_u64(), 3);
        assert_eq!(RangePolicy::Admins as u8, 1);
    }
}
