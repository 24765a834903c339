//! Table and SP methods invoked inside an open session.
//!
//! Every method here follows the same path through [`Engine::invoke`]:
//! build the arguments, exchange one packet, check the status footer. What
//! differs is the argument shape and what each method accepts as a result.
//!
//! | Method        | Object           | Results accepted           |
//! |---------------|------------------|----------------------------|
//! | Authenticate  | ThisSP           | one non-zero integer       |
//! | Get           | row / object     | anything                   |
//! | Set           | row / object     | anything                   |
//! | Random        | ThisSP           | one byte string, `count`   |
//! | GenKey        | band MEK         | none                       |
//! | Erase         | band Locking row | none                       |
//! | Activate      | LockingSP        | none                       |
//! | Reactivate    | ThisSP           | none                       |
//! | RevertSP      | ThisSP           | none; session is gone      |
//!
//! Column and parameter keys are written by id on Opal and by name on
//! Enterprise. The builders take the SSC from the assigned channel.

use tcg_proto::{
    Authority, ByteValue, Method, ParameterList, SecurityProvider, Slot, Ssc, Uid,
    columns::{Column, DATASTORE_TABLE_SIZE, MAX_DATASTORE_TABLES, RangePolicy, keys},
    uid::{Table, band_key_uid, band_uid},
};
use tracing::debug;

use crate::{
    engine::Engine,
    env::Environment,
    error::{TcgError, UsageError},
    transport::Transport,
};

/// Largest byte count the Random method may request.
pub const MAX_RANDOM_BYTES: usize = 32;

/// Value written to one column by [`Engine::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    /// Unsigned integer
    Int(u64),
    /// Byte string
    Bytes(ByteValue),
    /// List of integers (LockOnReset and friends)
    IntList(Vec<u64>),
}

/// One column/value pair of a Set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Column written
    pub column: Column,
    /// New value
    pub value: CellValue,
}

impl Cell {
    /// Integer cell.
    pub const fn int(column: Column, value: u64) -> Self {
        Self { column, value: CellValue::Int(value) }
    }

    /// Boolean cell, encoded as 0 or 1.
    pub const fn bool(column: Column, value: bool) -> Self {
        Self::int(column, value as u64)
    }

    /// Byte string cell.
    pub fn bytes(column: Column, value: ByteValue) -> Self {
        Self { column, value: CellValue::Bytes(value) }
    }

    /// Integer list cell.
    pub fn int_list(column: Column, values: Vec<u64>) -> Self {
        Self { column, value: CellValue::IntList(values) }
    }
}

/// Options shared by Activate and Reactivate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOptions {
    /// Put the whole Locking table in Single User Mode with this policy
    pub single_user_mode: Option<RangePolicy>,
    /// DataStore tables to create, 0 to keep the default layout
    pub data_store_tables: usize,
}

/// Options of Reactivate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactivateOptions {
    /// Single User Mode and DataStore layout
    pub activate: ActivateOptions,
    /// New Admin1 PIN
    pub admin1_pin: Option<ByteValue>,
}

impl<T: Transport, E: Environment> Engine<T, E> {
    /// Authenticate as `authority` with `proof` inside the open session.
    ///
    /// # Errors
    /// [`TcgError::AuthenticationFailed`] when the TPer answers false.
    pub fn authenticate(&mut self, authority: Authority, proof: &ByteValue) -> Result<(), TcgError> {
        let scope = self.session_scope("authenticate")?;
        let ssc = self.channel()?.ssc;
        let authority_uid = authority.uid()?;

        debug!(%authority, proof_len = proof.len(), "authenticate");
        self.invoke(Uid::THIS_SP, Method::Authenticate, scope, |args| {
            authenticate_args(args, ssc, authority_uid, Some(proof))
        })?;
        self.check_authenticated(authority)
    }

    /// First leg of challenge-response authentication: ask the TPer for a
    /// challenge.
    pub fn request_challenge(&mut self, authority: Authority) -> Result<ByteValue, TcgError> {
        let scope = self.session_scope("request_challenge")?;
        let ssc = self.channel()?.ssc;
        let authority_uid = authority.uid()?;

        debug!(%authority, "request challenge");
        self.invoke(Uid::THIS_SP, Method::Authenticate, scope, |args| {
            authenticate_args(args, ssc, authority_uid, None)
        })?;

        match self.results.slots() {
            [Slot::Bytes(challenge)] => Ok(challenge.clone()),
            other => Err(unexpected(Method::Authenticate, format!("expected one challenge, got {other:?}"))),
        }
    }

    /// Second leg of challenge-response authentication: answer the
    /// challenge.
    pub fn answer_challenge(&mut self, authority: Authority, response: &ByteValue) -> Result<(), TcgError> {
        let scope = self.session_scope("answer_challenge")?;
        let ssc = self.channel()?.ssc;
        let authority_uid = authority.uid()?;

        debug!(%authority, response_len = response.len(), "answer challenge");
        self.invoke(Uid::THIS_SP, Method::Authenticate, scope, |args| {
            authenticate_args(args, ssc, authority_uid, Some(response))
        })?;
        self.check_authenticated(authority)
    }

    fn check_authenticated(&self, authority: Authority) -> Result<(), TcgError> {
        match self.results.slots() {
            [Slot::Int(0)] => Err(TcgError::AuthenticationFailed { authority: authority.to_string() }),
            [Slot::Int(_)] => Ok(()),
            other => Err(unexpected(Method::Authenticate, format!("expected one boolean, got {other:?}"))),
        }
    }

    /// Read every column of `object`.
    ///
    /// Returns the raw result list; look cells up with
    /// [`ParameterList::get_column_int`] and friends.
    pub fn get(&mut self, object: Uid) -> Result<ParameterList, TcgError> {
        let scope = self.session_scope("get")?;
        self.invoke(object, Method::Get, scope, |args| {
            args.push_start_list()?;
            args.push_end_list()?;
            Ok(())
        })?;
        Ok(self.results.clone())
    }

    /// Write `cells` to `object`.
    ///
    /// # Errors
    /// [`UsageError::NothingToSet`] when `cells` is empty.
    pub fn set(&mut self, object: Uid, cells: &[Cell]) -> Result<(), TcgError> {
        let scope = self.session_scope("set")?;
        let ssc = self.channel()?.ssc;
        if cells.is_empty() {
            return Err(UsageError::NothingToSet.into());
        }

        self.invoke(object, Method::Set, scope, |args| set_args(args, ssc, cells))
    }

    /// Ask the TPer for `count` random bytes.
    ///
    /// # Errors
    /// [`UsageError::RandomCount`] unless `count` is in `1..=32`.
    pub fn random(&mut self, count: usize) -> Result<Vec<u8>, TcgError> {
        let scope = self.session_scope("random")?;
        if !(1..=MAX_RANDOM_BYTES).contains(&count) {
            return Err(UsageError::RandomCount(count).into());
        }

        self.invoke(Uid::THIS_SP, Method::Random, scope, |args| {
            args.push_int(count as u64)?;
            Ok(())
        })?;

        match self.results.slots() {
            [Slot::Bytes(bytes)] if bytes.len() == count => Ok(bytes.as_slice().to_vec()),
            [Slot::Bytes(bytes)] => {
                Err(unexpected(Method::Random, format!("{} bytes, expected {count}", bytes.len())))
            },
            other => Err(unexpected(Method::Random, format!("expected one byte string, got {other:?}"))),
        }
    }

    /// Regenerate the media encryption key of `band`.
    pub fn gen_key(&mut self, band: u16) -> Result<(), TcgError> {
        let scope = self.session_scope("gen_key")?;
        let object = band_key_uid(band)?;
        self.invoke(object, Method::GenKey, scope, |_| Ok(()))?;
        self.expect_no_results(Method::GenKey)
    }

    /// Cryptographically erase `band`.
    pub fn erase(&mut self, band: u16) -> Result<(), TcgError> {
        let scope = self.session_scope("erase")?;
        let object = band_uid(self.channel()?.ssc, band)?;
        self.invoke(object, Method::Erase, scope, |_| Ok(()))?;
        self.expect_no_results(Method::Erase)
    }

    /// Activate the Locking SP.
    ///
    /// # Errors
    /// [`UsageError::DataStoreCount`] when more than 16 DataStore tables are
    /// requested.
    pub fn activate(&mut self, options: &ActivateOptions) -> Result<(), TcgError> {
        let scope = self.session_scope("activate")?;
        let object = SecurityProvider::Locking.uid(self.channel()?.ssc);
        check_data_store_count(options.data_store_tables)?;

        self.invoke(object, Method::Activate, scope, |args| {
            activation_args(args, options, keys::ACTIVATE_DATASTORE_SIZES)
        })?;
        self.expect_no_results(Method::Activate)
    }

    /// Re-run activation of the Locking SP with a new configuration.
    ///
    /// The TPer keeps the session open afterwards.
    pub fn reactivate(&mut self, options: &ReactivateOptions) -> Result<(), TcgError> {
        let scope = self.session_scope("reactivate")?;
        check_data_store_count(options.activate.data_store_tables)?;

        self.invoke(Uid::THIS_SP, Method::Reactivate, scope, |args| {
            push_single_user_mode(args, options.activate.single_user_mode)?;
            if let Some(pin) = &options.admin1_pin {
                args.push_id_bytes(keys::REACTIVATE_ADMIN1_PIN, pin.clone())?;
            }
            push_data_store_sizes(args, keys::REACTIVATE_DATASTORE_SIZES, options.activate.data_store_tables)
        })?;
        self.expect_no_results(Method::Reactivate)
    }

    /// Revert the SP the session is open on.
    ///
    /// `keep_global_range_key` is sent only when given. The TPer ends the
    /// session on success, so the local session is cleared without a
    /// CloseSession.
    pub fn revert_sp(&mut self, keep_global_range_key: Option<bool>) -> Result<(), TcgError> {
        let scope = self.session_scope("revert_sp")?;
        self.invoke(Uid::THIS_SP, Method::RevertSp, scope, |args| {
            if let Some(keep) = keep_global_range_key {
                args.push_id_int(keys::KEEP_GLOBAL_RANGE_KEY, u64::from(keep))?;
            }
            Ok(())
        })?;
        self.expect_no_results(Method::RevertSp)?;

        debug!("SP reverted, session closed by TPer");
        self.session.clear();
        Ok(())
    }

    fn expect_no_results(&self, method: Method) -> Result<(), TcgError> {
        if self.results.is_empty() {
            Ok(())
        } else {
            Err(unexpected(method, format!("{} result slots, expected none", self.results.len())))
        }
    }
}

fn unexpected(method: Method, reason: String) -> TcgError {
    TcgError::UnexpectedResult { call: method.name(), reason }
}

fn check_data_store_count(count: usize) -> Result<(), UsageError> {
    if count > MAX_DATASTORE_TABLES { Err(UsageError::DataStoreCount(count)) } else { Ok(()) }
}

/// `authority [proof pair]`; the pair is keyed 0 on Opal and `Challenge`
/// on Enterprise.
fn authenticate_args(
    args: &mut ParameterList,
    ssc: Ssc,
    authority: Uid,
    proof: Option<&ByteValue>,
) -> Result<(), TcgError> {
    args.push_uid(authority)?;
    if let Some(proof) = proof {
        match ssc {
            Ssc::Opal => args.push_id_bytes(keys::AUTHENTICATE_PROOF, proof.clone())?,
            Ssc::Enterprise => args.push_named_bytes(keys::AUTHENTICATE_CHALLENGE, proof.clone())?,
        }
    }
    Ok(())
}

/// Opal: `Values = [ cells ]`. Enterprise: `[ ] [ [ cells ] ]`, an empty
/// Where followed by one row of values.
fn set_args(args: &mut ParameterList, ssc: Ssc, cells: &[Cell]) -> Result<(), TcgError> {
    match ssc {
        Ssc::Opal => {
            args.push_start_name()?;
            args.push_int(keys::SET_VALUES)?;
            args.push_start_list()?;
            push_cells(args, ssc, cells)?;
            args.push_end_list()?;
            args.push_end_name()?;
        },
        Ssc::Enterprise => {
            args.push_start_list()?;
            args.push_end_list()?;
            args.push_start_list()?;
            args.push_start_list()?;
            push_cells(args, ssc, cells)?;
            args.push_end_list()?;
            args.push_end_list()?;
        },
    }
    Ok(())
}

fn push_cells(args: &mut ParameterList, ssc: Ssc, cells: &[Cell]) -> Result<(), TcgError> {
    for cell in cells {
        match &cell.value {
            CellValue::Int(value) => args.push_column_int(ssc, cell.column, *value)?,
            CellValue::Bytes(value) => args.push_column_bytes(ssc, cell.column, value.clone())?,
            CellValue::IntList(values) => args.push_column_int_list(ssc, cell.column, values)?,
        }
    }
    Ok(())
}

/// Single User Mode selection and policy, then DataStore sizes under
/// `data_store_key`.
fn activation_args(args: &mut ParameterList, options: &ActivateOptions, data_store_key: u64) -> Result<(), TcgError> {
    push_single_user_mode(args, options.single_user_mode)?;
    push_data_store_sizes(args, data_store_key, options.data_store_tables)
}

/// The whole Locking table goes into Single User Mode.
fn push_single_user_mode(args: &mut ParameterList, policy: Option<RangePolicy>) -> Result<(), TcgError> {
    if let Some(policy) = policy {
        args.push_id_bytes(keys::SUM_SELECTION_LIST, ByteValue::from_uid(Table::Locking.uid()?))?;
        args.push_id_int(keys::RANGE_POLICY, policy as u64)?;
    }
    Ok(())
}

fn push_data_store_sizes(args: &mut ParameterList, key: u64, tables: usize) -> Result<(), TcgError> {
    if tables == 0 {
        return Ok(());
    }
    args.push_start_name()?;
    args.push_int(key)?;
    args.push_start_list()?;
    for _ in 0..tables {
        args.push_int(DATASTORE_TABLE_SIZE)?;
    }
    args.push_end_list()?;
    args.push_end_name()?;
    Ok(())
}
