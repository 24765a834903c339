//! Parameter model.
//!
//! A [`ParameterList`] is a bounded, ordered sequence of typed slots that
//! mirrors the token stream one-to-one: integers, byte strings, and the four
//! structural markers. The same representation is used to build method
//! arguments (write side) and to hold decoded results (read side).
//!
//! # Addressing
//!
//! A name/value pair occupies four slots:
//!
//! ```text
//! StartName, <key>, <value>, EndName
//! ```
//!
//! Opal keys are `Int` column ids, Enterprise keys are `Bytes` column names.
//! The `*_column_*` helpers pick the key form from the active [`Ssc`], so
//! callers never choose the convention by hand.
//!
//! # Cursors
//!
//! Writes append at the write cursor. Reads consume from a separate read
//! cursor that never passes the write cursor. `seek_*` moves the read cursor
//! onto the value of a name/value pair so a nested list can be walked from
//! there.

use std::fmt;

use bytes::Bytes;

use crate::{
    columns::Column,
    errors::{ProtocolError, Result},
    uid::{Ssc, Uid},
};

/// Default slot capacity of a parameter list.
pub const DEFAULT_CAPACITY: usize = 150;

/// Slots taken by one name/value pair.
const PAIR_SLOTS: usize = 4;

/// A byte string with a fixed upper bound.
///
/// Sized for one table cell. Constructing a larger value fails rather than
/// truncating.
#[derive(Clone, PartialEq, Eq, Default, Hash)]
pub struct ByteValue(Bytes);

impl ByteValue {
    /// Largest value a cell holds.
    pub const CAPACITY: usize = 1200;

    /// Wrap bytes, rejecting anything over [`Self::CAPACITY`].
    pub fn new(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.len() > Self::CAPACITY {
            return Err(ProtocolError::ByteValueTooLarge { len: data.len(), capacity: Self::CAPACITY });
        }
        Ok(Self(data))
    }

    /// Copy a slice into a new value.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// Value holding a UID.
    pub fn from_uid(uid: Uid) -> Self {
        Self(Bytes::copy_from_slice(uid.as_bytes()))
    }

    /// Contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for ByteValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for ByteValue {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_slice(value.as_bytes())
    }
}

impl TryFrom<&[u8]> for ByteValue {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        Self::from_slice(value)
    }
}

impl TryFrom<Vec<u8>> for ByteValue {
    type Error = ProtocolError;

    fn try_from(value: Vec<u8>) -> Result<Self> {
        Self::new(value)
    }
}

// Contents may be credentials; only the length is shown.
impl fmt::Debug for ByteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteValue(len={})", self.0.len())
    }
}

/// One slot of a parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Unsigned integer
    Int(u64),
    /// Byte string
    Bytes(ByteValue),
    /// Opens a list
    StartList,
    /// Closes a list
    EndList,
    /// Opens a name/value pair
    StartName,
    /// Closes a name/value pair
    EndName,
}

impl Slot {
    /// Type tag.
    pub const fn kind(&self) -> SlotKind {
        match self {
            Self::Int(_) => SlotKind::Int,
            Self::Bytes(_) => SlotKind::Bytes,
            Self::StartList => SlotKind::StartList,
            Self::EndList => SlotKind::EndList,
            Self::StartName => SlotKind::StartName,
            Self::EndName => SlotKind::EndName,
        }
    }
}

/// Slot type without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Integer slot
    Int,
    /// Byte string slot
    Bytes,
    /// StartList marker
    StartList,
    /// EndList marker
    EndList,
    /// StartName marker
    StartName,
    /// EndName marker
    EndName,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "Int",
            Self::Bytes => "Bytes",
            Self::StartList => "StartList",
            Self::EndList => "EndList",
            Self::StartName => "StartName",
            Self::EndName => "EndName",
        })
    }
}

/// Key of a name/value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    /// Opal column or parameter id
    Id(u64),
    /// Enterprise column or parameter name
    Name(&'a [u8]),
}

impl Key<'_> {
    /// Key form of a column under the given SSC.
    pub fn column(ssc: Ssc, column: Column) -> Self {
        if ssc.uses_column_ids() { Self::Id(column.id) } else { Self::Name(column.name.as_bytes()) }
    }

    fn matches(self, slot: &Slot) -> bool {
        match (self, slot) {
            (Self::Id(id), Slot::Int(value)) => id == *value,
            (Self::Name(name), Slot::Bytes(value)) => name == value.as_slice(),
            _ => false,
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Id(id) => format!("id {id}"),
            Self::Name(name) => format!("name {:?}", String::from_utf8_lossy(name)),
        }
    }
}

/// Bounded list of typed slots with independent read and write cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterList {
    slots: Vec<Slot>,
    capacity: usize,
    read: usize,
}

impl Default for ParameterList {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ParameterList {
    /// Empty list with [`DEFAULT_CAPACITY`] slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty list with room for `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: Vec::with_capacity(capacity), capacity, read: 0 }
    }

    /// Zero both cursors. The allocation is kept.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.read = 0;
    }

    /// Slots written.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read cursor position.
    pub fn read_position(&self) -> usize {
        self.read
    }

    /// Move the read cursor back to the first slot.
    pub fn rewind(&mut self) {
        self.read = 0;
    }

    /// All written slots.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    fn ensure_room(&self, needed: usize) -> Result<()> {
        if self.slots.len() + needed > self.capacity {
            return Err(ProtocolError::ParameterListFull { needed, capacity: self.capacity });
        }
        Ok(())
    }

    /// Append one slot.
    pub fn push(&mut self, slot: Slot) -> Result<()> {
        self.ensure_room(1)?;
        self.slots.push(slot);
        Ok(())
    }

    /// Append `StartList`.
    pub fn push_start_list(&mut self) -> Result<()> {
        self.push(Slot::StartList)
    }

    /// Append `EndList`.
    pub fn push_end_list(&mut self) -> Result<()> {
        self.push(Slot::EndList)
    }

    /// Append `StartName`.
    pub fn push_start_name(&mut self) -> Result<()> {
        self.push(Slot::StartName)
    }

    /// Append `EndName`.
    pub fn push_end_name(&mut self) -> Result<()> {
        self.push(Slot::EndName)
    }

    /// Append an integer.
    pub fn push_int(&mut self, value: u64) -> Result<()> {
        self.push(Slot::Int(value))
    }

    /// Append a byte string.
    pub fn push_bytes(&mut self, value: ByteValue) -> Result<()> {
        self.push(Slot::Bytes(value))
    }

    /// Append a UID as an 8-byte string.
    pub fn push_uid(&mut self, uid: Uid) -> Result<()> {
        self.push_bytes(ByteValue::from_uid(uid))
    }

    /// Append the key slot of a pair.
    pub fn push_key(&mut self, key: Key<'_>) -> Result<()> {
        match key {
            Key::Id(id) => self.push_int(id),
            Key::Name(name) => self.push_bytes(ByteValue::from_slice(name)?),
        }
    }

    fn push_pair(&mut self, key: Key<'_>, value: Slot) -> Result<()> {
        self.ensure_room(PAIR_SLOTS)?;
        let key = match key {
            Key::Id(id) => Slot::Int(id),
            Key::Name(name) => Slot::Bytes(ByteValue::from_slice(name)?),
        };
        self.slots.extend([Slot::StartName, key, value, Slot::EndName]);
        Ok(())
    }

    /// Append `StartName, Bytes(name), Int(value), EndName`.
    pub fn push_named_int(&mut self, name: &str, value: u64) -> Result<()> {
        self.push_pair(Key::Name(name.as_bytes()), Slot::Int(value))
    }

    /// Append `StartName, Int(id), Int(value), EndName`.
    pub fn push_id_int(&mut self, id: u64, value: u64) -> Result<()> {
        self.push_pair(Key::Id(id), Slot::Int(value))
    }

    /// Append `StartName, Bytes(name), Bytes(value), EndName`.
    pub fn push_named_bytes(&mut self, name: &str, value: ByteValue) -> Result<()> {
        self.push_pair(Key::Name(name.as_bytes()), Slot::Bytes(value))
    }

    /// Append `StartName, Int(id), Bytes(value), EndName`.
    pub fn push_id_bytes(&mut self, id: u64, value: ByteValue) -> Result<()> {
        self.push_pair(Key::Id(id), Slot::Bytes(value))
    }

    /// Append an integer cell addressed the way `ssc` expects.
    pub fn push_column_int(&mut self, ssc: Ssc, column: Column, value: u64) -> Result<()> {
        self.push_pair(Key::column(ssc, column), Slot::Int(value))
    }

    /// Append a byte cell addressed the way `ssc` expects.
    pub fn push_column_bytes(&mut self, ssc: Ssc, column: Column, value: ByteValue) -> Result<()> {
        self.push_pair(Key::column(ssc, column), Slot::Bytes(value))
    }

    /// Append a cell whose value is a list of integers.
    pub fn push_column_int_list(&mut self, ssc: Ssc, column: Column, values: &[u64]) -> Result<()> {
        self.ensure_room(PAIR_SLOTS + 1 + values.len())?;
        self.push_start_name()?;
        self.push_key(Key::column(ssc, column))?;
        self.push_start_list()?;
        for &value in values {
            self.push_int(value)?;
        }
        self.push_end_list()?;
        self.push_end_name()
    }

    fn next_slot(&mut self) -> Result<&Slot> {
        let slot = self
            .slots
            .get(self.read)
            .ok_or(ProtocolError::ReadPastEnd { position: self.read, len: self.slots.len() })?;
        self.read += 1;
        Ok(slot)
    }

    fn expect_marker(&mut self, expected: SlotKind) -> Result<()> {
        let found = self.next_slot()?.kind();
        if found != expected {
            self.read -= 1;
            return Err(ProtocolError::SlotMismatch { expected, found });
        }
        Ok(())
    }

    /// Consume `StartList`.
    pub fn get_start_list(&mut self) -> Result<()> {
        self.expect_marker(SlotKind::StartList)
    }

    /// Consume `EndList`.
    pub fn get_end_list(&mut self) -> Result<()> {
        self.expect_marker(SlotKind::EndList)
    }

    /// Consume `StartName`.
    pub fn get_start_name(&mut self) -> Result<()> {
        self.expect_marker(SlotKind::StartName)
    }

    /// Consume `EndName`.
    pub fn get_end_name(&mut self) -> Result<()> {
        self.expect_marker(SlotKind::EndName)
    }

    /// Consume an integer.
    pub fn get_int(&mut self) -> Result<u64> {
        match self.next_slot()? {
            Slot::Int(value) => Ok(*value),
            other => {
                let found = other.kind();
                self.read -= 1;
                Err(ProtocolError::SlotMismatch { expected: SlotKind::Int, found })
            },
        }
    }

    /// Consume a byte string.
    pub fn get_bytes(&mut self) -> Result<ByteValue> {
        match self.next_slot()? {
            Slot::Bytes(value) => Ok(value.clone()),
            other => {
                let found = other.kind();
                self.read -= 1;
                Err(ProtocolError::SlotMismatch { expected: SlotKind::Bytes, found })
            },
        }
    }

    /// Whether the next unread slot is `EndList`. Does not consume.
    pub fn peek_end_list(&self) -> bool {
        matches!(self.slots.get(self.read), Some(Slot::EndList))
    }

    /// Next unread slot's type, if any.
    pub fn peek_kind(&self) -> Option<SlotKind> {
        self.slots.get(self.read).map(Slot::kind)
    }

    fn find_index(&self, key: Key<'_>) -> Option<usize> {
        if self.slots.len() < PAIR_SLOTS {
            return None;
        }
        (0..=self.slots.len() - PAIR_SLOTS)
            .find(|&i| self.slots[i] == Slot::StartName && key.matches(&self.slots[i + 1]))
            .map(|i| i + 2)
    }

    /// Value of the first pair whose key matches. Leaves the cursor alone.
    pub fn find(&self, key: Key<'_>) -> Option<&Slot> {
        self.find_index(key).map(|i| &self.slots[i])
    }

    /// Value of the first pair keyed by `id`.
    pub fn find_id(&self, id: u64) -> Option<&Slot> {
        self.find(Key::Id(id))
    }

    /// Value of the first pair keyed by `name`.
    pub fn find_name(&self, name: &str) -> Option<&Slot> {
        self.find(Key::Name(name.as_bytes()))
    }

    /// Move the read cursor onto the value of the first matching pair.
    pub fn seek(&mut self, key: Key<'_>) -> Result<()> {
        let index = self.find_index(key).ok_or_else(|| ProtocolError::MissingValue(key.describe()))?;
        self.read = index;
        Ok(())
    }

    /// [`Self::seek`] by id.
    pub fn seek_id(&mut self, id: u64) -> Result<()> {
        self.seek(Key::Id(id))
    }

    /// [`Self::seek`] by name.
    pub fn seek_name(&mut self, name: &str) -> Result<()> {
        self.seek(Key::Name(name.as_bytes()))
    }

    fn int_at(&self, key: Key<'_>) -> Result<u64> {
        match self.find(key) {
            Some(Slot::Int(value)) => Ok(*value),
            Some(other) => Err(ProtocolError::SlotMismatch { expected: SlotKind::Int, found: other.kind() }),
            None => Err(ProtocolError::MissingValue(key.describe())),
        }
    }

    fn bytes_at(&self, key: Key<'_>) -> Result<ByteValue> {
        match self.find(key) {
            Some(Slot::Bytes(value)) => Ok(value.clone()),
            Some(other) => Err(ProtocolError::SlotMismatch { expected: SlotKind::Bytes, found: other.kind() }),
            None => Err(ProtocolError::MissingValue(key.describe())),
        }
    }

    /// Integer value keyed by `name`.
    pub fn get_named_int(&self, name: &str) -> Result<u64> {
        self.int_at(Key::Name(name.as_bytes()))
    }

    /// Integer value keyed by `id`.
    pub fn get_id_int(&self, id: u64) -> Result<u64> {
        self.int_at(Key::Id(id))
    }

    /// Byte value keyed by `name`.
    pub fn get_named_bytes(&self, name: &str) -> Result<ByteValue> {
        self.bytes_at(Key::Name(name.as_bytes()))
    }

    /// Byte value keyed by `id`.
    pub fn get_id_bytes(&self, id: u64) -> Result<ByteValue> {
        self.bytes_at(Key::Id(id))
    }

    /// Integer cell addressed the way `ssc` expects.
    pub fn get_column_int(&self, ssc: Ssc, column: Column) -> Result<u64> {
        self.int_at(Key::column(ssc, column))
    }

    /// Byte cell addressed the way `ssc` expects.
    pub fn get_column_bytes(&self, ssc: Ssc, column: Column) -> Result<ByteValue> {
        self.bytes_at(Key::column(ssc, column))
    }

    /// Integers of a list-valued cell, in order.
    pub fn get_column_int_list(&mut self, ssc: Ssc, column: Column) -> Result<Vec<u64>> {
        self.seek(Key::column(ssc, column))?;
        self.get_start_list()?;
        let mut values = Vec::new();
        while !self.peek_end_list() {
            values.push(self.get_int()?);
        }
        self.get_end_list()?;
        Ok(values)
    }

    /// Integer slots anywhere in the list, in order.
    pub fn ints(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Int(value) => Some(*value),
            _ => None,
        })
    }
}
