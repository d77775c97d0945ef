// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// The upper layers describe a table entry in P4Runtime terms: a list of
/// field matches, a priority, and an action with parameters.  The SDK wants
/// something more rigid: a key object and a data object for a specific table,
/// with every value padded to exactly the width of its field.
///
/// This module defines that intermediate representation.  A `TableKey` or
/// `TableData` is created by the driver for a specific table, and carries the
/// table's schema with it so that every setter can check and normalize the
/// width of the value it is given.  When the driver doesn't know the width of
/// a field, values are stored exactly as given.
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use common::bytestring;

use crate::AsicError;
use crate::AsicResult;

/// The widths of the key fields and action parameters of a single table, as
/// known by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub table_id: u32,
    /// key field id -> width in bits
    pub key_widths: BTreeMap<u32, u32>,
    /// action id -> param id -> width in bits
    pub action_params: BTreeMap<u32, BTreeMap<u32, u32>>,
}

impl TableSchema {
    /// A schema with no width information.  Values are accepted as given.
    pub fn new(table_id: u32) -> Self {
        TableSchema {
            table_id,
            ..Default::default()
        }
    }

    fn fit(
        width: Option<&u32>,
        what: &str,
        id: u32,
        value: &[u8],
    ) -> AsicResult<Bytes> {
        match width {
            Some(w) => bytestring::padded(value, *w).map_err(|e| {
                AsicError::InvalidArg(format!("{what} {id}: {e}"))
            }),
            None => Ok(Bytes::copy_from_slice(value)),
        }
    }
}

/// The value of a single key field, by match kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyField {
    Exact(Bytes),
    Ternary { value: Bytes, mask: Bytes },
    Lpm { prefix: Bytes, prefix_len: u16 },
    Range { low: Bytes, high: Bytes },
}

/// The schema-independent part of a table key.  Drivers use this to index
/// their entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchKey {
    pub fields: BTreeMap<u32, KeyField>,
    pub priority: Option<u32>,
}

/// A key identifying a single entry of a single table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableKey {
    schema: Arc<TableSchema>,
    key: MatchKey,
}

impl TableKey {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        TableKey {
            schema,
            key: MatchKey::default(),
        }
    }

    /// Rebuild a key from the driver's stored form.
    pub fn from_match_key(schema: Arc<TableSchema>, key: MatchKey) -> Self {
        TableKey { schema, key }
    }

    pub fn table_id(&self) -> u32 {
        self.schema.table_id
    }

    pub fn match_key(&self) -> &MatchKey {
        &self.key
    }

    fn fit(&self, id: u32, value: &[u8]) -> AsicResult<Bytes> {
        let width = self.schema.key_widths.get(&id);
        TableSchema::fit(width, "key field", id, value)
    }

    fn field(&self, id: u32) -> AsicResult<&KeyField> {
        self.key.fields.get(&id).ok_or_else(|| {
            AsicError::Missing(format!(
                "key field {id} not set in table {}",
                self.table_id()
            ))
        })
    }

    fn wrong_kind(&self, id: u32, want: &str) -> AsicError {
        AsicError::InvalidArg(format!(
            "key field {id} in table {} is not an {want} match",
            self.table_id()
        ))
    }

    pub fn set_exact(&mut self, id: u32, value: &[u8]) -> AsicResult<()> {
        let value = self.fit(id, value)?;
        self.key.fields.insert(id, KeyField::Exact(value));
        Ok(())
    }

    pub fn get_exact(&self, id: u32) -> AsicResult<Bytes> {
        match self.field(id)? {
            KeyField::Exact(v) => Ok(v.clone()),
            _ => Err(self.wrong_kind(id, "exact")),
        }
    }

    pub fn set_ternary(
        &mut self,
        id: u32,
        value: &[u8],
        mask: &[u8],
    ) -> AsicResult<()> {
        let value = self.fit(id, value)?;
        let mask = self.fit(id, mask)?;
        self.key.fields.insert(id, KeyField::Ternary { value, mask });
        Ok(())
    }

    pub fn get_ternary(&self, id: u32) -> AsicResult<(Bytes, Bytes)> {
        match self.field(id)? {
            KeyField::Ternary { value, mask } => {
                Ok((value.clone(), mask.clone()))
            }
            _ => Err(self.wrong_kind(id, "ternary")),
        }
    }

    pub fn set_lpm(
        &mut self,
        id: u32,
        prefix: &[u8],
        prefix_len: u16,
    ) -> AsicResult<()> {
        if let Some(width) = self.schema.key_widths.get(&id) {
            if u32::from(prefix_len) > *width {
                return Err(AsicError::InvalidArg(format!(
                    "prefix length {prefix_len} exceeds width {width} of \
                     key field {id}"
                )));
            }
        }
        let prefix = self.fit(id, prefix)?;
        self.key.fields.insert(id, KeyField::Lpm { prefix, prefix_len });
        Ok(())
    }

    pub fn get_lpm(&self, id: u32) -> AsicResult<(Bytes, u16)> {
        match self.field(id)? {
            KeyField::Lpm { prefix, prefix_len } => {
                Ok((prefix.clone(), *prefix_len))
            }
            _ => Err(self.wrong_kind(id, "lpm")),
        }
    }

    pub fn set_range(
        &mut self,
        id: u32,
        low: &[u8],
        high: &[u8],
    ) -> AsicResult<()> {
        let low = self.fit(id, low)?;
        let high = self.fit(id, high)?;
        self.key.fields.insert(id, KeyField::Range { low, high });
        Ok(())
    }

    pub fn get_range(&self, id: u32) -> AsicResult<(Bytes, Bytes)> {
        match self.field(id)? {
            KeyField::Range { low, high } => Ok((low.clone(), high.clone())),
            _ => Err(self.wrong_kind(id, "range")),
        }
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.key.priority = Some(priority);
    }

    pub fn get_priority(&self) -> Option<u32> {
        self.key.priority
    }
}

/// Byte and packet counts attached to a table entry or counter cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub bytes: u64,
    pub packets: u64,
}

/// The data half of a table entry: either an action with its parameters, a
/// reference to an action-profile member or selector group, and optionally
/// direct counter values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableData {
    schema: Arc<TableSchema>,
    action_id: u32,
    params: BTreeMap<u32, Bytes>,
    action_member_id: Option<u64>,
    selector_group_id: Option<u64>,
    counter: Option<CounterValue>,
    counter_only: bool,
}

impl TableData {
    /// Create a data object for `action_id`.  Zero means the action isn't
    /// known yet, or doesn't apply.
    pub fn new(schema: Arc<TableSchema>, action_id: u32) -> Self {
        TableData {
            schema,
            action_id,
            params: BTreeMap::new(),
            action_member_id: None,
            selector_group_id: None,
            counter: None,
            counter_only: false,
        }
    }

    pub fn table_id(&self) -> u32 {
        self.schema.table_id
    }

    /// Discard everything and start over with a new action.
    pub fn reset(&mut self, action_id: u32) {
        *self = TableData::new(self.schema.clone(), action_id);
    }

    pub fn action_id(&self) -> u32 {
        self.action_id
    }

    pub fn set_param(&mut self, id: u32, value: &[u8]) -> AsicResult<()> {
        let width = self
            .schema
            .action_params
            .get(&self.action_id)
            .and_then(|p| p.get(&id));
        let value = TableSchema::fit(width, "action param", id, value)?;
        self.params.insert(id, value);
        Ok(())
    }

    pub fn get_param(&self, id: u32) -> AsicResult<Bytes> {
        self.params.get(&id).cloned().ok_or_else(|| {
            AsicError::Missing(format!(
                "param {id} not set for action {}",
                self.action_id
            ))
        })
    }

    /// All parameters that have been set, in id order.
    pub fn params(&self) -> impl Iterator<Item = (u32, &Bytes)> {
        self.params.iter().map(|(id, v)| (*id, v))
    }

    pub fn set_action_member_id(&mut self, id: u64) {
        self.action_member_id = Some(id);
    }

    pub fn action_member_id(&self) -> Option<u64> {
        self.action_member_id
    }

    pub fn set_selector_group_id(&mut self, id: u64) {
        self.selector_group_id = Some(id);
    }

    pub fn selector_group_id(&self) -> Option<u64> {
        self.selector_group_id
    }

    pub fn set_counter_data(&mut self, bytes: u64, packets: u64) {
        self.counter = Some(CounterValue { bytes, packets });
    }

    /// Turn this into a data object that carries nothing but counter values,
    /// so that writing it leaves the entry's action untouched.
    pub fn set_only_counter_data(&mut self, bytes: u64, packets: u64) {
        let schema = self.schema.clone();
        *self = TableData::new(schema, 0);
        self.counter = Some(CounterValue { bytes, packets });
        self.counter_only = true;
    }

    pub fn counter_data(&self) -> Option<CounterValue> {
        self.counter
    }

    pub fn is_counter_only(&self) -> bool {
        self.counter_only
    }
}
