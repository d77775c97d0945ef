// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Arc;

use aal::ActionProfileGroup;
use aal::AsicError;
use aal::AsicResult;
use aal::IndirectCounter;
use aal::IndirectMeter;
use aal::MatchKey;
use aal::MeterSpec;
use aal::TableData;
use aal::TableKey;
use aal::TableSchema;
use common::bytestring;
use common::p4info::CounterUnit;

use crate::tofino_stub::schema::CounterInfo;
use crate::tofino_stub::schema::RegisterInfo;

/// The contents of every table and table-like object on a single device.
#[derive(Debug, Default)]
pub struct TableStore {
    entries: BTreeMap<u32, BTreeMap<MatchKey, TableData>>,
    defaults: BTreeMap<u32, TableData>,
    members: BTreeMap<u32, BTreeMap<u32, TableData>>,
    groups: BTreeMap<u32, BTreeMap<u32, ActionProfileGroup>>,
    counters: BTreeMap<u32, BTreeMap<u32, (u64, u64)>>,
    registers: BTreeMap<u32, BTreeMap<u32, u64>>,
    meters: BTreeMap<u32, BTreeMap<u32, IndirectMeter>>,
}

fn no_entry(table_id: u32) -> AsicError {
    AsicError::Missing(format!("no such entry in table {table_id}"))
}

/// Expand an optional index into the list of cells it covers.
fn cells(index: Option<u32>, size: u32) -> AsicResult<Vec<u32>> {
    match index {
        Some(i) if i >= size => Err(AsicError::InvalidArg(format!(
            "index {i} out of range for size {size}"
        ))),
        Some(i) => Ok(vec![i]),
        None => Ok((0..size).collect()),
    }
}

impl TableStore {
    fn check_key(table_id: u32, key: &TableKey) -> AsicResult<()> {
        match key.table_id() == table_id {
            true => Ok(()),
            false => Err(AsicError::InvalidArg(format!(
                "key for table {} used with table {table_id}",
                key.table_id()
            ))),
        }
    }

    pub fn entry_insert(
        &mut self,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
    ) -> AsicResult<()> {
        Self::check_key(table_id, key)?;
        if data.is_counter_only() {
            return Err(AsicError::InvalidArg(
                "cannot insert an entry with no action".to_string(),
            ));
        }
        let table = self.entries.entry(table_id).or_default();
        if table.contains_key(key.match_key()) {
            return Err(AsicError::Exists);
        }
        table.insert(key.match_key().clone(), data.clone());
        Ok(())
    }

    /// Replace the data of an existing entry.  Counter values survive unless
    /// the new data carries its own.
    pub fn entry_modify(
        &mut self,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
    ) -> AsicResult<()> {
        Self::check_key(table_id, key)?;
        let existing = self
            .entries
            .get_mut(&table_id)
            .and_then(|t| t.get_mut(key.match_key()))
            .ok_or_else(|| no_entry(table_id))?;

        let counter = data.counter_data().or(existing.counter_data());
        if !data.is_counter_only() {
            *existing = data.clone();
        }
        if let Some(c) = counter {
            existing.set_counter_data(c.bytes, c.packets);
        }
        Ok(())
    }

    pub fn entry_delete(
        &mut self,
        table_id: u32,
        key: &TableKey,
    ) -> AsicResult<()> {
        Self::check_key(table_id, key)?;
        self.entries
            .get_mut(&table_id)
            .and_then(|t| t.remove(key.match_key()))
            .map(|_| ())
            .ok_or_else(|| no_entry(table_id))
    }

    pub fn entry_get(
        &self,
        table_id: u32,
        key: &TableKey,
    ) -> AsicResult<TableData> {
        Self::check_key(table_id, key)?;
        self.entries
            .get(&table_id)
            .and_then(|t| t.get(key.match_key()))
            .cloned()
            .ok_or_else(|| no_entry(table_id))
    }

    pub fn entries_all(
        &self,
        schema: Arc<TableSchema>,
    ) -> Vec<(TableKey, TableData)> {
        match self.entries.get(&schema.table_id) {
            Some(t) => t
                .iter()
                .map(|(k, d)| {
                    let key =
                        TableKey::from_match_key(schema.clone(), k.clone());
                    (key, d.clone())
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn default_set(&mut self, table_id: u32, data: &TableData) {
        self.defaults.insert(table_id, data.clone());
    }

    pub fn default_reset(&mut self, table_id: u32) {
        self.defaults.remove(&table_id);
    }

    pub fn default_get(&self, schema: Arc<TableSchema>) -> TableData {
        match self.defaults.get(&schema.table_id) {
            Some(d) => d.clone(),
            None => TableData::new(schema, 0),
        }
    }

    pub fn member_insert(
        &mut self,
        profile_id: u32,
        member_id: u32,
        data: &TableData,
    ) -> AsicResult<()> {
        let members = self.members.entry(profile_id).or_default();
        if members.contains_key(&member_id) {
            return Err(AsicError::Exists);
        }
        members.insert(member_id, data.clone());
        Ok(())
    }

    pub fn member_modify(
        &mut self,
        profile_id: u32,
        member_id: u32,
        data: &TableData,
    ) -> AsicResult<()> {
        match self
            .members
            .get_mut(&profile_id)
            .and_then(|m| m.get_mut(&member_id))
        {
            Some(m) => {
                *m = data.clone();
                Ok(())
            }
            None => Err(AsicError::Missing(format!(
                "no member {member_id} in action profile {profile_id}"
            ))),
        }
    }

    /// Remove a member.  `selector_id` names the selector built on the
    /// profile, if there is one, so that members still in use by a group
    /// can't be removed.
    pub fn member_delete(
        &mut self,
        profile_id: u32,
        selector_id: Option<u32>,
        member_id: u32,
    ) -> AsicResult<()> {
        if let Some(groups) = selector_id.and_then(|s| self.groups.get(&s)) {
            if let Some(g) =
                groups.values().find(|g| g.member_ids.contains(&member_id))
            {
                return Err(AsicError::InvalidArg(format!(
                    "member {member_id} is still used by group {}",
                    g.group_id
                )));
            }
        }
        self.members
            .get_mut(&profile_id)
            .and_then(|m| m.remove(&member_id))
            .map(|_| ())
            .ok_or_else(|| {
                AsicError::Missing(format!(
                    "no member {member_id} in action profile {profile_id}"
                ))
            })
    }

    pub fn members_get(
        &self,
        profile_id: u32,
        member_id: u32,
    ) -> AsicResult<Vec<(u32, TableData)>> {
        let members = self.members.get(&profile_id);
        if member_id == 0 {
            return Ok(members
                .map(|m| m.iter().map(|(id, d)| (*id, d.clone())).collect())
                .unwrap_or_default());
        }
        members
            .and_then(|m| m.get(&member_id))
            .map(|d| vec![(member_id, d.clone())])
            .ok_or_else(|| {
                AsicError::Missing(format!(
                    "no member {member_id} in action profile {profile_id}"
                ))
            })
    }

    fn check_group(
        &self,
        profile_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()> {
        if group.max_group_size > 0
            && group.member_ids.len() > group.max_group_size as usize
        {
            return Err(AsicError::InvalidArg(format!(
                "group {} has {} members, more than its maximum of {}",
                group.group_id,
                group.member_ids.len(),
                group.max_group_size
            )));
        }
        if group.member_ids.len() != group.member_status.len() {
            return Err(AsicError::InvalidArg(format!(
                "group {} member status doesn't match its members",
                group.group_id
            )));
        }
        let members = self.members.get(&profile_id);
        for id in &group.member_ids {
            if !members.is_some_and(|m| m.contains_key(id)) {
                return Err(AsicError::InvalidArg(format!(
                    "group {} refers to missing member {id}",
                    group.group_id
                )));
            }
        }
        Ok(())
    }

    pub fn group_insert(
        &mut self,
        selector_id: u32,
        profile_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()> {
        self.check_group(profile_id, group)?;
        let groups = self.groups.entry(selector_id).or_default();
        if groups.contains_key(&group.group_id) {
            return Err(AsicError::Exists);
        }
        groups.insert(group.group_id, group.clone());
        Ok(())
    }

    pub fn group_modify(
        &mut self,
        selector_id: u32,
        profile_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()> {
        self.check_group(profile_id, group)?;
        match self
            .groups
            .get_mut(&selector_id)
            .and_then(|g| g.get_mut(&group.group_id))
        {
            Some(g) => {
                *g = group.clone();
                Ok(())
            }
            None => Err(AsicError::Missing(format!(
                "no group {} in action selector {selector_id}",
                group.group_id
            ))),
        }
    }

    pub fn group_delete(
        &mut self,
        selector_id: u32,
        group_id: u32,
    ) -> AsicResult<()> {
        self.groups
            .get_mut(&selector_id)
            .and_then(|g| g.remove(&group_id))
            .map(|_| ())
            .ok_or_else(|| {
                AsicError::Missing(format!(
                    "no group {group_id} in action selector {selector_id}"
                ))
            })
    }

    pub fn groups_get(
        &self,
        selector_id: u32,
        group_id: u32,
    ) -> AsicResult<Vec<ActionProfileGroup>> {
        let groups = self.groups.get(&selector_id);
        if group_id == 0 {
            return Ok(groups
                .map(|g| g.values().cloned().collect())
                .unwrap_or_default());
        }
        groups
            .and_then(|g| g.get(&group_id))
            .map(|g| vec![g.clone()])
            .ok_or_else(|| {
                AsicError::Missing(format!(
                    "no group {group_id} in action selector {selector_id}"
                ))
            })
    }

    pub fn counter_write(
        &mut self,
        counter_id: u32,
        info: CounterInfo,
        index: Option<u32>,
        bytes: Option<u64>,
        packets: Option<u64>,
    ) -> AsicResult<()> {
        let counter = self.counters.entry(counter_id).or_default();
        for i in cells(index, info.size)? {
            let cell = counter.entry(i).or_default();
            if let Some(b) = bytes {
                cell.0 = b;
            }
            if let Some(p) = packets {
                cell.1 = p;
            }
        }
        Ok(())
    }

    pub fn counter_read(
        &self,
        counter_id: u32,
        info: CounterInfo,
        index: Option<u32>,
    ) -> AsicResult<Vec<IndirectCounter>> {
        let (want_bytes, want_packets) = match info.unit {
            CounterUnit::Bytes => (true, false),
            CounterUnit::Packets => (false, true),
            CounterUnit::Both | CounterUnit::Unspecified => (true, true),
        };
        let counter = self.counters.get(&counter_id);
        Ok(cells(index, info.size)?
            .into_iter()
            .map(|i| {
                let (b, p) = counter
                    .and_then(|c| c.get(&i))
                    .copied()
                    .unwrap_or_default();
                IndirectCounter {
                    index: i,
                    bytes: want_bytes.then_some(b),
                    packets: want_packets.then_some(p),
                }
            })
            .collect())
    }

    pub fn register_write(
        &mut self,
        register_id: u32,
        info: RegisterInfo,
        index: Option<u32>,
        value: &[u8],
    ) -> AsicResult<()> {
        let v = bytestring::to_u64(&bytestring::padded(value, info.bitwidth)?)?;
        let register = self.registers.entry(register_id).or_default();
        for i in cells(index, info.size)? {
            register.insert(i, v);
        }
        Ok(())
    }

    pub fn register_read(
        &self,
        register_id: u32,
        info: RegisterInfo,
        index: Option<u32>,
    ) -> AsicResult<Vec<(u32, u64)>> {
        let register = self.registers.get(&register_id);
        Ok(cells(index, info.size)?
            .into_iter()
            .map(|i| {
                let v = register.and_then(|r| r.get(&i)).copied();
                (i, v.unwrap_or_default())
            })
            .collect())
    }

    pub fn meter_write(
        &mut self,
        meter_id: u32,
        size: u32,
        index: Option<u32>,
        in_pps: bool,
        spec: MeterSpec,
    ) -> AsicResult<()> {
        let meter = self.meters.entry(meter_id).or_default();
        for i in cells(index, size)? {
            meter.insert(
                i,
                IndirectMeter {
                    index: i,
                    in_pps,
                    spec,
                },
            );
        }
        Ok(())
    }

    pub fn meter_read(
        &self,
        meter_id: u32,
        size: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<IndirectMeter>> {
        let meter = self.meters.get(&meter_id);
        Ok(cells(index, size)?
            .into_iter()
            .map(|i| {
                meter
                    .and_then(|m| m.get(&i))
                    .copied()
                    .unwrap_or(IndirectMeter {
                        index: i,
                        ..Default::default()
                    })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<TableSchema> {
        let mut s = TableSchema::new(1);
        s.key_widths.insert(1, 16);
        Arc::new(s)
    }

    fn key(v: u8) -> TableKey {
        let mut k = TableKey::new(schema());
        k.set_exact(1, &[v]).unwrap();
        k
    }

    #[test]
    fn test_entry_lifecycle() {
        let mut store = TableStore::default();
        let data = TableData::new(schema(), 10);
        store.entry_insert(1, &key(1), &data).unwrap();
        assert!(matches!(
            store.entry_insert(1, &key(1), &data),
            Err(AsicError::Exists)
        ));
        assert!(store.entry_modify(1, &key(2), &data).is_err());
        assert!(store.entry_insert(2, &key(3), &data).is_err());

        let mut counters = TableData::new(schema(), 10);
        counters.set_only_counter_data(64, 1);
        store.entry_modify(1, &key(1), &counters).unwrap();
        let got = store.entry_get(1, &key(1)).unwrap();
        assert_eq!(got.action_id(), 10);
        assert_eq!(got.counter_data().map(|c| c.bytes), Some(64));

        // Changing the action keeps the counters.
        store
            .entry_modify(1, &key(1), &TableData::new(schema(), 11))
            .unwrap();
        let got = store.entry_get(1, &key(1)).unwrap();
        assert_eq!(got.action_id(), 11);
        assert_eq!(got.counter_data().map(|c| c.packets), Some(1));

        assert_eq!(store.entries_all(schema()).len(), 1);
        store.entry_delete(1, &key(1)).unwrap();
        assert!(store.entry_get(1, &key(1)).is_err());
    }

    #[test]
    fn test_group_members_must_exist() {
        let mut store = TableStore::default();
        let data = TableData::new(schema(), 10);
        store.member_insert(5, 1, &data).unwrap();
        let mut group = ActionProfileGroup {
            group_id: 9,
            max_group_size: 2,
            member_ids: vec![1, 2],
            member_status: vec![true, true],
        };
        assert!(store.group_insert(6, 5, &group).is_err());
        group.member_ids = vec![1];
        group.member_status = vec![true];
        store.group_insert(6, 5, &group).unwrap();
        assert!(store.member_delete(5, Some(6), 1).is_err());
        store.group_delete(6, 9).unwrap();
        store.member_delete(5, Some(6), 1).unwrap();
        assert!(store.members_get(5, 0).unwrap().is_empty());
    }

    #[test]
    fn test_counter_cells() {
        let mut store = TableStore::default();
        let info = CounterInfo {
            unit: CounterUnit::Packets,
            size: 4,
        };
        store.counter_write(3, info, None, Some(10), Some(1)).unwrap();
        store.counter_write(3, info, Some(2), None, Some(7)).unwrap();
        assert!(store.counter_write(3, info, Some(4), None, None).is_err());

        let all = store.counter_read(3, info, None).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[2].packets, Some(7));
        assert_eq!(all[2].bytes, None);
    }

    #[test]
    fn test_register_width() {
        let mut store = TableStore::default();
        let info = RegisterInfo {
            bitwidth: 8,
            size: 2,
        };
        store.register_write(4, info, Some(1), &[0, 0x2a]).unwrap();
        assert!(store.register_write(4, info, Some(1), &[1, 0]).is_err());
        assert_eq!(
            store.register_read(4, info, None).unwrap(),
            vec![(0, 0), (1, 0x2a)]
        );
    }
}
