// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The stub's view of the installed program.  The real SDE learns table
//! layouts from the bfrt.json artifact; the stub derives the same information
//! from the P4Info, and uses P4Info ids as its own object ids.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use aal::AsicError;
use aal::AsicResult;
use aal::TableSchema;
use common::p4info::CounterUnit;
use common::p4info::P4Info;

/// Action selectors share the id of the profile they are built on, with
/// this bit set.  P4Info never assigns ids with the top bit set.
pub const SELECTOR_FLAG: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterInfo {
    pub unit: CounterUnit,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
    pub bitwidth: u32,
    pub size: u32,
}

#[derive(Debug, Default)]
pub struct Schema {
    ids: BTreeSet<u32>,
    tables: BTreeMap<u32, Arc<TableSchema>>,
    selectors: BTreeMap<u32, u32>,
    pub counters: BTreeMap<u32, CounterInfo>,
    pub direct_counters: BTreeSet<u32>,
    pub registers: BTreeMap<u32, RegisterInfo>,
    pub meters: BTreeMap<u32, u32>,
}

/// Param widths for each of the listed actions.
fn action_params(
    p4info: &P4Info,
    ids: impl Iterator<Item = u32>,
) -> BTreeMap<u32, BTreeMap<u32, u32>> {
    ids.filter_map(|id| p4info.action(id))
        .map(|a| {
            let params = a.params.iter().map(|p| (p.id, p.bitwidth)).collect();
            (a.preamble.id, params)
        })
        .collect()
}

fn size_of(size: i64) -> u32 {
    u32::try_from(size.max(0)).unwrap_or(u32::MAX)
}

impl Schema {
    pub fn new(p4info: &P4Info) -> Self {
        let mut schema = Schema::default();

        for action in &p4info.actions {
            schema.ids.insert(action.preamble.id);
        }
        for table in &p4info.tables {
            let id = table.preamble.id;
            let ts = TableSchema {
                table_id: id,
                key_widths: table
                    .match_fields
                    .iter()
                    .map(|f| (f.id, f.bitwidth))
                    .collect(),
                action_params: action_params(
                    p4info,
                    table.action_refs.iter().map(|a| a.id),
                ),
            };
            schema.ids.insert(id);
            schema.tables.insert(id, Arc::new(ts));
        }
        for profile in &p4info.action_profiles {
            let id = profile.preamble.id;
            let actions = profile
                .table_ids
                .iter()
                .filter_map(|t| p4info.table(*t))
                .flat_map(|t| t.action_refs.iter().map(|a| a.id));
            let ts = TableSchema {
                table_id: id,
                key_widths: BTreeMap::new(),
                action_params: action_params(p4info, actions),
            };
            schema.ids.insert(id);
            schema.tables.insert(id, Arc::new(ts));
            if profile.with_selector {
                let selector = id | SELECTOR_FLAG;
                schema.ids.insert(selector);
                schema.selectors.insert(selector, id);
                schema
                    .tables
                    .insert(selector, Arc::new(TableSchema::new(selector)));
            }
        }
        for counter in &p4info.counters {
            let id = counter.preamble.id;
            schema.ids.insert(id);
            schema.counters.insert(
                id,
                CounterInfo {
                    unit: counter.unit,
                    size: size_of(counter.size),
                },
            );
        }
        for counter in &p4info.direct_counters {
            schema.ids.insert(counter.preamble.id);
            schema.direct_counters.insert(counter.direct_table_id);
        }
        for meter in &p4info.meters {
            schema.ids.insert(meter.preamble.id);
            schema.meters.insert(meter.preamble.id, size_of(meter.size));
        }
        for meter in &p4info.direct_meters {
            schema.ids.insert(meter.preamble.id);
        }
        for register in &p4info.registers {
            let id = register.preamble.id;
            schema.ids.insert(id);
            schema.registers.insert(
                id,
                RegisterInfo {
                    bitwidth: register.bitwidth,
                    size: size_of(i64::from(register.size)),
                },
            );
        }
        schema
    }

    pub fn table(&self, table_id: u32) -> AsicResult<Arc<TableSchema>> {
        self.tables
            .get(&table_id)
            .cloned()
            .ok_or_else(|| AsicError::Missing(format!("no table {table_id}")))
    }

    pub fn bfrt_id(&self, p4info_id: u32) -> AsicResult<u32> {
        match self.ids.contains(&p4info_id) {
            true => Ok(p4info_id),
            false => Err(AsicError::Missing(format!(
                "no object with p4info id {p4info_id}"
            ))),
        }
    }

    pub fn p4info_id(&self, bfrt_id: u32) -> AsicResult<u32> {
        match self.ids.contains(&bfrt_id) && bfrt_id & SELECTOR_FLAG == 0 {
            true => Ok(bfrt_id),
            false => Err(AsicError::Missing(format!(
                "no object with bfrt id {bfrt_id}"
            ))),
        }
    }

    pub fn selector_of(&self, profile_id: u32) -> AsicResult<u32> {
        let selector = profile_id | SELECTOR_FLAG;
        match self.selectors.contains_key(&selector) {
            true => Ok(selector),
            false => Err(AsicError::Missing(format!(
                "action profile {profile_id} has no selector"
            ))),
        }
    }

    pub fn profile_of(&self, selector_id: u32) -> AsicResult<u32> {
        self.selectors.get(&selector_id).copied().ok_or_else(|| {
            AsicError::Missing(format!("no action selector {selector_id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::p4info::Action;
    use common::p4info::ActionParam;
    use common::p4info::ActionProfile;
    use common::p4info::ActionRef;
    use common::p4info::MatchField;
    use common::p4info::Preamble;
    use common::p4info::Table;

    fn preamble(id: u32, name: &str) -> Preamble {
        Preamble {
            id,
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_schema_from_p4info() {
        let p4info = P4Info {
            tables: vec![Table {
                preamble: preamble(0x0200_0001, "ingress.fwd"),
                match_fields: vec![MatchField {
                    id: 1,
                    bitwidth: 9,
                    ..Default::default()
                }],
                action_refs: vec![ActionRef {
                    id: 0x0100_0001,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            actions: vec![Action {
                preamble: preamble(0x0100_0001, "ingress.set_port"),
                params: vec![ActionParam {
                    id: 1,
                    bitwidth: 9,
                    ..Default::default()
                }],
            }],
            action_profiles: vec![ActionProfile {
                preamble: preamble(0x1100_0001, "ingress.prof"),
                table_ids: vec![0x0200_0001],
                with_selector: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let schema = Schema::new(&p4info);

        let table = schema.table(0x0200_0001).unwrap();
        assert_eq!(table.key_widths.get(&1), Some(&9));
        assert_eq!(
            table.action_params.get(&0x0100_0001).and_then(|p| p.get(&1)),
            Some(&9)
        );
        let profile = schema.table(0x1100_0001).unwrap();
        assert!(profile.action_params.contains_key(&0x0100_0001));

        let selector = schema.selector_of(0x1100_0001).unwrap();
        assert_eq!(selector, 0x9100_0001);
        assert_eq!(schema.profile_of(selector).unwrap(), 0x1100_0001);
        assert_eq!(schema.bfrt_id(0x0100_0001).unwrap(), 0x0100_0001);
        assert!(schema.p4info_id(selector).is_err());
        assert!(schema.bfrt_id(42).is_err());
    }
}
