// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Match-action tables, and the per-table resources hanging off them:
//! direct counters, registers and meters.
//!
//! P4Runtime entries arrive here already translated into SDE numbering.  The
//! manager turns each one into an SDE key and data object using the P4Info
//! of the installed pipeline, and turns SDE state back into P4Runtime
//! entries on the way out.
//!
//! An entry can name its action through a one-shot action set instead of a
//! member or group the controller created.  The SDE has no such notion, so
//! the manager creates a hidden group (and members) on the table's action
//! selector, points the entry at it, and removes it again when the entry
//! changes or goes away.  Hidden objects use ids from
//! [`ONE_SHOT_ID_BASE`] up, which controllers may not use.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;

use crate::sync::sync_table;
use crate::types::sde_call;
use crate::types::ErrorAccumulator;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::write_entities;
use crate::writer::Writer;
use aal::ActionProfileGroup;
use aal::DeviceId;
use aal::MatchKey;
use aal::MeterSpec;
use aal::SdeInterface;
use aal::SessionHandle;
use aal::SyncKind;
use aal::TableData;
use aal::TableKey;
use common::bytestring::all_ones;
use common::bytestring::bytes_for_bits;
use common::bytestring::from_uint;
use common::bytestring::is_zero;
use common::bytestring::padded;
use common::p4info::MatchType;
use common::p4info::P4Info;
use common::p4info::Table;
use common::p4rt::Action;
use common::p4rt::ActionParam;
use common::p4rt::ActionProfileAction;
use common::p4rt::ActionProfileActionSet;
use common::p4rt::CounterData;
use common::p4rt::DirectCounterEntry;
use common::p4rt::Entity;
use common::p4rt::FieldMatch;
use common::p4rt::FieldMatchType;
use common::p4rt::Index;
use common::p4rt::MeterConfig;
use common::p4rt::MeterEntry;
use common::p4rt::P4Data;
use common::p4rt::ReadResponse;
use common::p4rt::RegisterEntry;
use common::p4rt::TableAction;
use common::p4rt::TableEntry;
use common::p4rt::UpdateType;

/// The SDE orders entries by priority the opposite way P4Runtime does, with
/// 0 as the highest.
const SDK_MAX_PRIORITY: u32 = 0xFF_FFFF;

/// Member and group ids at or above this value belong to one-shot action
/// sets.
pub const ONE_SHOT_ID_BASE: u32 = 0x7000_0000;

fn to_sdk_priority(priority: i32) -> StratumResult<u32> {
    match u32::try_from(priority) {
        Ok(p) if p > 0 && p <= SDK_MAX_PRIORITY => Ok(SDK_MAX_PRIORITY - p),
        _ => Err(StratumError::InvalidParam(format!(
            "Priority {priority} is out of range."
        ))),
    }
}

fn from_sdk_priority(priority: u32) -> StratumResult<i32> {
    match priority <= SDK_MAX_PRIORITY {
        // Fits, since SDK_MAX_PRIORITY < i32::MAX.
        true => Ok((SDK_MAX_PRIORITY - priority) as i32),
        false => Err(StratumError::Internal(format!(
            "SDE priority {priority} is out of range."
        ))),
    }
}

fn zero(bit_width: u32) -> Bytes {
    Bytes::from(vec![0u8; bytes_for_bits(bit_width)])
}

/// Convert an entity index into an SDE table index.  No index means "every
/// cell".
pub(crate) fn sdk_index(index: Option<Index>) -> StratumResult<Option<u32>> {
    index
        .map(|i| {
            u32::try_from(i.index).map_err(|_| {
                StratumError::InvalidParam(format!(
                    "Index {} is out of range.",
                    i.index
                ))
            })
        })
        .transpose()
}

pub(crate) fn find_table(p4info: &P4Info, table_id: u32) -> StratumResult<&Table> {
    p4info.table(table_id).ok_or_else(|| {
        StratumError::NotFound(format!("Table {table_id} not found in P4Info."))
    })
}

/// Build the SDE data for `action` in table (or action profile) `table_id`.
pub(crate) fn build_action_data(
    sde: &dyn SdeInterface,
    p4info: &P4Info,
    table_id: u32,
    action: &Action,
) -> StratumResult<TableData> {
    let info = p4info.action(action.action_id).ok_or_else(|| {
        StratumError::InvalidParam(format!(
            "Action {} not found in P4Info.",
            action.action_id
        ))
    })?;
    let action_id = sde_call!(sde.get_bfrt_id(action.action_id))?;
    let mut data = sde_call!(sde.create_table_data(table_id, action_id))?;
    for param in &action.params {
        if !info.params.iter().any(|p| p.id == param.param_id) {
            return Err(StratumError::InvalidParam(format!(
                "Action {} has no parameter {}.",
                action.action_id, param.param_id
            )));
        }
        sde_call!(data.set_param(param.param_id, &param.value))?;
    }
    Ok(data)
}

/// Rebuild the P4Runtime action held by `data`.
pub(crate) fn action_from_data(
    sde: &dyn SdeInterface,
    p4info: &P4Info,
    data: &TableData,
) -> StratumResult<Action> {
    let action_id = sde_call!(sde.get_p4info_id(data.action_id()))?;
    let info = p4info.action(action_id).ok_or_else(|| {
        StratumError::Internal(format!("Action {action_id} not found in P4Info."))
    })?;
    let params = info
        .params
        .iter()
        .map(|p| {
            Ok::<_, StratumError>(ActionParam {
                param_id: p.id,
                value: sde_call!(data.get_param(p.id))?,
            })
        })
        .collect::<StratumResult<Vec<_>>>()?;
    Ok(Action { action_id, params })
}

fn match_type_error(field_id: u32, table_id: u32, want: MatchType) -> StratumError {
    StratumError::InvalidParam(format!(
        "Match field {field_id} of table {table_id} must be a {want} match."
    ))
}

fn dont_care_error(field_id: u32, table_id: u32) -> StratumError {
    StratumError::InvalidParam(format!(
        "Match field {field_id} of table {table_id} is a don't-care match, \
         which must be omitted."
    ))
}

/// True if the table has a match field that needs entries to be ordered by
/// priority.
fn needs_priority(table: &Table) -> bool {
    table.match_fields.iter().any(|f| {
        matches!(
            f.match_type,
            MatchType::Ternary | MatchType::Range | MatchType::Optional
        )
    })
}

/// Fill `key` from the matches and priority of `entry`.  Fields the entry
/// leaves out match anything.
fn build_table_key(
    table: &Table,
    entry: &TableEntry,
    key: &mut TableKey,
) -> StratumResult<()> {
    let table_id = table.preamble.id;
    for m in &entry.matches {
        if table.match_field(m.field_id).is_none() {
            return Err(StratumError::InvalidParam(format!(
                "Table {table_id} has no match field {}.",
                m.field_id
            )));
        }
    }

    for field in &table.match_fields {
        let id = field.id;
        let width = field.bitwidth;
        let given = entry
            .matches
            .iter()
            .find(|m| m.field_id == id)
            .map(|m| &m.field_match_type);
        match (field.match_type, given) {
            (MatchType::Exact, Some(FieldMatchType::Exact { value })) => {
                sde_call!(key.set_exact(id, value))?
            }
            (MatchType::Exact, None) => sde_call!(key.set_exact(id, &zero(width)))?,
            (MatchType::Exact, Some(_)) => {
                return Err(match_type_error(id, table_id, MatchType::Exact))
            }

            (MatchType::Ternary, Some(FieldMatchType::Ternary { value, mask })) => {
                if is_zero(mask) {
                    return Err(dont_care_error(id, table_id));
                }
                sde_call!(key.set_ternary(id, value, mask))?
            }
            (MatchType::Ternary, None) => {
                sde_call!(key.set_ternary(id, &zero(width), &zero(width)))?
            }
            (MatchType::Ternary, Some(_)) => {
                return Err(match_type_error(id, table_id, MatchType::Ternary))
            }

            (MatchType::Lpm, Some(FieldMatchType::Lpm { value, prefix_len })) => {
                if *prefix_len == 0 {
                    return Err(dont_care_error(id, table_id));
                }
                let prefix_len = u16::try_from(*prefix_len)
                    .ok()
                    .filter(|l| u32::from(*l) <= width)
                    .ok_or_else(|| {
                        StratumError::InvalidParam(format!(
                            "Prefix length {prefix_len} of match field {id} \
                             in table {table_id} exceeds its width {width}."
                        ))
                    })?;
                sde_call!(key.set_lpm(id, value, prefix_len))?
            }
            (MatchType::Lpm, None) => sde_call!(key.set_lpm(id, &zero(width), 0))?,
            (MatchType::Lpm, Some(_)) => {
                return Err(match_type_error(id, table_id, MatchType::Lpm))
            }

            (MatchType::Range, Some(FieldMatchType::Range { low, high })) => {
                if is_full_range(low, high, width) {
                    return Err(dont_care_error(id, table_id));
                }
                sde_call!(key.set_range(id, low, high))?
            }
            (MatchType::Range, None) => {
                sde_call!(key.set_range(id, &zero(width), &all_ones(width)))?
            }
            (MatchType::Range, Some(_)) => {
                return Err(match_type_error(id, table_id, MatchType::Range))
            }

            // The SDE has no optional matches.  An optional match is a
            // ternary match whose mask is either all ones or all zeros.
            (MatchType::Optional, Some(FieldMatchType::Optional { value })) => {
                sde_call!(key.set_ternary(id, value, &all_ones(width)))?
            }
            (MatchType::Optional, None) => {
                sde_call!(key.set_ternary(id, &zero(width), &zero(width)))?
            }
            (MatchType::Optional, Some(_)) => {
                return Err(match_type_error(id, table_id, MatchType::Optional))
            }

            (MatchType::Unspecified, _) => {
                return Err(StratumError::Unimplemented(format!(
                    "Match field {id} of table {table_id} has no match type."
                )))
            }
        }
    }

    match (needs_priority(table), entry.priority) {
        (false, 0) => Ok(()),
        (false, p) => Err(StratumError::InvalidParam(format!(
            "Non-zero priority {p} for an entry of table {table_id}, which \
             has no ternary, range or optional match fields."
        ))),
        (true, 0) => Err(StratumError::InvalidParam(format!(
            "Zero priority for an entry of table {table_id}, which has \
             ternary, range or optional match fields."
        ))),
        (true, p) => {
            key.set_priority(to_sdk_priority(p)?);
            Ok(())
        }
    }
}

fn is_full_range(low: &[u8], high: &[u8], bit_width: u32) -> bool {
    is_zero(low)
        && padded(high, bit_width).is_ok_and(|h| h == all_ones(bit_width))
}

/// The matches and priority of an SDE key, with don't-care fields left out.
fn matches_from_key(
    table: &Table,
    key: &TableKey,
) -> StratumResult<(Vec<FieldMatch>, i32)> {
    let mut matches = Vec::new();
    for field in &table.match_fields {
        let id = field.id;
        let field_match_type = match field.match_type {
            MatchType::Exact => FieldMatchType::Exact {
                value: sde_call!(key.get_exact(id))?,
            },
            MatchType::Ternary => {
                let (value, mask) = sde_call!(key.get_ternary(id))?;
                if is_zero(&mask) {
                    continue;
                }
                FieldMatchType::Ternary { value, mask }
            }
            MatchType::Lpm => {
                let (value, prefix_len) = sde_call!(key.get_lpm(id))?;
                if prefix_len == 0 {
                    continue;
                }
                FieldMatchType::Lpm {
                    value,
                    prefix_len: u32::from(prefix_len),
                }
            }
            MatchType::Range => {
                let (low, high) = sde_call!(key.get_range(id))?;
                if is_full_range(&low, &high, field.bitwidth) {
                    continue;
                }
                FieldMatchType::Range { low, high }
            }
            MatchType::Optional => {
                let (value, mask) = sde_call!(key.get_ternary(id))?;
                if is_zero(&mask) {
                    continue;
                }
                FieldMatchType::Optional { value }
            }
            MatchType::Unspecified => continue,
        };
        matches.push(FieldMatch {
            field_id: id,
            field_match_type,
        });
    }

    let priority = match (needs_priority(table), key.get_priority()) {
        (true, Some(p)) => from_sdk_priority(p)?,
        _ => 0,
    };
    Ok((matches, priority))
}

fn sdk_counter_value(count: i64, what: &str) -> StratumResult<u64> {
    u64::try_from(count).map_err(|_| {
        StratumError::InvalidParam(format!("Negative {what} count {count}."))
    })
}

fn sdk_meter_value(value: i64, what: &str) -> StratumResult<u64> {
    u64::try_from(value).map_err(|_| {
        StratumError::InvalidParam(format!("Negative meter {what} {value}."))
    })
}

fn p4_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn p4_counter_data(data: &TableData) -> CounterData {
    data.counter_data()
        .map(|c| CounterData {
            byte_count: p4_count(c.bytes),
            packet_count: p4_count(c.packets),
        })
        .unwrap_or_default()
}

/// The hidden objects behind a one-shot action set.  Ids are SDE ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct OneShot {
    profile_id: u32,
    selector_id: u32,
    group_id: Option<u32>,
    member_ids: Vec<u32>,
}

#[derive(Debug, Default)]
struct TableState {
    p4info: Option<Arc<P4Info>>,
    // Keyed by SDE table id and the key of the entry using the set.
    one_shots: BTreeMap<(u32, MatchKey), OneShot>,
    next_one_shot_id: u32,
}

impl TableState {
    fn p4info(&self) -> StratumResult<Arc<P4Info>> {
        self.p4info.clone().ok_or_else(|| {
            StratumError::NotInitialized(
                "No forwarding pipeline has been pushed.".to_string(),
            )
        })
    }

    fn allocate_one_shot_id(&mut self) -> StratumResult<u32> {
        let id = self.next_one_shot_id.max(ONE_SHOT_ID_BASE);
        if id == u32::MAX {
            return Err(StratumError::Internal(
                "Out of ids for one-shot action sets.".to_string(),
            ));
        }
        self.next_one_shot_id = id + 1;
        Ok(id)
    }
}

pub struct TableManager {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    sync_timeout: Duration,
    state: RwLock<TableState>,
}

impl TableManager {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        device: DeviceId,
        sync_timeout: Duration,
    ) -> Self {
        TableManager {
            log: log.new(o!("unit" => "table_manager", "device" => device)),
            sde,
            device,
            sync_timeout,
            state: RwLock::new(TableState::default()),
        }
    }

    /// Adopt the P4Info of a newly installed pipeline.  Installing a
    /// pipeline wipes the device, so any hidden objects are gone too.
    pub fn push_forwarding_pipeline_config(
        &self,
        p4info: &P4Info,
    ) -> StratumResult<()> {
        let mut state = self.state.write();
        state.p4info = Some(Arc::new(p4info.clone()));
        state.one_shots.clear();
        state.next_one_shot_id = ONE_SHOT_ID_BASE;
        info!(self.log, "pipeline pushed"; "tables" => p4info.tables.len());
        Ok(())
    }

    pub fn write_table_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &TableEntry,
    ) -> StratumResult<()> {
        let mut state = self.state.write();
        let p4info = state.p4info()?;
        let table = find_table(&p4info, entry.table_id)?;
        let table_id = sde_call!(self.sde.get_bfrt_id(entry.table_id))?;
        if entry.meter_config.is_some() {
            return Err(StratumError::Unimplemented(
                "Direct meters are not supported.".to_string(),
            ));
        }
        if entry.is_default_action {
            return self.write_default_entry(
                session,
                update_type,
                &p4info,
                table_id,
                entry,
            );
        }

        let mut key = sde_call!(self.sde.create_table_key(table_id))?;
        build_table_key(table, entry, &mut key)?;
        let one_shot_key = (table_id, key.match_key().clone());

        match update_type {
            UpdateType::Insert | UpdateType::Modify => {
                let action = entry.action.as_ref().ok_or_else(|| {
                    StratumError::InvalidParam(format!(
                        "Entry of table {} has no action.",
                        entry.table_id
                    ))
                })?;
                let (mut data, one_shot) = self.build_table_data(
                    &mut state, session, &p4info, table, table_id, action,
                )?;
                if let Some(c) = entry.counter_data {
                    data.set_counter_data(
                        sdk_counter_value(c.byte_count, "byte")?,
                        sdk_counter_value(c.packet_count, "packet")?,
                    );
                }
                let result = match update_type {
                    UpdateType::Insert => sde_call!(self.sde.insert_table_entry(
                        self.device,
                        session,
                        table_id,
                        &key,
                        &data
                    )),
                    _ => sde_call!(self.sde.modify_table_entry(
                        self.device,
                        session,
                        table_id,
                        &key,
                        &data
                    )),
                };
                if let Err(e) = result {
                    if let Some(o) = one_shot {
                        self.discard_one_shot(session, &o);
                    }
                    return Err(e);
                }
                let old = match one_shot {
                    Some(o) => state.one_shots.insert(one_shot_key, o),
                    None => state.one_shots.remove(&one_shot_key),
                };
                match old {
                    Some(old) => self.delete_one_shot(session, &old),
                    None => Ok(()),
                }
            }
            UpdateType::Delete => {
                sde_call!(self.sde.delete_table_entry(
                    self.device,
                    session,
                    table_id,
                    &key
                ))?;
                match state.one_shots.remove(&one_shot_key) {
                    Some(old) => self.delete_one_shot(session, &old),
                    None => Ok(()),
                }
            }
            UpdateType::Unspecified => Err(StratumError::InvalidParam(
                "Unspecified update type.".to_string(),
            )),
        }
    }

    fn write_default_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        p4info: &P4Info,
        table_id: u32,
        entry: &TableEntry,
    ) -> StratumResult<()> {
        if update_type != UpdateType::Modify {
            return Err(StratumError::InvalidParam(format!(
                "The default entry of table {} can only be modified.",
                entry.table_id
            )));
        }
        if !entry.matches.is_empty() || entry.priority != 0 {
            return Err(StratumError::InvalidParam(format!(
                "The default entry of table {} must not have matches or a \
                 priority.",
                entry.table_id
            )));
        }
        match &entry.action {
            None => sde_call!(self.sde.reset_default_table_entry(
                self.device,
                session,
                table_id
            )),
            Some(TableAction::Action(action)) => {
                let data =
                    build_action_data(self.sde.as_ref(), p4info, table_id, action)?;
                sde_call!(self.sde.set_default_table_entry(
                    self.device,
                    session,
                    table_id,
                    &data
                ))
            }
            Some(TableAction::ActionProfileMemberId(id)) => {
                let mut data = sde_call!(self.sde.create_table_data(table_id, 0))?;
                data.set_action_member_id(u64::from(*id));
                sde_call!(self.sde.set_default_table_entry(
                    self.device,
                    session,
                    table_id,
                    &data
                ))
            }
            Some(TableAction::ActionProfileGroupId(id)) => {
                let mut data = sde_call!(self.sde.create_table_data(table_id, 0))?;
                data.set_selector_group_id(u64::from(*id));
                sde_call!(self.sde.set_default_table_entry(
                    self.device,
                    session,
                    table_id,
                    &data
                ))
            }
            Some(TableAction::ActionProfileActionSet(_)) => {
                Err(StratumError::Unimplemented(format!(
                    "One-shot action sets are not supported for the default \
                     entry of table {}.",
                    entry.table_id
                )))
            }
        }
    }

    /// Build the data for an entry's action.  A one-shot action set creates
    /// its hidden objects, which are returned so the caller can keep track
    /// of them.
    fn build_table_data(
        &self,
        state: &mut TableState,
        session: &SessionHandle,
        p4info: &P4Info,
        table: &Table,
        table_id: u32,
        action: &TableAction,
    ) -> StratumResult<(TableData, Option<OneShot>)> {
        match action {
            TableAction::Action(action) => {
                let data =
                    build_action_data(self.sde.as_ref(), p4info, table_id, action)?;
                Ok((data, None))
            }
            TableAction::ActionProfileMemberId(id) => {
                let mut data = sde_call!(self.sde.create_table_data(table_id, 0))?;
                data.set_action_member_id(u64::from(*id));
                Ok((data, None))
            }
            TableAction::ActionProfileGroupId(id) => {
                let mut data = sde_call!(self.sde.create_table_data(table_id, 0))?;
                data.set_selector_group_id(u64::from(*id));
                Ok((data, None))
            }
            TableAction::ActionProfileActionSet(set) => {
                let one_shot =
                    self.create_one_shot(state, session, p4info, table, set)?;
                let mut data = match sde_call!(self.sde.create_table_data(table_id, 0))
                {
                    Ok(d) => d,
                    Err(e) => {
                        self.discard_one_shot(session, &one_shot);
                        return Err(e);
                    }
                };
                if let Some(group_id) = one_shot.group_id {
                    data.set_selector_group_id(u64::from(group_id));
                }
                Ok((data, Some(one_shot)))
            }
        }
    }

    fn create_one_shot(
        &self,
        state: &mut TableState,
        session: &SessionHandle,
        p4info: &P4Info,
        table: &Table,
        set: &ActionProfileActionSet,
    ) -> StratumResult<OneShot> {
        let table_id = table.preamble.id;
        let profile = p4info
            .action_profile(table.implementation_id)
            .filter(|p| p.with_selector)
            .ok_or_else(|| {
                StratumError::InvalidParam(format!(
                    "Table {table_id} has no action selector, which one-shot \
                     action sets need."
                ))
            })?;
        if set.action_profile_actions.is_empty() {
            return Err(StratumError::InvalidParam(format!(
                "Empty one-shot action set for table {table_id}."
            )));
        }
        if let Some(a) = set.action_profile_actions.iter().find(|a| a.weight != 1)
        {
            return Err(StratumError::Unimplemented(format!(
                "One-shot action weight {} is not supported; only weight 1 is.",
                a.weight
            )));
        }

        let profile_id = sde_call!(self.sde.get_bfrt_id(profile.preamble.id))?;
        let selector_id =
            sde_call!(self.sde.get_action_selector_bfrt_id(profile_id))?;
        let mut one_shot = OneShot {
            profile_id,
            selector_id,
            ..Default::default()
        };
        for a in &set.action_profile_actions {
            let result = state.allocate_one_shot_id().and_then(|member_id| {
                let data = build_action_data(
                    self.sde.as_ref(),
                    p4info,
                    profile_id,
                    &a.action,
                )?;
                sde_call!(self.sde.insert_action_profile_member(
                    self.device,
                    session,
                    profile_id,
                    member_id,
                    &data
                ))?;
                Ok(member_id)
            });
            match result {
                Ok(id) => one_shot.member_ids.push(id),
                Err(e) => {
                    self.discard_one_shot(session, &one_shot);
                    return Err(e);
                }
            }
        }

        let members = one_shot.member_ids.len();
        let max_group_size = u32::try_from(profile.max_group_size)
            .ok()
            .filter(|s| *s > 0)
            .unwrap_or(members as u32);
        let result = state.allocate_one_shot_id().and_then(|group_id| {
            let group = ActionProfileGroup {
                group_id,
                max_group_size,
                member_ids: one_shot.member_ids.clone(),
                member_status: vec![true; members],
            };
            sde_call!(self.sde.insert_action_profile_group(
                self.device,
                session,
                selector_id,
                &group
            ))?;
            Ok(group_id)
        });
        match result {
            Ok(id) => one_shot.group_id = Some(id),
            Err(e) => {
                self.discard_one_shot(session, &one_shot);
                return Err(e);
            }
        }
        debug!(self.log, "created one-shot action set";
            "table_id" => table_id,
            "group_id" => one_shot.group_id,
            "members" => members);
        Ok(one_shot)
    }

    /// Remove the hidden objects of a one-shot action set, group first.
    fn delete_one_shot(
        &self,
        session: &SessionHandle,
        one_shot: &OneShot,
    ) -> StratumResult<()> {
        let mut errors = ErrorAccumulator::new();
        if let Some(group_id) = one_shot.group_id {
            errors.push(sde_call!(self.sde.delete_action_profile_group(
                self.device,
                session,
                one_shot.selector_id,
                group_id
            )));
        }
        for member_id in &one_shot.member_ids {
            errors.push(sde_call!(self.sde.delete_action_profile_member(
                self.device,
                session,
                one_shot.profile_id,
                *member_id
            )));
        }
        errors.into_result()
    }

    /// Clean up after a write that failed part way.  The original failure
    /// is what gets reported, so problems here are only logged.
    fn discard_one_shot(&self, session: &SessionHandle, one_shot: &OneShot) {
        if let Err(e) = self.delete_one_shot(session, one_shot) {
            warn!(self.log, "failed to remove one-shot action set";
                "group_id" => one_shot.group_id,
                "error" => %e);
        }
    }

    /// Rebuild the action of an entry from its SDE data.
    fn entry_action(
        &self,
        state: &TableState,
        session: &SessionHandle,
        p4info: &P4Info,
        table_id: u32,
        key: Option<&TableKey>,
        data: &TableData,
    ) -> StratumResult<Option<TableAction>> {
        if let Some(group_id) = data.selector_group_id() {
            let one_shot = key.and_then(|k| {
                state.one_shots.get(&(table_id, k.match_key().clone()))
            });
            if let Some(one_shot) = one_shot {
                return self.one_shot_action_set(session, p4info, one_shot).map(Some);
            }
            return Ok(Some(TableAction::ActionProfileGroupId(group_id as u32)));
        }
        if let Some(member_id) = data.action_member_id() {
            return Ok(Some(TableAction::ActionProfileMemberId(member_id as u32)));
        }
        if data.action_id() == 0 {
            return Ok(None);
        }
        action_from_data(self.sde.as_ref(), p4info, data)
            .map(|a| Some(TableAction::Action(a)))
    }

    fn one_shot_action_set(
        &self,
        session: &SessionHandle,
        p4info: &P4Info,
        one_shot: &OneShot,
    ) -> StratumResult<TableAction> {
        let mut actions = Vec::with_capacity(one_shot.member_ids.len());
        for member_id in &one_shot.member_ids {
            let members = sde_call!(self.sde.get_action_profile_members(
                self.device,
                session,
                one_shot.profile_id,
                *member_id
            ))?;
            for (_, data) in members {
                actions.push(ActionProfileAction {
                    action: action_from_data(self.sde.as_ref(), p4info, &data)?,
                    weight: 1,
                });
            }
        }
        Ok(TableAction::ActionProfileActionSet(ActionProfileActionSet {
            action_profile_actions: actions,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn p4_table_entry(
        &self,
        state: &TableState,
        session: &SessionHandle,
        p4info: &P4Info,
        table: &Table,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
        with_counters: bool,
    ) -> StratumResult<TableEntry> {
        let (matches, priority) = matches_from_key(table, key)?;
        Ok(TableEntry {
            table_id: table.preamble.id,
            matches,
            action: self.entry_action(
                state,
                session,
                p4info,
                table_id,
                Some(key),
                data,
            )?,
            priority,
            counter_data: with_counters.then(|| p4_counter_data(data)),
            ..Default::default()
        })
    }

    fn sync_counters(
        &self,
        session: &SessionHandle,
        table_id: u32,
    ) -> StratumResult<()> {
        sync_table(
            self.sde.as_ref(),
            self.device,
            session,
            table_id,
            SyncKind::Counters,
            self.sync_timeout,
        )
    }

    /// Every entry of `table`.
    fn read_all_entries(
        &self,
        state: &TableState,
        session: &SessionHandle,
        p4info: &P4Info,
        table: &Table,
        with_counters: bool,
    ) -> StratumResult<Vec<Entity>> {
        let table_id = sde_call!(self.sde.get_bfrt_id(table.preamble.id))?;
        if with_counters {
            self.sync_counters(session, table_id)?;
        }
        let entries = sde_call!(self.sde.get_all_table_entries(
            self.device,
            session,
            table_id
        ))?;
        entries
            .iter()
            .map(|(key, data)| {
                self.p4_table_entry(
                    state,
                    session,
                    p4info,
                    table,
                    table_id,
                    key,
                    data,
                    with_counters,
                )
                .map(Entity::TableEntry)
            })
            .collect()
    }

    /// Read the entries selected by `entry`: every entry of every table if
    /// its table id is 0, every entry of its table if it has no matches,
    /// the table's default entry, or a single entry.
    pub fn read_table_entry(
        &self,
        session: &SessionHandle,
        entry: &TableEntry,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        let state = self.state.read();
        let p4info = state.p4info()?;
        let with_counters = entry.counter_data.is_some();

        if entry.table_id == 0 {
            let mut entities = Vec::new();
            for table in &p4info.tables {
                entities.extend(self.read_all_entries(
                    &state,
                    session,
                    &p4info,
                    table,
                    with_counters,
                )?);
            }
            return write_entities(writer, entities);
        }

        let table = find_table(&p4info, entry.table_id)?;
        let table_id = sde_call!(self.sde.get_bfrt_id(entry.table_id))?;

        if entry.is_default_action {
            if !entry.matches.is_empty() || entry.priority != 0 {
                return Err(StratumError::InvalidParam(format!(
                    "The default entry of table {} has no matches or priority.",
                    entry.table_id
                )));
            }
            if with_counters {
                self.sync_counters(session, table_id)?;
            }
            let data = sde_call!(self.sde.get_default_table_entry(
                self.device,
                session,
                table_id
            ))?;
            let result = TableEntry {
                table_id: entry.table_id,
                action: self.entry_action(
                    &state, session, &p4info, table_id, None, &data,
                )?,
                is_default_action: true,
                counter_data: with_counters.then(|| p4_counter_data(&data)),
                ..Default::default()
            };
            return write_entities(writer, vec![Entity::TableEntry(result)]);
        }

        if entry.matches.is_empty() {
            if entry.priority != 0 || entry.action.is_some() {
                return Err(StratumError::Unimplemented(format!(
                    "Reads of table {} filtered by priority or action are \
                     not supported.",
                    entry.table_id
                )));
            }
            let entities = self.read_all_entries(
                &state,
                session,
                &p4info,
                table,
                with_counters,
            )?;
            return write_entities(writer, entities);
        }

        let mut key = sde_call!(self.sde.create_table_key(table_id))?;
        build_table_key(table, entry, &mut key)?;
        if with_counters {
            self.sync_counters(session, table_id)?;
        }
        let data = sde_call!(self.sde.get_table_entry(
            self.device,
            session,
            table_id,
            &key
        ))?;
        let result = self.p4_table_entry(
            &state,
            session,
            &p4info,
            table,
            table_id,
            &key,
            &data,
            with_counters,
        )?;
        write_entities(writer, vec![Entity::TableEntry(result)])
    }

    /// Set the direct counter of an existing entry.  Leaving out the data
    /// leaves the counter alone.
    pub fn write_direct_counter_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        counter: &DirectCounterEntry,
    ) -> StratumResult<()> {
        if update_type != UpdateType::Modify {
            return Err(StratumError::InvalidParam(
                "Direct counters can only be modified.".to_string(),
            ));
        }
        let state = self.state.read();
        let p4info = state.p4info()?;
        let entry = counter.table_entry.as_ref().ok_or_else(|| {
            StratumError::InvalidParam(
                "Direct counter entry has no table entry.".to_string(),
            )
        })?;
        if entry.action.is_some() {
            return Err(StratumError::InvalidParam(
                "The table entry of a direct counter must not have an action."
                    .to_string(),
            ));
        }
        let table = find_table(&p4info, entry.table_id)?;
        let table_id = sde_call!(self.sde.get_bfrt_id(entry.table_id))?;
        let mut key = sde_call!(self.sde.create_table_key(table_id))?;
        build_table_key(table, entry, &mut key)?;

        // The entry has to exist, whether or not there is anything to write.
        sde_call!(self.sde.get_table_entry(self.device, session, table_id, &key))?;
        let Some(values) = counter.data else {
            return Ok(());
        };
        let mut data = sde_call!(self.sde.create_table_data(table_id, 0))?;
        data.set_only_counter_data(
            sdk_counter_value(values.byte_count, "byte")?,
            sdk_counter_value(values.packet_count, "packet")?,
        );
        sde_call!(self.sde.modify_table_entry(
            self.device,
            session,
            table_id,
            &key,
            &data
        ))
    }

    pub fn read_direct_counter_entry(
        &self,
        session: &SessionHandle,
        counter: &DirectCounterEntry,
    ) -> StratumResult<DirectCounterEntry> {
        let state = self.state.read();
        let p4info = state.p4info()?;
        let entry = counter.table_entry.as_ref().ok_or_else(|| {
            StratumError::InvalidParam(
                "Direct counter entry has no table entry.".to_string(),
            )
        })?;
        let table = find_table(&p4info, entry.table_id)?;
        let table_id = sde_call!(self.sde.get_bfrt_id(entry.table_id))?;
        let mut key = sde_call!(self.sde.create_table_key(table_id))?;
        build_table_key(table, entry, &mut key)?;

        self.sync_counters(session, table_id)?;
        let data = sde_call!(self.sde.get_table_entry(
            self.device,
            session,
            table_id,
            &key
        ))?;
        Ok(DirectCounterEntry {
            table_entry: Some(entry.clone()),
            data: Some(p4_counter_data(&data)),
        })
    }

    pub fn write_register_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        register: &RegisterEntry,
    ) -> StratumResult<()> {
        if update_type != UpdateType::Modify {
            return Err(StratumError::InvalidParam(
                "Registers can only be modified.".to_string(),
            ));
        }
        let state = self.state.read();
        let p4info = state.p4info()?;
        p4info.register(register.register_id).ok_or_else(|| {
            StratumError::NotFound(format!(
                "Register {} not found in P4Info.",
                register.register_id
            ))
        })?;
        let value = match &register.data {
            Some(P4Data::Bitstring(value)) => value,
            Some(_) => {
                return Err(StratumError::Unimplemented(
                    "Only bitstring register data is supported.".to_string(),
                ))
            }
            None => {
                return Err(StratumError::InvalidParam(
                    "Register entry has no data.".to_string(),
                ))
            }
        };
        let table_id = sde_call!(self.sde.get_bfrt_id(register.register_id))?;
        let index = sdk_index(register.index)?;
        sde_call!(self.sde.write_register(
            self.device,
            session,
            table_id,
            index,
            value
        ))
    }

    /// Read one cell of a register, or all of them if no index is given.
    pub fn read_register_entry(
        &self,
        session: &SessionHandle,
        register: &RegisterEntry,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        let state = self.state.read();
        let p4info = state.p4info()?;
        let info = p4info.register(register.register_id).ok_or_else(|| {
            StratumError::NotFound(format!(
                "Register {} not found in P4Info.",
                register.register_id
            ))
        })?;
        let table_id = sde_call!(self.sde.get_bfrt_id(register.register_id))?;
        let index = sdk_index(register.index)?;

        sync_table(
            self.sde.as_ref(),
            self.device,
            session,
            table_id,
            SyncKind::Registers,
            self.sync_timeout,
        )?;
        let cells = sde_call!(self.sde.read_registers(
            self.device,
            session,
            table_id,
            index
        ))?;
        let width = match info.bitwidth {
            0 => 64,
            w => w.min(64),
        };
        let entities = cells
            .into_iter()
            .map(|(i, value)| {
                Ok::<_, StratumError>(Entity::RegisterEntry(RegisterEntry {
                    register_id: register.register_id,
                    index: Some(Index { index: i64::from(i) }),
                    data: Some(P4Data::Bitstring(from_uint(value, width)?)),
                }))
            })
            .collect::<StratumResult<Vec<_>>>()?;
        write_entities(writer, entities)
    }

    /// Configure one cell of an indirect meter, or all of them if no index
    /// is given.  A meter without a config goes back to passing everything.
    pub fn write_meter_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        meter: &MeterEntry,
    ) -> StratumResult<()> {
        if update_type != UpdateType::Modify {
            return Err(StratumError::InvalidParam(
                "Meters can only be modified.".to_string(),
            ));
        }
        let state = self.state.read();
        let p4info = state.p4info()?;
        find_meter(&p4info, meter.meter_id)?;
        let table_id = sde_call!(self.sde.get_bfrt_id(meter.meter_id))?;
        let index = sdk_index(meter.index)?;
        let spec = match meter.config {
            Some(c) => MeterSpec {
                cir: sdk_meter_value(c.cir, "cir")?,
                cburst: sdk_meter_value(c.cburst, "cburst")?,
                pir: sdk_meter_value(c.pir, "pir")?,
                pburst: sdk_meter_value(c.pburst, "pburst")?,
            },
            None => MeterSpec::default(),
        };
        sde_call!(self.sde.write_indirect_meter(
            self.device,
            session,
            table_id,
            index,
            false,
            spec
        ))
    }

    pub fn read_meter_entry(
        &self,
        session: &SessionHandle,
        meter: &MeterEntry,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        let state = self.state.read();
        let p4info = state.p4info()?;
        find_meter(&p4info, meter.meter_id)?;
        let table_id = sde_call!(self.sde.get_bfrt_id(meter.meter_id))?;
        let index = sdk_index(meter.index)?;
        let cells = sde_call!(self.sde.read_indirect_meters(
            self.device,
            session,
            table_id,
            index
        ))?;
        let entities = cells
            .into_iter()
            .map(|m| {
                Entity::MeterEntry(MeterEntry {
                    meter_id: meter.meter_id,
                    index: Some(Index {
                        index: i64::from(m.index),
                    }),
                    config: Some(MeterConfig {
                        cir: p4_count(m.spec.cir),
                        cburst: p4_count(m.spec.cburst),
                        pir: p4_count(m.spec.pir),
                        pburst: p4_count(m.spec.pburst),
                    }),
                })
            })
            .collect();
        write_entities(writer, entities)
    }
}

fn find_meter(p4info: &P4Info, meter_id: u32) -> StratumResult<()> {
    match p4info.meters.iter().any(|m| m.preamble.id == meter_id) {
        true => Ok(()),
        false => Err(StratumError::NotFound(format!(
            "Meter {meter_id} not found in P4Info."
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::test_utils::stub_sde;
    use crate::test_utils::test_logger;
    use crate::types::ErrorCode;
    use aal::DeviceConfig;
    use aal::Program;
    use asic::Handle;
    use common::p4info::Action as ActionInfo;
    use common::p4info::ActionParam as ActionParamInfo;
    use common::p4info::ActionProfile;
    use common::p4info::ActionRef;
    use common::p4info::DirectCounter;
    use common::p4info::MatchField;
    use common::p4info::Meter;
    use common::p4info::Preamble;
    use common::p4info::Register;
    use pretty_assertions::assert_eq;

    pub const EXACT_TABLE: u32 = 0x0200_0001;
    pub const ACL_TABLE: u32 = 0x0200_0002;
    pub const LPM_TABLE: u32 = 0x0200_0003;
    pub const SELECTOR_TABLE: u32 = 0x0200_0004;
    pub const SET_PORT: u32 = 0x0100_0001;
    pub const DROP: u32 = 0x0100_0002;
    pub const PROFILE: u32 = 0x1100_0001;
    pub const DIRECT_COUNTER: u32 = 0x1300_0001;
    pub const METER: u32 = 0x1500_0001;
    pub const REGISTER: u32 = 0x1600_0001;

    fn preamble(id: u32, name: &str) -> Preamble {
        Preamble {
            id,
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn field(id: u32, bitwidth: u32, match_type: MatchType) -> MatchField {
        MatchField {
            id,
            name: format!("f{id}"),
            bitwidth,
            match_type,
            ..Default::default()
        }
    }

    fn table(id: u32, fields: Vec<MatchField>, actions: &[u32]) -> Table {
        Table {
            preamble: preamble(id, &format!("t{id:x}")),
            match_fields: fields,
            action_refs: actions
                .iter()
                .map(|id| ActionRef {
                    id: *id,
                    ..Default::default()
                })
                .collect(),
            size: 1024,
            ..Default::default()
        }
    }

    /// A pipeline with one table of each kind, a selector, and one each of
    /// the indexed externs.
    pub fn p4info() -> P4Info {
        let mut selector_table = table(
            SELECTOR_TABLE,
            vec![field(1, 16, MatchType::Exact)],
            &[SET_PORT, DROP],
        );
        selector_table.implementation_id = PROFILE;
        P4Info {
            tables: vec![
                table(
                    EXACT_TABLE,
                    vec![field(1, 9, MatchType::Exact)],
                    &[SET_PORT, DROP],
                ),
                table(
                    ACL_TABLE,
                    vec![
                        field(1, 32, MatchType::Ternary),
                        field(2, 16, MatchType::Range),
                        field(3, 8, MatchType::Optional),
                    ],
                    &[DROP],
                ),
                table(
                    LPM_TABLE,
                    vec![field(1, 32, MatchType::Lpm)],
                    &[SET_PORT],
                ),
                selector_table,
            ],
            actions: vec![
                ActionInfo {
                    preamble: preamble(SET_PORT, "set_port"),
                    params: vec![ActionParamInfo {
                        id: 1,
                        name: "port".to_string(),
                        bitwidth: 9,
                        ..Default::default()
                    }],
                },
                ActionInfo {
                    preamble: preamble(DROP, "drop"),
                    params: Vec::new(),
                },
            ],
            action_profiles: vec![ActionProfile {
                preamble: preamble(PROFILE, "profile"),
                table_ids: vec![SELECTOR_TABLE],
                with_selector: true,
                size: 64,
                max_group_size: 8,
            }],
            direct_counters: vec![DirectCounter {
                preamble: preamble(DIRECT_COUNTER, "exact_counter"),
                direct_table_id: EXACT_TABLE,
                ..Default::default()
            }],
            meters: vec![Meter {
                preamble: preamble(METER, "meter"),
                size: 8,
                ..Default::default()
            }],
            registers: vec![Register {
                preamble: preamble(REGISTER, "register"),
                bitwidth: 32,
                size: 4,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// A stub SDE with the test pipeline installed.
    pub fn installed_sde() -> Arc<Handle> {
        let sde = stub_sde();
        let config = DeviceConfig {
            programs: vec![Program {
                name: "test".to_string(),
                p4info: p4info(),
                ..Default::default()
            }],
        };
        sde.add_device(0, &config).unwrap();
        sde
    }

    fn setup() -> (Arc<Handle>, TableManager, SessionHandle) {
        let sde = installed_sde();
        let mgr = TableManager::new(
            &test_logger(),
            sde.clone(),
            0,
            Duration::from_secs(1),
        );
        mgr.push_forwarding_pipeline_config(&p4info()).unwrap();
        let session = sde.create_session().unwrap();
        (sde, mgr, session)
    }

    fn set_port(port: u8) -> TableAction {
        TableAction::Action(Action {
            action_id: SET_PORT,
            params: vec![ActionParam {
                param_id: 1,
                value: Bytes::from(vec![0, port]),
            }],
        })
    }

    fn drop_action() -> TableAction {
        TableAction::Action(Action {
            action_id: DROP,
            params: Vec::new(),
        })
    }

    fn exact_entry(value: u8, action: Option<TableAction>) -> TableEntry {
        TableEntry {
            table_id: EXACT_TABLE,
            matches: vec![FieldMatch::exact(1, vec![0, value])],
            action,
            ..Default::default()
        }
    }

    fn read(
        mgr: &TableManager,
        session: &SessionHandle,
        entry: &TableEntry,
    ) -> StratumResult<Vec<Entity>> {
        let out: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        mgr.read_table_entry(session, entry, &out)?;
        Ok(out.into_inner().into_iter().flat_map(|r| r.entities).collect())
    }

    #[test]
    fn test_exact_entry_lifecycle() {
        let (_sde, mgr, session) = setup();
        let entry = exact_entry(5, Some(set_port(7)));
        mgr.write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap();
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        let found = read(&mgr, &session, &exact_entry(5, None)).unwrap();
        assert_eq!(found, vec![Entity::TableEntry(entry.clone())]);

        let modified = exact_entry(5, Some(drop_action()));
        mgr.write_table_entry(&session, UpdateType::Modify, &modified)
            .unwrap();
        let found = read(&mgr, &session, &exact_entry(5, None)).unwrap();
        assert_eq!(found, vec![Entity::TableEntry(modified)]);

        mgr.write_table_entry(&session, UpdateType::Delete, &exact_entry(5, None))
            .unwrap();
        let err = read(&mgr, &session, &exact_entry(5, None)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntryNotFound);
        let err = mgr
            .write_table_entry(&session, UpdateType::Delete, &exact_entry(5, None))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntryNotFound);
    }

    #[test]
    fn test_not_initialized() {
        let sde = installed_sde();
        let mgr = TableManager::new(&test_logger(), sde.clone(), 0, Duration::ZERO);
        let session = sde.create_session().unwrap();
        let err = mgr
            .write_table_entry(
                &session,
                UpdateType::Insert,
                &exact_entry(1, Some(drop_action())),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialized);
    }

    #[test]
    fn test_bad_entries_rejected() {
        let (_sde, mgr, session) = setup();
        let mut entry = exact_entry(1, Some(drop_action()));
        entry.priority = 10;
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let entry = TableEntry {
            table_id: EXACT_TABLE,
            matches: vec![FieldMatch {
                field_id: 1,
                field_match_type: FieldMatchType::Lpm {
                    value: Bytes::from_static(&[1]),
                    prefix_len: 9,
                },
            }],
            action: Some(drop_action()),
            ..Default::default()
        };
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let mut entry = exact_entry(1, Some(drop_action()));
        entry.matches.push(FieldMatch::exact(9, vec![1]));
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let mut entry = exact_entry(1, None);
        entry.table_id = 0x0200_00ff;
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        // Params must fit the declared width.
        let entry = exact_entry(1, Some(set_port(0)));
        let mut wide = entry.clone();
        if let Some(TableAction::Action(a)) = &mut wide.action {
            a.params[0].value = Bytes::from_static(&[0x02, 0x00]);
        }
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &wide)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    fn acl_entry(priority: i32, matches: Vec<FieldMatch>) -> TableEntry {
        TableEntry {
            table_id: ACL_TABLE,
            matches,
            action: Some(drop_action()),
            priority,
            ..Default::default()
        }
    }

    fn ternary(value: &[u8], mask: &[u8]) -> FieldMatch {
        FieldMatch {
            field_id: 1,
            field_match_type: FieldMatchType::Ternary {
                value: Bytes::copy_from_slice(value),
                mask: Bytes::copy_from_slice(mask),
            },
        }
    }

    #[test]
    fn test_priority_and_dont_care() {
        let (_sde, mgr, session) = setup();
        let matches = vec![ternary(&[10, 0, 0, 0], &[255, 0, 0, 0])];

        let err = mgr
            .write_table_entry(
                &session,
                UpdateType::Insert,
                &acl_entry(0, matches.clone()),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let err = mgr
            .write_table_entry(
                &session,
                UpdateType::Insert,
                &acl_entry(5, vec![ternary(&[0, 0, 0, 0], &[0, 0, 0, 0])]),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let full_range = FieldMatch {
            field_id: 2,
            field_match_type: FieldMatchType::Range {
                low: Bytes::from_static(&[0]),
                high: Bytes::from_static(&[0xff, 0xff]),
            },
        };
        let err = mgr
            .write_table_entry(
                &session,
                UpdateType::Insert,
                &acl_entry(5, vec![full_range]),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let entry = acl_entry(
            5,
            vec![
                ternary(&[10, 0, 0, 0], &[255, 0, 0, 0]),
                FieldMatch {
                    field_id: 3,
                    field_match_type: FieldMatchType::Optional {
                        value: Bytes::from_static(&[6]),
                    },
                },
            ],
        );
        mgr.write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap();

        // The range field was left out, so it reads back as left out.
        let all = read(
            &mgr,
            &session,
            &TableEntry {
                table_id: ACL_TABLE,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(all, vec![Entity::TableEntry(entry)]);
    }

    #[test]
    fn test_lpm_entries() {
        let (_sde, mgr, session) = setup();
        let lpm = |prefix_len| TableEntry {
            table_id: LPM_TABLE,
            matches: vec![FieldMatch {
                field_id: 1,
                field_match_type: FieldMatchType::Lpm {
                    value: Bytes::from_static(&[10, 1, 0, 0]),
                    prefix_len,
                },
            }],
            action: Some(set_port(3)),
            ..Default::default()
        };
        for bad in [0, 33] {
            let err = mgr
                .write_table_entry(&session, UpdateType::Insert, &lpm(bad))
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidParam);
        }
        mgr.write_table_entry(&session, UpdateType::Insert, &lpm(16))
            .unwrap();
        let mut query = lpm(16);
        query.action = None;
        assert_eq!(
            read(&mgr, &session, &query).unwrap(),
            vec![Entity::TableEntry(lpm(16))]
        );
    }

    #[test]
    fn test_default_entry() {
        let (_sde, mgr, session) = setup();
        let default = TableEntry {
            table_id: EXACT_TABLE,
            action: Some(set_port(9)),
            is_default_action: true,
            ..Default::default()
        };
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &default)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let mut with_match = default.clone();
        with_match.matches = exact_entry(1, None).matches;
        let err = mgr
            .write_table_entry(&session, UpdateType::Modify, &with_match)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        mgr.write_table_entry(&session, UpdateType::Modify, &default)
            .unwrap();
        let query = TableEntry {
            table_id: EXACT_TABLE,
            is_default_action: true,
            ..Default::default()
        };
        assert_eq!(
            read(&mgr, &session, &query).unwrap(),
            vec![Entity::TableEntry(default)]
        );

        // No action puts the default back the way it was.
        mgr.write_table_entry(&session, UpdateType::Modify, &query)
            .unwrap();
        assert_eq!(
            read(&mgr, &session, &query).unwrap(),
            vec![Entity::TableEntry(query.clone())]
        );
    }

    #[test]
    fn test_read_all_tables() {
        let (_sde, mgr, session) = setup();
        for i in 1..=3 {
            mgr.write_table_entry(
                &session,
                UpdateType::Insert,
                &exact_entry(i, Some(drop_action())),
            )
            .unwrap();
        }
        let lpm = TableEntry {
            table_id: LPM_TABLE,
            matches: vec![FieldMatch {
                field_id: 1,
                field_match_type: FieldMatchType::Lpm {
                    value: Bytes::from_static(&[10, 0, 0, 0]),
                    prefix_len: 8,
                },
            }],
            action: Some(set_port(1)),
            ..Default::default()
        };
        mgr.write_table_entry(&session, UpdateType::Insert, &lpm)
            .unwrap();

        let all = read(&mgr, &session, &TableEntry::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[3], Entity::TableEntry(lpm));

        let filtered = TableEntry {
            table_id: EXACT_TABLE,
            action: Some(drop_action()),
            ..Default::default()
        };
        let err = read(&mgr, &session, &filtered).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);
    }

    #[test]
    fn test_direct_counters() {
        let (_sde, mgr, session) = setup();
        let counter = |data| DirectCounterEntry {
            table_entry: Some(exact_entry(4, None)),
            data,
        };
        let values = CounterData {
            byte_count: 1500,
            packet_count: 1,
        };

        // The entry has to exist first.
        let err = mgr
            .write_direct_counter_entry(
                &session,
                UpdateType::Modify,
                &counter(Some(values)),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntryNotFound);

        mgr.write_table_entry(
            &session,
            UpdateType::Insert,
            &exact_entry(4, Some(set_port(2))),
        )
        .unwrap();
        let err = mgr
            .write_direct_counter_entry(
                &session,
                UpdateType::Insert,
                &counter(Some(values)),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        mgr.write_direct_counter_entry(&session, UpdateType::Modify, &counter(None))
            .unwrap();
        mgr.write_direct_counter_entry(
            &session,
            UpdateType::Modify,
            &counter(Some(values)),
        )
        .unwrap();

        let read_back = mgr
            .read_direct_counter_entry(&session, &counter(None))
            .unwrap();
        assert_eq!(read_back.data, Some(values));

        // Writing the counter left the action alone, and the counter shows
        // up on a table read that asks for it.
        let mut query = exact_entry(4, None);
        query.counter_data = Some(CounterData::default());
        let mut expected = exact_entry(4, Some(set_port(2)));
        expected.counter_data = Some(values);
        assert_eq!(
            read(&mgr, &session, &query).unwrap(),
            vec![Entity::TableEntry(expected)]
        );
    }

    #[test]
    fn test_registers() {
        let (_sde, mgr, session) = setup();
        let entry = |index: Option<i64>, data| RegisterEntry {
            register_id: REGISTER,
            index: index.map(|index| Index { index }),
            data,
        };
        let value = P4Data::Bitstring(Bytes::from_static(&[0x12, 0x34]));

        let err = mgr
            .write_register_entry(
                &session,
                UpdateType::Insert,
                &entry(Some(1), Some(value.clone())),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        let err = mgr
            .write_register_entry(&session, UpdateType::Modify, &entry(Some(1), None))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        let err = mgr
            .write_register_entry(
                &session,
                UpdateType::Modify,
                &entry(Some(1), Some(P4Data::Bool(true))),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);

        mgr.write_register_entry(
            &session,
            UpdateType::Modify,
            &entry(Some(1), Some(value)),
        )
        .unwrap();

        let out: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        mgr.read_register_entry(&session, &entry(Some(1), None), &out)
            .unwrap();
        mgr.read_register_entry(&session, &entry(None, None), &out)
            .unwrap();
        let responses = std::mem::take(&mut *out.lock());
        assert_eq!(
            responses[0].entities,
            vec![Entity::RegisterEntry(entry(
                Some(1),
                Some(P4Data::Bitstring(Bytes::from_static(&[0, 0, 0x12, 0x34])))
            ))]
        );
        assert_eq!(responses[1].entities.len(), 4);

        let err = mgr
            .read_register_entry(&session, &entry(Some(-1), None), &out)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn test_meters() {
        let (_sde, mgr, session) = setup();
        let config = MeterConfig {
            cir: 1000,
            cburst: 100,
            pir: 2000,
            pburst: 200,
        };
        let entry = MeterEntry {
            meter_id: METER,
            index: Some(Index { index: 2 }),
            config: Some(config),
        };
        mgr.write_meter_entry(&session, UpdateType::Modify, &entry)
            .unwrap();

        let out: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        let query = MeterEntry {
            config: None,
            ..entry.clone()
        };
        mgr.read_meter_entry(&session, &query, &out).unwrap();
        assert_eq!(out.lock()[0].entities, vec![Entity::MeterEntry(entry)]);

        let negative = MeterEntry {
            meter_id: METER,
            index: None,
            config: Some(MeterConfig { cir: -1, ..config }),
        };
        let err = mgr
            .write_meter_entry(&session, UpdateType::Modify, &negative)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    fn selector_entry(action: TableAction) -> TableEntry {
        TableEntry {
            table_id: SELECTOR_TABLE,
            matches: vec![FieldMatch::exact(1, vec![0, 1])],
            action: Some(action),
            ..Default::default()
        }
    }

    fn action_set(ports: &[u8]) -> TableAction {
        TableAction::ActionProfileActionSet(ActionProfileActionSet {
            action_profile_actions: ports
                .iter()
                .map(|p| {
                    let TableAction::Action(action) = set_port(*p) else {
                        unreachable!()
                    };
                    ActionProfileAction { action, weight: 1 }
                })
                .collect(),
        })
    }

    #[test]
    fn test_one_shot_action_sets() {
        let (sde, mgr, session) = setup();
        let selector = sde.get_action_selector_bfrt_id(PROFILE).unwrap();
        let entry = selector_entry(action_set(&[1, 2]));
        mgr.write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap();

        let groups = sde
            .get_action_profile_groups(0, &session, selector, 0)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].group_id >= ONE_SHOT_ID_BASE);
        assert_eq!(groups[0].member_ids.len(), 2);

        let mut query = entry.clone();
        query.action = None;
        assert_eq!(
            read(&mgr, &session, &query).unwrap(),
            vec![Entity::TableEntry(entry)]
        );

        // Replacing the set with a plain action retires the hidden objects.
        mgr.write_table_entry(
            &session,
            UpdateType::Modify,
            &selector_entry(set_port(3)),
        )
        .unwrap();
        assert!(sde
            .get_action_profile_groups(0, &session, selector, 0)
            .unwrap()
            .is_empty());
        assert!(sde
            .get_action_profile_members(0, &session, PROFILE, 0)
            .unwrap()
            .is_empty());

        mgr.write_table_entry(
            &session,
            UpdateType::Modify,
            &selector_entry(action_set(&[4])),
        )
        .unwrap();
        mgr.write_table_entry(&session, UpdateType::Delete, &query)
            .unwrap();
        assert!(sde
            .get_action_profile_members(0, &session, PROFILE, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_one_shot_limits() {
        let (sde, mgr, session) = setup();
        let mut weighted = action_set(&[1]);
        if let TableAction::ActionProfileActionSet(set) = &mut weighted {
            set.action_profile_actions[0].weight = 3;
        }
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &selector_entry(weighted))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);

        // Tables without a selector can't take action sets.
        let mut entry = exact_entry(1, Some(action_set(&[1])));
        entry.table_id = EXACT_TABLE;
        let err = mgr
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        // More members than the profile allows in a group: nothing is left
        // behind.
        let err = mgr
            .write_table_entry(
                &session,
                UpdateType::Insert,
                &selector_entry(action_set(&[1, 2, 3, 4, 5, 6, 7, 8, 9])),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        assert!(sde
            .get_action_profile_members(0, &session, PROFILE, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_priority_conversion() {
        assert_eq!(to_sdk_priority(1).unwrap(), SDK_MAX_PRIORITY - 1);
        assert_eq!(to_sdk_priority(0xFF_FFFF).unwrap(), 0);
        assert!(to_sdk_priority(0x100_0000).is_err());
        assert!(to_sdk_priority(-4).is_err());
        assert_eq!(from_sdk_priority(SDK_MAX_PRIORITY - 10).unwrap(), 10);
        assert!(from_sdk_priority(u32::MAX).is_err());
    }
}
