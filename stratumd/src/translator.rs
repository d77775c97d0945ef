// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Translation of P4Runtime values between controller and SDE numbering.
//!
//! A P4 program may declare a type with a `p4runtime_translation`
//! annotation: the controller then sees values of that type in its own
//! numbering, which the switch must convert before they reach the SDE.  The
//! only such type Tofino programs use is `tna/PortId_t`, a 9-bit device port
//! that controllers see as a (usually 32-bit) singleton port id.
//!
//! The translator learns which match fields, action parameters, packet
//! metadata and indexes carry translated types when a pipeline is pushed,
//! and learns the port numbering when a chassis config is pushed.  Each push
//! builds a fresh snapshot which replaces the old one in a single step, so a
//! request in flight always sees a consistent view.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;

use crate::port_map::PortMapper;
use crate::port_map::PortMapping;
use crate::types::sde_call;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::Writer;
use aal::DeviceId;
use aal::SdeInterface;
use common::bytestring::all_ones;
use common::bytestring::bytes_for_bits;
use common::bytestring::canonical;
use common::bytestring::from_uint;
use common::bytestring::padded;
use common::bytestring::to_u32;
use common::chassis::ChassisConfig;
use common::chassis::CPU_PORT_ID;
use common::chassis::UNSPECIFIED_PORT_ID;
use common::p4info::NamedType;
use common::p4info::P4Info;
use common::p4info::P4NewTypeSpec;
use common::p4info::SdnType;
use common::p4info::PACKET_IN_HEADER;
use common::p4info::PACKET_OUT_HEADER;
use common::p4rt::Action;
use common::p4rt::ActionProfileMember;
use common::p4rt::Entity;
use common::p4rt::ExternPayload;
use common::p4rt::FieldMatch;
use common::p4rt::FieldMatchType;
use common::p4rt::Index;
use common::p4rt::P4Data;
use common::p4rt::PacketIn;
use common::p4rt::PacketMetadata;
use common::p4rt::PacketOut;
use common::p4rt::PacketReplicationEngineEntry;
use common::p4rt::ReadResponse;
use common::p4rt::Replica;
use common::p4rt::TableAction;
use common::p4rt::TableEntry;

pub const TNA_PORT_ID_URI: &str = "tna/PortId_t";

/// Width of a device port on Tofino.
pub const TNA_PORT_ID_BIT_WIDTH: u32 = 9;

/// Recirculation ports as seen by the controller: one per pipe, starting
/// here.
pub const SDN_RECIRCULATION_PORT_BASE: u32 = 0xFFFF_FF00;

/// Local port 68 of each pipe is its recirculation port.
const TNA_RECIRCULATION_PORT_BASE: u32 = 0x44;
const TNA_MAX_PIPES: u32 = 4;

/// The SDE width of each URI we know how to translate.
fn uri_bit_width(uri: &str) -> Option<u32> {
    match uri {
        TNA_PORT_ID_URI => Some(TNA_PORT_ID_BIT_WIDTH),
        _ => None,
    }
}

/// A value of a translated type: the URI naming the translation and the
/// width the controller uses for it.
#[derive(Clone, Debug, PartialEq, Eq)]
struct TypedField {
    uri: String,
    bit_width: u32,
}

/// Everything learned from the P4Info about which values need translation.
#[derive(Debug, Default)]
struct Registry {
    version: u64,
    enabled: bool,
    // Keyed by table id, then match field id.
    table_fields: BTreeMap<u32, BTreeMap<u32, TypedField>>,
    // Keyed by action id, then parameter id.
    action_params: BTreeMap<u32, BTreeMap<u32, TypedField>>,
    packet_in_meta: BTreeMap<u32, TypedField>,
    packet_out_meta: BTreeMap<u32, TypedField>,
    counter_index: BTreeMap<u32, String>,
    meter_index: BTreeMap<u32, String>,
    register_index: BTreeMap<u32, String>,
}

impl Registry {
    fn build(p4info: &P4Info, version: u64) -> StratumResult<Registry> {
        let mut registry = Registry {
            version,
            ..Default::default()
        };
        let Some(type_info) = &p4info.type_info else {
            return Ok(registry);
        };

        let mut types: BTreeMap<&str, TypedField> = BTreeMap::new();
        for (name, spec) in &type_info.new_types {
            let P4NewTypeSpec::TranslatedType(t) = spec else {
                continue;
            };
            registry.enabled = true;
            match t.sdn_type {
                SdnType::Bitwidth(bit_width) => {
                    types.insert(
                        name,
                        TypedField {
                            uri: t.uri.clone(),
                            bit_width,
                        },
                    );
                }
                SdnType::String => {
                    return Err(StratumError::Unimplemented(format!(
                        "Unsupported SDN type for {name}: string"
                    )))
                }
            }
        }
        let lookup = |t: &Option<NamedType>| {
            t.as_ref().and_then(|t| types.get(t.name.as_str())).cloned()
        };

        for table in &p4info.tables {
            for field in &table.match_fields {
                let Some(typed) = lookup(&field.type_name) else {
                    continue;
                };
                if uri_bit_width(&typed.uri).is_none() {
                    return Err(StratumError::Internal(format!(
                        "Unknown URI {} on match field {} of table {}",
                        typed.uri, field.id, table.preamble.id
                    )));
                }
                registry
                    .table_fields
                    .entry(table.preamble.id)
                    .or_default()
                    .insert(field.id, typed);
            }
        }
        for action in &p4info.actions {
            for param in &action.params {
                if let Some(typed) = lookup(&param.type_name) {
                    registry
                        .action_params
                        .entry(action.preamble.id)
                        .or_default()
                        .insert(param.id, typed);
                }
            }
        }
        for header in &p4info.controller_packet_metadata {
            let meta = match header.preamble.name.as_str() {
                PACKET_IN_HEADER => &mut registry.packet_in_meta,
                PACKET_OUT_HEADER => &mut registry.packet_out_meta,
                name => {
                    return Err(StratumError::Unimplemented(format!(
                        "Unsupported controller header {name}"
                    )))
                }
            };
            for md in &header.metadata {
                if let Some(typed) = lookup(&md.type_name) {
                    meta.insert(md.id, typed);
                }
            }
        }
        for counter in &p4info.counters {
            if let Some(typed) = lookup(&counter.index_type_name) {
                registry.counter_index.insert(counter.preamble.id, typed.uri);
            }
        }
        for meter in &p4info.meters {
            if let Some(typed) = lookup(&meter.index_type_name) {
                registry.meter_index.insert(meter.preamble.id, typed.uri);
            }
        }
        for register in &p4info.registers {
            if let Some(typed) = lookup(&register.index_type_name) {
                registry
                    .register_index
                    .insert(register.preamble.id, typed.uri);
            }
        }
        Ok(registry)
    }
}

/// One consistent view of the translation state.
#[derive(Clone, Debug, Default)]
struct Snapshot {
    ports: Arc<PortMapping>,
    registry: Arc<Registry>,
    legacy_bytestring: bool,
}

impl Snapshot {
    fn tna_port_id(
        &self,
        value: &[u8],
        to_sdk: bool,
        bit_width: u32,
    ) -> StratumResult<Bytes> {
        if to_sdk {
            let port_id = to_u32(value)?;
            let sdk_port = self.ports.to_sdk_port(port_id).map_err(|_| {
                StratumError::InvalidParam(format!(
                    "port {port_id} has no SDK port mapping"
                ))
            })?;
            return Ok(from_uint(u64::from(sdk_port), bit_width)?);
        }

        if value.len() != bytes_for_bits(TNA_PORT_ID_BIT_WIDTH) {
            return Err(StratumError::InvalidParam(format!(
                "SDK port value {value:02x?} is not {} bytes wide",
                bytes_for_bits(TNA_PORT_ID_BIT_WIDTH)
            )));
        }
        let sdk_port = to_u32(value)?;
        let port_id = self.ports.to_singleton_port(sdk_port).map_err(|_| {
            StratumError::InvalidParam(format!(
                "SDK port {sdk_port} has no singleton port mapping"
            ))
        })?;
        let value = from_uint(u64::from(port_id), bit_width)?;
        Ok(match self.legacy_bytestring {
            true => value,
            false => canonical(&value),
        })
    }

    fn value(
        &self,
        uri: &str,
        value: &[u8],
        to_sdk: bool,
        bit_width: u32,
    ) -> StratumResult<Bytes> {
        match uri {
            TNA_PORT_ID_URI => self.tna_port_id(value, to_sdk, bit_width),
            _ => Err(StratumError::Unimplemented(format!("Unknown URI: {uri}"))),
        }
    }

    fn index(
        &self,
        uri: &str,
        index: &Index,
        to_sdk: bool,
    ) -> StratumResult<Index> {
        if uri != TNA_PORT_ID_URI {
            return Err(StratumError::Unimplemented(format!(
                "Unsupported URI: {uri}"
            )));
        }
        let value = u32::try_from(index.index).map_err(|_| {
            StratumError::InvalidParam(format!("Invalid index {}", index.index))
        })?;
        let translated = match to_sdk {
            true => self.ports.to_sdk_port(value),
            false => self.ports.to_singleton_port(value),
        }
        .map_err(|e| StratumError::InvalidParam(e.to_string()))?;
        Ok(Index {
            index: i64::from(translated),
        })
    }

    fn replica(&self, replica: &Replica, to_sdk: bool) -> StratumResult<Replica> {
        let egress_port = match to_sdk {
            true => self.ports.to_sdk_port(replica.egress_port),
            false => self.ports.to_singleton_port(replica.egress_port),
        }
        .map_err(|e| StratumError::InvalidParam(e.to_string()))?;
        Ok(Replica {
            egress_port,
            ..*replica
        })
    }

    fn field_match(
        &self,
        table_id: u32,
        fm: &mut FieldMatch,
        to_sdk: bool,
    ) -> StratumResult<()> {
        let Some(field) = self
            .registry
            .table_fields
            .get(&table_id)
            .and_then(|f| f.get(&fm.field_id))
        else {
            return Ok(());
        };
        let Some(sdk_width) = uri_bit_width(&field.uri) else {
            return Ok(());
        };
        let (from_width, to_width) = match to_sdk {
            true => (field.bit_width, sdk_width),
            false => (sdk_width, field.bit_width),
        };
        let uri = field.uri.as_str();
        match &mut fm.field_match_type {
            FieldMatchType::Exact { value }
            | FieldMatchType::Optional { value } => {
                *value = self.value(uri, value, to_sdk, to_width)?;
            }
            FieldMatchType::Ternary { value, mask } => {
                // Ports can only be matched exactly.
                let saturated = padded(mask, from_width)
                    .is_ok_and(|m| m == all_ones(from_width));
                if !saturated {
                    return Err(StratumError::InvalidParam(format!(
                        "Ternary match on field {} of table {table_id} must \
                         use an all-ones mask",
                        fm.field_id
                    )));
                }
                *value = self.value(uri, value, to_sdk, to_width)?;
                *mask = all_ones(to_width);
            }
            FieldMatchType::Lpm { value, prefix_len } => {
                if *prefix_len != from_width {
                    return Err(StratumError::InvalidParam(format!(
                        "LPM match on field {} of table {table_id} must use a \
                         prefix length of {from_width}",
                        fm.field_id
                    )));
                }
                *value = self.value(uri, value, to_sdk, to_width)?;
                *prefix_len = to_width;
            }
            FieldMatchType::Range { low, high } => {
                if low != high {
                    return Err(StratumError::InvalidParam(format!(
                        "Range match on field {} of table {table_id} must \
                         have equal bounds",
                        fm.field_id
                    )));
                }
                *low = self.value(uri, low, to_sdk, to_width)?;
                *high = low.clone();
            }
        }
        Ok(())
    }

    fn action(&self, action: &mut Action, to_sdk: bool) -> StratumResult<()> {
        let Some(params) = self.registry.action_params.get(&action.action_id)
        else {
            return Ok(());
        };
        for param in action.params.iter_mut() {
            let Some(typed) = params.get(&param.param_id) else {
                continue;
            };
            let to_width = match to_sdk {
                true => uri_bit_width(&typed.uri),
                false => Some(typed.bit_width),
            };
            if let Some(width) = to_width {
                param.value =
                    self.value(&typed.uri, &param.value, to_sdk, width)?;
            }
        }
        Ok(())
    }

    fn table_entry(
        &self,
        entry: &TableEntry,
        to_sdk: bool,
    ) -> StratumResult<TableEntry> {
        let mut entry = entry.clone();
        for fm in entry.matches.iter_mut() {
            self.field_match(entry.table_id, fm, to_sdk)?;
        }
        match &mut entry.action {
            Some(TableAction::Action(action)) => self.action(action, to_sdk)?,
            Some(TableAction::ActionProfileActionSet(set)) => {
                for member in set.action_profile_actions.iter_mut() {
                    self.action(&mut member.action, to_sdk)?;
                }
            }
            Some(TableAction::ActionProfileMemberId(_))
            | Some(TableAction::ActionProfileGroupId(_))
            | None => {}
        }
        Ok(entry)
    }

    fn member(
        &self,
        member: &ActionProfileMember,
        to_sdk: bool,
    ) -> StratumResult<ActionProfileMember> {
        let mut member = member.clone();
        if let Some(action) = &mut member.action {
            self.action(action, to_sdk)?;
        }
        Ok(member)
    }

    fn indexed(
        &self,
        uris: &BTreeMap<u32, String>,
        id: u32,
        index: &Option<Index>,
        to_sdk: bool,
    ) -> StratumResult<Option<Index>> {
        match (uris.get(&id), index) {
            (Some(uri), Some(index)) => {
                Ok(Some(self.index(uri, index, to_sdk)?))
            }
            _ => Ok(*index),
        }
    }

    fn entity(&self, entity: &Entity, to_sdk: bool) -> StratumResult<Entity> {
        if !self.registry.enabled {
            return Ok(entity.clone());
        }
        let translated = match entity {
            Entity::TableEntry(e) => {
                Entity::TableEntry(self.table_entry(e, to_sdk)?)
            }
            Entity::ActionProfileMember(m) => {
                Entity::ActionProfileMember(self.member(m, to_sdk)?)
            }
            Entity::ExternEntry(e) => {
                let mut e = e.clone();
                if let Some(ExternPayload::ActionProfileMember(m)) = &e.entry {
                    e.entry = Some(ExternPayload::ActionProfileMember(
                        self.member(m, to_sdk)?,
                    ));
                }
                Entity::ExternEntry(e)
            }
            Entity::MeterEntry(e) => {
                let mut e = e.clone();
                e.index = self.indexed(
                    &self.registry.meter_index,
                    e.meter_id,
                    &e.index,
                    to_sdk,
                )?;
                Entity::MeterEntry(e)
            }
            Entity::CounterEntry(e) => {
                let mut e = e.clone();
                e.index = self.indexed(
                    &self.registry.counter_index,
                    e.counter_id,
                    &e.index,
                    to_sdk,
                )?;
                Entity::CounterEntry(e)
            }
            Entity::RegisterEntry(e) => {
                let mut e = e.clone();
                e.index = self.indexed(
                    &self.registry.register_index,
                    e.register_id,
                    &e.index,
                    to_sdk,
                )?;
                Entity::RegisterEntry(e)
            }
            Entity::DirectMeterEntry(e) => {
                let mut e = e.clone();
                if let Some(t) = &e.table_entry {
                    e.table_entry = Some(self.table_entry(t, to_sdk)?);
                }
                Entity::DirectMeterEntry(e)
            }
            Entity::DirectCounterEntry(e) => {
                let mut e = e.clone();
                if let Some(t) = &e.table_entry {
                    e.table_entry = Some(self.table_entry(t, to_sdk)?);
                }
                Entity::DirectCounterEntry(e)
            }
            Entity::PacketReplicationEngineEntry(pre) => {
                let mut pre = pre.clone();
                let replicas = match &mut pre {
                    PacketReplicationEngineEntry::MulticastGroupEntry(m) => {
                        &mut m.replicas
                    }
                    PacketReplicationEngineEntry::CloneSessionEntry(c) => {
                        &mut c.replicas
                    }
                };
                for replica in replicas.iter_mut() {
                    *replica = self.replica(replica, to_sdk)?;
                }
                Entity::PacketReplicationEngineEntry(pre)
            }
            Entity::ActionProfileGroup(_)
            | Entity::ValueSetEntry(_)
            | Entity::DigestEntry(_) => entity.clone(),
        };
        Ok(translated)
    }

    fn metadata(
        &self,
        metadata: &mut [PacketMetadata],
        types: &BTreeMap<u32, TypedField>,
        to_sdk: bool,
    ) -> StratumResult<()> {
        for md in metadata.iter_mut() {
            let Some(typed) = types.get(&md.metadata_id) else {
                continue;
            };
            let width = match to_sdk {
                true => uri_bit_width(&typed.uri),
                false => Some(typed.bit_width),
            };
            if let Some(width) = width {
                md.value = self.value(&typed.uri, &md.value, to_sdk, width)?;
            }
        }
        Ok(())
    }
}

pub struct Translator {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    translation_enabled: bool,
    state: RwLock<Snapshot>,
}

impl Translator {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        device: DeviceId,
        translation_enabled: bool,
        legacy_bytestring: bool,
    ) -> Self {
        Translator {
            log: log.new(o!("unit" => "translator", "device" => device)),
            sde,
            device,
            translation_enabled,
            state: RwLock::new(Snapshot {
                legacy_bytestring,
                ..Default::default()
            }),
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.state.read().clone()
    }

    /// Rebuild the port numbering from the singleton ports of `node_id`,
    /// plus the ports every Tofino has: the CPU port and one recirculation
    /// port per pipe.
    pub fn push_chassis_config(
        &self,
        config: &ChassisConfig,
        node_id: u64,
    ) -> StratumResult<()> {
        let mut ports = PortMapping::new();
        ports.insert_one_way(UNSPECIFIED_PORT_ID, 0)?;
        let cpu_port = sde_call!(self.sde.get_pcie_cpu_port(self.device))?;
        ports.insert(CPU_PORT_ID, cpu_port)?;
        for pipe in 0..TNA_MAX_PIPES {
            ports.insert(
                SDN_RECIRCULATION_PORT_BASE + pipe,
                TNA_RECIRCULATION_PORT_BASE | (pipe << 7),
            )?;
        }
        for port in config.singleton_ports.iter().filter(|p| p.node == node_id)
        {
            let sdk_port = PortMapper::register_port(
                self.sde.as_ref(),
                self.device,
                &port.port_key(),
            )?;
            ports.insert(port.id, sdk_port)?;
        }

        debug!(self.log, "port translation updated"; "ports" => ports.len());
        self.state.write().ports = Arc::new(ports);
        Ok(())
    }

    /// Learn which values of the pipeline need translation.
    pub fn push_forwarding_pipeline_config(
        &self,
        p4info: &P4Info,
    ) -> StratumResult<()> {
        let mut state = self.state.write();
        let version = state.registry.version + 1;
        let registry = match self.translation_enabled {
            true => Registry::build(p4info, version)?,
            false => Registry {
                version,
                ..Default::default()
            },
        };
        info!(self.log, "translation registry updated";
            "version" => registry.version,
            "enabled" => registry.enabled);
        state.registry = Arc::new(registry);
        Ok(())
    }

    pub fn translation_required(&self) -> bool {
        self.state.read().registry.enabled
    }

    /// Rewrite a P4Info into the form the SDE expects: translated fields
    /// take their SDE width and no type names remain.
    pub fn translate_p4info(&self, p4info: &P4Info) -> StratumResult<P4Info> {
        let Some(type_info) = &p4info.type_info else {
            return Ok(p4info.clone());
        };
        if !self.translation_enabled {
            return Ok(p4info.clone());
        }
        let uris: BTreeMap<&str, &str> = type_info
            .new_types
            .iter()
            .filter_map(|(name, spec)| match spec {
                P4NewTypeSpec::TranslatedType(t) => {
                    Some((name.as_str(), t.uri.as_str()))
                }
                P4NewTypeSpec::OriginalType { .. } => None,
            })
            .collect();
        let sdk_width = |type_name: &mut Option<NamedType>,
                         bit_width: &mut u32|
         -> StratumResult<()> {
            let Some(name) = type_name.take() else {
                return Ok(());
            };
            if let Some(uri) = uris.get(name.name.as_str()) {
                *bit_width = uri_bit_width(uri).ok_or_else(|| {
                    StratumError::Internal(format!("Unknown URI: {uri}"))
                })?;
            }
            Ok(())
        };

        let mut translated = p4info.clone();
        for table in translated.tables.iter_mut() {
            for field in table.match_fields.iter_mut() {
                sdk_width(&mut field.type_name, &mut field.bitwidth)?;
            }
        }
        for action in translated.actions.iter_mut() {
            for param in action.params.iter_mut() {
                sdk_width(&mut param.type_name, &mut param.bitwidth)?;
            }
        }
        for header in translated.controller_packet_metadata.iter_mut() {
            for md in header.metadata.iter_mut() {
                sdk_width(&mut md.type_name, &mut md.bitwidth)?;
            }
        }
        translated
            .counters
            .iter_mut()
            .for_each(|c| c.index_type_name = None);
        translated
            .meters
            .iter_mut()
            .for_each(|m| m.index_type_name = None);
        translated
            .registers
            .iter_mut()
            .for_each(|r| r.index_type_name = None);
        translated.type_info = None;
        Ok(translated)
    }

    /// Translate an entity to (`to_sdk`) or from SDE numbering.
    pub fn translate_entity(
        &self,
        entity: &Entity,
        to_sdk: bool,
    ) -> StratumResult<Entity> {
        self.snapshot().entity(entity, to_sdk)
    }

    pub fn translate_table_entry(
        &self,
        entry: &TableEntry,
        to_sdk: bool,
    ) -> StratumResult<TableEntry> {
        let snapshot = self.snapshot();
        match snapshot.registry.enabled {
            true => snapshot.table_entry(entry, to_sdk),
            false => Ok(entry.clone()),
        }
    }

    /// Convert a single `tna/PortId_t` value.  Going to the SDE, `value` is
    /// a singleton port id and the result is `bit_width` bits wide; coming
    /// back, `value` is a 9-bit device port and the result is `bit_width`
    /// bits wide.
    pub fn translate_tna_port_id(
        &self,
        value: &[u8],
        to_sdk: bool,
        bit_width: u32,
    ) -> StratumResult<Bytes> {
        self.snapshot().tna_port_id(value, to_sdk, bit_width)
    }

    pub fn translate_packet_in(&self, packet: &PacketIn) -> StratumResult<PacketIn> {
        let snapshot = self.snapshot();
        let mut packet = packet.clone();
        if snapshot.registry.enabled {
            snapshot.metadata(
                &mut packet.metadata,
                &snapshot.registry.packet_in_meta,
                false,
            )?;
        }
        Ok(packet)
    }

    pub fn translate_packet_out(
        &self,
        packet: &PacketOut,
    ) -> StratumResult<PacketOut> {
        let snapshot = self.snapshot();
        let mut packet = packet.clone();
        if snapshot.registry.enabled {
            snapshot.metadata(
                &mut packet.metadata,
                &snapshot.registry.packet_out_meta,
                true,
            )?;
        }
        Ok(packet)
    }

    /// Strip the leading zero bytes the SDE leaves on values read back from
    /// it, unless the client asked for padded values.
    pub fn canonicalize_entity(&self, entity: Entity) -> Entity {
        match self.state.read().legacy_bytestring {
            true => entity,
            false => canonical_entity(entity),
        }
    }
}

fn canonical_action(action: &mut Action) {
    for param in action.params.iter_mut() {
        param.value = canonical(&param.value);
    }
}

fn canonical_table_entry(entry: &mut TableEntry) {
    for fm in entry.matches.iter_mut() {
        match &mut fm.field_match_type {
            FieldMatchType::Exact { value }
            | FieldMatchType::Optional { value } => {
                *value = canonical(value);
            }
            FieldMatchType::Ternary { value, mask } => {
                *value = canonical(value);
                *mask = canonical(mask);
            }
            FieldMatchType::Lpm { value, .. } => *value = canonical(value),
            FieldMatchType::Range { low, high } => {
                *low = canonical(low);
                *high = canonical(high);
            }
        }
    }
    match &mut entry.action {
        Some(TableAction::Action(action)) => canonical_action(action),
        Some(TableAction::ActionProfileActionSet(set)) => set
            .action_profile_actions
            .iter_mut()
            .for_each(|a| canonical_action(&mut a.action)),
        _ => {}
    }
}

fn canonical_data(data: &mut P4Data) {
    match data {
        P4Data::Bitstring(b) => *b = canonical(b),
        P4Data::Tuple(members) => members.iter_mut().for_each(canonical_data),
        P4Data::Bool(_) => {}
    }
}

fn canonical_entity(mut entity: Entity) -> Entity {
    match &mut entity {
        Entity::TableEntry(e) => canonical_table_entry(e),
        Entity::ActionProfileMember(m) => {
            if let Some(a) = &mut m.action {
                canonical_action(a);
            }
        }
        Entity::ExternEntry(e) => {
            if let Some(ExternPayload::ActionProfileMember(m)) = &mut e.entry {
                if let Some(a) = &mut m.action {
                    canonical_action(a);
                }
            }
        }
        Entity::DirectCounterEntry(e) => {
            if let Some(t) = &mut e.table_entry {
                canonical_table_entry(t);
            }
        }
        Entity::DirectMeterEntry(e) => {
            if let Some(t) = &mut e.table_entry {
                canonical_table_entry(t);
            }
        }
        Entity::RegisterEntry(e) => {
            if let Some(d) = &mut e.data {
                canonical_data(d);
            }
        }
        Entity::ActionProfileGroup(_)
        | Entity::MeterEntry(_)
        | Entity::CounterEntry(_)
        | Entity::PacketReplicationEngineEntry(_)
        | Entity::ValueSetEntry(_)
        | Entity::DigestEntry(_) => {}
    }
    entity
}

/// Wraps the writer a read response is headed for, converting every entity
/// back into controller numbering on the way through.
pub struct TranslatingWriter<'a> {
    translator: &'a Translator,
    inner: &'a dyn Writer<ReadResponse>,
}

impl<'a> TranslatingWriter<'a> {
    pub fn new(
        translator: &'a Translator,
        inner: &'a dyn Writer<ReadResponse>,
    ) -> Self {
        TranslatingWriter { translator, inner }
    }
}

impl Writer<ReadResponse> for TranslatingWriter<'_> {
    fn write(&self, msg: ReadResponse) -> bool {
        let mut entities = Vec::with_capacity(msg.entities.len());
        for entity in msg.entities {
            match self.translator.translate_entity(&entity, false) {
                Ok(e) => entities.push(self.translator.canonicalize_entity(e)),
                Err(e) => {
                    error!(self.translator.log, "failed to translate entity";
                        "kind" => entity.kind(),
                        "error" => %e);
                    return false;
                }
            }
        }
        self.inner.write(ReadResponse { entities })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::test_utils::stub_sde;
    use crate::test_utils::test_logger;
    use crate::types::ErrorCode;
    use common::chassis::Node;
    use common::chassis::SingletonPort;
    use common::p4info::ActionParam as ActionParamInfo;
    use common::p4info::ControllerPacketMetadata;
    use common::p4info::Counter;
    use common::p4info::MatchField;
    use common::p4info::P4NewTypeTranslation;
    use common::p4info::P4TypeInfo;
    use common::p4info::PacketMetadataSpec;
    use common::p4info::Preamble;
    use common::p4info::Table;
    use common::p4rt::ActionParam;
    use common::p4rt::CounterEntry;
    use common::p4rt::MulticastGroupEntry;
    use pretty_assertions::assert_eq;

    const NODE_ID: u64 = 1;
    const TABLE_ID: u32 = 0x0200_0001;
    const ACTION_ID: u32 = 0x0100_0001;
    const COUNTER_ID: u32 = 0x1200_0001;
    const PORT_FIELD: u32 = 1;
    const PORT_PARAM: u32 = 1;

    // (singleton id, front panel port); the stub puts port N of pipe 0 at
    // device port 4 * (N - 1), and port 17 at 128.
    const PORTS: [(u32, i32, u32); 3] = [(1, 2, 4), (2, 3, 8), (300, 17, 128)];

    fn chassis_config() -> ChassisConfig {
        let mut ports: Vec<SingletonPort> = PORTS
            .iter()
            .map(|(id, port, _)| SingletonPort {
                id: *id,
                node: NODE_ID,
                slot: 1,
                port: *port,
                speed_bps: 100_000_000_000,
                ..Default::default()
            })
            .collect();
        // Ports of other nodes are not ours to translate.
        ports.push(SingletonPort {
            id: 77,
            node: NODE_ID + 1,
            slot: 1,
            port: 5,
            speed_bps: 100_000_000_000,
            ..Default::default()
        });
        ChassisConfig {
            nodes: vec![Node {
                id: NODE_ID,
                slot: 1,
                ..Default::default()
            }],
            singleton_ports: ports,
            ..Default::default()
        }
    }

    fn port_type() -> Option<NamedType> {
        Some(NamedType {
            name: "PortId_t".to_string(),
        })
    }

    fn p4info() -> P4Info {
        let mut new_types = BTreeMap::new();
        new_types.insert(
            "PortId_t".to_string(),
            P4NewTypeSpec::TranslatedType(P4NewTypeTranslation {
                uri: TNA_PORT_ID_URI.to_string(),
                sdn_type: SdnType::Bitwidth(32),
            }),
        );
        P4Info {
            tables: vec![Table {
                preamble: Preamble {
                    id: TABLE_ID,
                    ..Default::default()
                },
                match_fields: vec![
                    MatchField {
                        id: PORT_FIELD,
                        bitwidth: 32,
                        type_name: port_type(),
                        ..Default::default()
                    },
                    MatchField {
                        id: 2,
                        bitwidth: 16,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            actions: vec![common::p4info::Action {
                preamble: Preamble {
                    id: ACTION_ID,
                    ..Default::default()
                },
                params: vec![ActionParamInfo {
                    id: PORT_PARAM,
                    bitwidth: 32,
                    type_name: port_type(),
                    ..Default::default()
                }],
            }],
            counters: vec![Counter {
                preamble: Preamble {
                    id: COUNTER_ID,
                    ..Default::default()
                },
                size: 512,
                index_type_name: port_type(),
                ..Default::default()
            }],
            controller_packet_metadata: vec![
                ControllerPacketMetadata {
                    preamble: Preamble {
                        name: PACKET_IN_HEADER.to_string(),
                        ..Default::default()
                    },
                    metadata: vec![PacketMetadataSpec {
                        id: 1,
                        bitwidth: 32,
                        type_name: port_type(),
                        ..Default::default()
                    }],
                },
                ControllerPacketMetadata {
                    preamble: Preamble {
                        name: PACKET_OUT_HEADER.to_string(),
                        ..Default::default()
                    },
                    metadata: vec![PacketMetadataSpec {
                        id: 1,
                        bitwidth: 32,
                        type_name: port_type(),
                        ..Default::default()
                    }],
                },
            ],
            type_info: Some(P4TypeInfo { new_types }),
            ..Default::default()
        }
    }

    fn translator(legacy: bool) -> Translator {
        let t = Translator::new(&test_logger(), stub_sde(), 0, true, legacy);
        t.push_chassis_config(&chassis_config(), NODE_ID).unwrap();
        t.push_forwarding_pipeline_config(&p4info()).unwrap();
        t
    }

    fn u32_bytes(v: u32) -> Bytes {
        Bytes::copy_from_slice(&v.to_be_bytes())
    }

    #[test]
    fn test_port_id_round_trip() {
        let t = translator(false);
        for bit_width in [9, 32] {
            for (id, _, _) in PORTS {
                if bit_width == 9 && id >= 512 {
                    continue;
                }
                let value = canonical(&from_uint(u64::from(id), bit_width).unwrap());
                let sdk = t.translate_tna_port_id(&value, true, 9).unwrap();
                assert_eq!(sdk.len(), 2);
                let back =
                    t.translate_tna_port_id(&sdk, false, bit_width).unwrap();
                assert_eq!(back, value);
            }
        }
        // The recirculation port of pipe 1.
        let sdk = t
            .translate_tna_port_id(&u32_bytes(SDN_RECIRCULATION_PORT_BASE + 1), true, 9)
            .unwrap();
        assert_eq!(sdk, Bytes::from_static(&[0, 0xc4]));
        // The CPU port.
        let sdk = t.translate_tna_port_id(&u32_bytes(CPU_PORT_ID), true, 9).unwrap();
        assert_eq!(sdk, Bytes::from_static(&[0x01, 0x40]));
        assert_eq!(
            t.translate_tna_port_id(&sdk, false, 32).unwrap(),
            u32_bytes(CPU_PORT_ID)
        );
    }

    #[test]
    fn test_port_id_errors() {
        let t = translator(false);
        // Not mapped, including ports that belong to another node.
        for id in [9, 77] {
            assert_eq!(
                t.translate_tna_port_id(&u32_bytes(id), true, 9)
                    .unwrap_err()
                    .code(),
                ErrorCode::InvalidParam
            );
        }
        // SDE values must be exactly two bytes.
        assert_eq!(
            t.translate_tna_port_id(&[4], false, 32).unwrap_err().code(),
            ErrorCode::InvalidParam
        );
        assert_eq!(
            t.translate_tna_port_id(&[0, 99], false, 32).unwrap_err().code(),
            ErrorCode::InvalidParam
        );
    }

    #[test]
    fn test_legacy_bytestrings() {
        let t = translator(true);
        assert_eq!(
            t.translate_tna_port_id(&[0, 4], false, 32).unwrap(),
            u32_bytes(1)
        );
    }

    fn port_match(field_match_type: FieldMatchType) -> TableEntry {
        TableEntry {
            table_id: TABLE_ID,
            matches: vec![
                FieldMatch {
                    field_id: PORT_FIELD,
                    field_match_type,
                },
                FieldMatch::exact(2, Bytes::from_static(&[0, 7])),
            ],
            action: Some(TableAction::Action(Action {
                action_id: ACTION_ID,
                params: vec![ActionParam {
                    param_id: PORT_PARAM,
                    value: u32_bytes(2),
                }],
            })),
            priority: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_table_entry_translation() {
        let t = translator(false);
        let entry = port_match(FieldMatchType::Ternary {
            value: u32_bytes(300),
            mask: all_ones(32),
        });
        let sdk = t.translate_table_entry(&entry, true).unwrap();
        assert_eq!(
            sdk.matches[0].field_match_type,
            FieldMatchType::Ternary {
                value: Bytes::from_static(&[0, 128]),
                mask: all_ones(9),
            }
        );
        // Untranslated fields are untouched.
        assert_eq!(sdk.matches[1], entry.matches[1]);
        assert_eq!(
            sdk.action,
            Some(TableAction::Action(Action {
                action_id: ACTION_ID,
                params: vec![ActionParam {
                    param_id: PORT_PARAM,
                    value: Bytes::from_static(&[0, 8]),
                }],
            }))
        );

        let back = t.translate_table_entry(&sdk, false).unwrap();
        assert_eq!(
            back.matches[0].field_match_type,
            FieldMatchType::Ternary {
                value: Bytes::from_static(&[0x01, 0x2c]),
                mask: all_ones(32),
            }
        );

        let lpm = port_match(FieldMatchType::Lpm {
            value: u32_bytes(1),
            prefix_len: 32,
        });
        assert_eq!(
            t.translate_table_entry(&lpm, true).unwrap().matches[0]
                .field_match_type,
            FieldMatchType::Lpm {
                value: Bytes::from_static(&[0, 4]),
                prefix_len: 9,
            }
        );
        let range = port_match(FieldMatchType::Range {
            low: u32_bytes(1),
            high: u32_bytes(1),
        });
        assert!(t.translate_table_entry(&range, true).is_ok());
        let optional = port_match(FieldMatchType::Optional {
            value: u32_bytes(2),
        });
        assert!(t.translate_table_entry(&optional, true).is_ok());
    }

    #[test]
    fn test_partial_port_matches_rejected() {
        let t = translator(false);
        let entries = [
            port_match(FieldMatchType::Ternary {
                value: u32_bytes(1),
                mask: u32_bytes(0xffff),
            }),
            port_match(FieldMatchType::Lpm {
                value: u32_bytes(1),
                prefix_len: 16,
            }),
            port_match(FieldMatchType::Range {
                low: u32_bytes(1),
                high: u32_bytes(2),
            }),
        ];
        for entry in &entries {
            assert_eq!(
                t.translate_table_entry(entry, true).unwrap_err().code(),
                ErrorCode::InvalidParam
            );
        }
    }

    #[test]
    fn test_index_and_replica_translation() {
        let t = translator(false);
        let entity = Entity::CounterEntry(CounterEntry {
            counter_id: COUNTER_ID,
            index: Some(Index { index: 300 }),
            data: None,
        });
        let Entity::CounterEntry(sdk) = t.translate_entity(&entity, true).unwrap()
        else {
            panic!("wrong entity kind");
        };
        assert_eq!(sdk.index, Some(Index { index: 128 }));

        let entity = Entity::PacketReplicationEngineEntry(
            PacketReplicationEngineEntry::MulticastGroupEntry(
                MulticastGroupEntry {
                    multicast_group_id: 1,
                    replicas: vec![
                        Replica {
                            egress_port: 1,
                            instance: 0,
                        },
                        Replica {
                            egress_port: 2,
                            instance: 1,
                        },
                    ],
                },
            ),
        );
        let sdk = t.translate_entity(&entity, true).unwrap();
        let Entity::PacketReplicationEngineEntry(
            PacketReplicationEngineEntry::MulticastGroupEntry(group),
        ) = &sdk
        else {
            panic!("wrong entity kind");
        };
        assert_eq!(
            group.replicas.iter().map(|r| r.egress_port).collect::<Vec<_>>(),
            vec![4, 8]
        );
        assert_eq!(t.translate_entity(&sdk, false).unwrap(), entity);
    }

    #[test]
    fn test_packet_metadata() {
        let t = translator(false);
        let out = PacketOut {
            payload: Bytes::from_static(b"payload"),
            metadata: vec![PacketMetadata {
                metadata_id: 1,
                value: u32_bytes(2),
            }],
        };
        let sdk = t.translate_packet_out(&out).unwrap();
        assert_eq!(sdk.metadata[0].value, Bytes::from_static(&[0, 8]));

        let packet_in = PacketIn {
            payload: Bytes::from_static(b"payload"),
            metadata: vec![PacketMetadata {
                metadata_id: 1,
                value: Bytes::from_static(&[0, 128]),
            }],
        };
        let sdn = t.translate_packet_in(&packet_in).unwrap();
        assert_eq!(sdn.metadata[0].value, Bytes::from_static(&[0x01, 0x2c]));
    }

    #[test]
    fn test_translate_p4info() {
        let t = translator(false);
        let translated = t.translate_p4info(&p4info()).unwrap();
        let field = &translated.tables[0].match_fields[0];
        assert_eq!((field.bitwidth, field.type_name.is_none()), (9, true));
        assert_eq!(translated.tables[0].match_fields[1].bitwidth, 16);
        assert_eq!(translated.actions[0].params[0].bitwidth, 9);
        assert_eq!(
            translated.controller_packet_metadata[1].metadata[0].bitwidth,
            9
        );
        assert!(translated.counters[0].index_type_name.is_none());
        assert!(translated.type_info.is_none());

        // Without type info, nothing changes.
        let plain = P4Info {
            type_info: None,
            ..p4info()
        };
        assert_eq!(t.translate_p4info(&plain).unwrap(), plain);
    }

    #[test]
    fn test_pipeline_push_errors() {
        let t = Translator::new(&test_logger(), stub_sde(), 0, true, false);

        let mut info = p4info();
        if let Some(ti) = &mut info.type_info {
            ti.new_types.insert(
                "Name_t".to_string(),
                P4NewTypeSpec::TranslatedType(P4NewTypeTranslation {
                    uri: "example/Name_t".to_string(),
                    sdn_type: SdnType::String,
                }),
            );
        }
        assert_eq!(
            t.push_forwarding_pipeline_config(&info).unwrap_err().code(),
            ErrorCode::Unimplemented
        );

        let mut info = p4info();
        if let Some(ti) = &mut info.type_info {
            ti.new_types.insert(
                "PortId_t".to_string(),
                P4NewTypeSpec::TranslatedType(P4NewTypeTranslation {
                    uri: "example/Unknown_t".to_string(),
                    sdn_type: SdnType::Bitwidth(32),
                }),
            );
        }
        assert_eq!(
            t.push_forwarding_pipeline_config(&info).unwrap_err().code(),
            ErrorCode::Internal
        );

        let mut info = p4info();
        info.controller_packet_metadata[0].preamble.name = "digest".to_string();
        assert_eq!(
            t.push_forwarding_pipeline_config(&info).unwrap_err().code(),
            ErrorCode::Unimplemented
        );
        assert!(!t.translation_required());
    }

    #[test]
    fn test_translation_disabled() {
        let t = Translator::new(&test_logger(), stub_sde(), 0, false, false);
        t.push_chassis_config(&chassis_config(), NODE_ID).unwrap();
        t.push_forwarding_pipeline_config(&p4info()).unwrap();
        assert!(!t.translation_required());
        let entry = port_match(FieldMatchType::Exact {
            value: u32_bytes(1),
        });
        assert_eq!(t.translate_table_entry(&entry, true).unwrap(), entry);
        assert_eq!(t.translate_p4info(&p4info()).unwrap(), p4info());
    }

    #[test]
    fn test_translating_writer() {
        let t = translator(false);
        let sink = Mutex::new(Vec::new());
        let writer = TranslatingWriter::new(&t, &sink);
        let sdk = TableEntry {
            table_id: TABLE_ID,
            matches: vec![
                FieldMatch::exact(PORT_FIELD, Bytes::from_static(&[0, 4])),
                FieldMatch::exact(2, Bytes::from_static(&[0, 7])),
            ],
            ..Default::default()
        };
        assert!(writer.write(ReadResponse {
            entities: vec![Entity::TableEntry(sdk)],
        }));
        let written = sink.lock();
        let Entity::TableEntry(entry) = &written[0].entities[0] else {
            panic!("wrong entity kind");
        };
        assert_eq!(
            entry.matches,
            vec![
                FieldMatch::exact(PORT_FIELD, Bytes::from_static(&[1])),
                FieldMatch::exact(2, Bytes::from_static(&[7])),
            ]
        );

        // An SDE port that isn't mapped can't be reported.
        let bad = TableEntry {
            table_id: TABLE_ID,
            matches: vec![FieldMatch::exact(
                PORT_FIELD,
                Bytes::from_static(&[0, 99]),
            )],
            ..Default::default()
        };
        drop(written);
        assert!(!writer.write(ReadResponse {
            entities: vec![Entity::TableEntry(bad)],
        }));
    }
}
