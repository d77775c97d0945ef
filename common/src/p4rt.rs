// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A model of the P4Runtime write/read/stream messages.  Each "oneof" in the
//! wire protocol is a Rust enum, so that every dispatch site is an exhaustive
//! match.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::p4info::P4Info;

/// Extern type id of a TNA action profile.
pub const TNA_EXTERN_ACTION_PROFILE_ID: u32 = 129;

/// Extern type id of a TNA action selector.
pub const TNA_EXTERN_ACTION_SELECTOR_ID: u32 = 130;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMatchType {
    Exact { value: Bytes },
    Ternary { value: Bytes, mask: Bytes },
    Lpm { value: Bytes, prefix_len: u32 },
    Range { low: Bytes, high: Bytes },
    Optional { value: Bytes },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldMatch {
    pub field_id: u32,
    pub field_match_type: FieldMatchType,
}

impl FieldMatch {
    pub fn exact(field_id: u32, value: impl Into<Bytes>) -> Self {
        FieldMatch {
            field_id,
            field_match_type: FieldMatchType::Exact {
                value: value.into(),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionParam {
    pub param_id: u32,
    pub value: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Action {
    pub action_id: u32,
    #[serde(default)]
    pub params: Vec<ActionParam>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionProfileAction {
    pub action: Action,
    #[serde(default)]
    pub weight: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionProfileActionSet {
    pub action_profile_actions: Vec<ActionProfileAction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableAction {
    Action(Action),
    ActionProfileMemberId(u32),
    ActionProfileGroupId(u32),
    ActionProfileActionSet(ActionProfileActionSet),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CounterData {
    pub byte_count: i64,
    pub packet_count: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MeterConfig {
    pub cir: i64,
    pub cburst: i64,
    pub pir: i64,
    pub pburst: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TableEntry {
    pub table_id: u32,
    #[serde(rename = "match")]
    pub matches: Vec<FieldMatch>,
    pub action: Option<TableAction>,
    pub priority: i32,
    pub is_default_action: bool,
    pub counter_data: Option<CounterData>,
    pub meter_config: Option<MeterConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionProfileMember {
    pub action_profile_id: u32,
    pub member_id: u32,
    #[serde(default)]
    pub action: Option<Action>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupMember {
    pub member_id: u32,
    #[serde(default)]
    pub weight: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionProfileGroup {
    pub action_profile_id: u32,
    pub group_id: u32,
    #[serde(default)]
    pub members: Vec<GroupMember>,
    #[serde(default)]
    pub max_size: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Index {
    pub index: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CounterEntry {
    pub counter_id: u32,
    #[serde(default)]
    pub index: Option<Index>,
    #[serde(default)]
    pub data: Option<CounterData>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DirectCounterEntry {
    pub table_entry: Option<TableEntry>,
    #[serde(default)]
    pub data: Option<CounterData>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MeterEntry {
    pub meter_id: u32,
    #[serde(default)]
    pub index: Option<Index>,
    #[serde(default)]
    pub config: Option<MeterConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DirectMeterEntry {
    pub table_entry: Option<TableEntry>,
    #[serde(default)]
    pub config: Option<MeterConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum P4Data {
    Bitstring(Bytes),
    Bool(bool),
    Tuple(Vec<P4Data>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegisterEntry {
    pub register_id: u32,
    #[serde(default)]
    pub index: Option<Index>,
    #[serde(default)]
    pub data: Option<P4Data>,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize,
)]
pub struct Replica {
    pub egress_port: u32,
    #[serde(default)]
    pub instance: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MulticastGroupEntry {
    pub multicast_group_id: u32,
    #[serde(default)]
    pub replicas: Vec<Replica>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloneSessionEntry {
    pub session_id: u32,
    #[serde(default)]
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub class_of_service: u32,
    #[serde(default)]
    pub packet_length_bytes: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketReplicationEngineEntry {
    MulticastGroupEntry(MulticastGroupEntry),
    CloneSessionEntry(CloneSessionEntry),
}

/// The payload of an extern entry.  On the wire this is an opaque `Any`; the
/// only payloads understood here are action-profile members and groups.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternPayload {
    ActionProfileMember(ActionProfileMember),
    ActionProfileGroup(ActionProfileGroup),
    Opaque(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExternEntry {
    pub extern_type_id: u32,
    pub extern_id: u32,
    #[serde(default)]
    pub entry: Option<ExternPayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ValueSetEntry {
    pub value_set_id: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DigestEntry {
    pub digest_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    ExternEntry(ExternEntry),
    TableEntry(TableEntry),
    ActionProfileMember(ActionProfileMember),
    ActionProfileGroup(ActionProfileGroup),
    MeterEntry(MeterEntry),
    DirectMeterEntry(DirectMeterEntry),
    CounterEntry(CounterEntry),
    DirectCounterEntry(DirectCounterEntry),
    PacketReplicationEngineEntry(PacketReplicationEngineEntry),
    ValueSetEntry(ValueSetEntry),
    RegisterEntry(RegisterEntry),
    DigestEntry(DigestEntry),
}

impl Entity {
    /// A short name for the kind of entity, for log and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::ExternEntry(_) => "extern_entry",
            Entity::TableEntry(_) => "table_entry",
            Entity::ActionProfileMember(_) => "action_profile_member",
            Entity::ActionProfileGroup(_) => "action_profile_group",
            Entity::MeterEntry(_) => "meter_entry",
            Entity::DirectMeterEntry(_) => "direct_meter_entry",
            Entity::CounterEntry(_) => "counter_entry",
            Entity::DirectCounterEntry(_) => "direct_counter_entry",
            Entity::PacketReplicationEngineEntry(_) => {
                "packet_replication_engine_entry"
            }
            Entity::ValueSetEntry(_) => "value_set_entry",
            Entity::RegisterEntry(_) => "register_entry",
            Entity::DigestEntry(_) => "digest_entry",
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    #[default]
    Unspecified,
    Insert,
    Modify,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub entity: Entity,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    #[default]
    ContinueOnError,
    RollbackOnError,
    DataplaneAtomic,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WriteRequest {
    pub device_id: u64,
    #[serde(default)]
    pub updates: Vec<Update>,
    #[serde(default)]
    pub atomicity: Atomicity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReadRequest {
    pub device_id: u64,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReadResponse {
    pub entities: Vec<Entity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PacketMetadata {
    pub metadata_id: u32,
    pub value: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PacketOut {
    pub payload: Bytes,
    #[serde(default)]
    pub metadata: Vec<PacketMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PacketIn {
    pub payload: Bytes,
    #[serde(default)]
    pub metadata: Vec<PacketMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DigestListAck {
    pub digest_id: u32,
    pub list_id: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MasterArbitrationUpdate {
    pub device_id: u64,
    pub election_id: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessageRequest {
    Arbitration(MasterArbitrationUpdate),
    Packet(PacketOut),
    DigestAck(DigestListAck),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessageResponse {
    Packet(PacketIn),
}

/// The pipeline a controller pushes: the P4Info describing the program and
/// the target-specific artifacts implementing it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardingPipelineConfig {
    pub p4info: Option<P4Info>,
    #[serde(default)]
    pub p4_device_config: Bytes,
}
