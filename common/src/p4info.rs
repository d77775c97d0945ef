// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A model of the P4Info schema: the description of a compiled P4 program's
//! control-plane objects, indexed by numeric id.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Name of the controller header carrying metadata for packets sent to the
/// controller.
pub const PACKET_IN_HEADER: &str = "packet_in";

/// Name of the controller header carrying metadata for packets sent by the
/// controller.
pub const PACKET_OUT_HEADER: &str = "packet_out";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Preamble {
    pub id: u32,
    pub name: String,
    pub alias: String,
    pub annotations: Vec<String>,
}

/// Reference to a user-defined type, by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NamedType {
    pub name: String,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Unspecified,
    Exact,
    Lpm,
    Ternary,
    Range,
    Optional,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MatchField {
    pub id: u32,
    pub name: String,
    pub bitwidth: u32,
    pub match_type: MatchType,
    pub type_name: Option<NamedType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionRef {
    pub id: u32,
    pub annotations: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Table {
    pub preamble: Preamble,
    pub match_fields: Vec<MatchField>,
    pub action_refs: Vec<ActionRef>,
    pub const_default_action_id: u32,
    pub implementation_id: u32,
    pub direct_resource_ids: Vec<u32>,
    pub size: i64,
}

impl Table {
    pub fn match_field(&self, id: u32) -> Option<&MatchField> {
        self.match_fields.iter().find(|f| f.id == id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionParam {
    pub id: u32,
    pub name: String,
    pub bitwidth: u32,
    pub type_name: Option<NamedType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Action {
    pub preamble: Preamble,
    pub params: Vec<ActionParam>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionProfile {
    pub preamble: Preamble,
    pub table_ids: Vec<u32>,
    pub with_selector: bool,
    pub size: i64,
    pub max_group_size: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterUnit {
    #[default]
    Unspecified,
    Bytes,
    Packets,
    Both,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Counter {
    pub preamble: Preamble,
    pub unit: CounterUnit,
    pub size: i64,
    pub index_type_name: Option<NamedType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectCounter {
    pub preamble: Preamble,
    pub unit: CounterUnit,
    pub direct_table_id: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Meter {
    pub preamble: Preamble,
    pub size: i64,
    pub index_type_name: Option<NamedType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectMeter {
    pub preamble: Preamble,
    pub direct_table_id: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Register {
    pub preamble: Preamble,
    pub bitwidth: u32,
    pub size: i32,
    pub index_type_name: Option<NamedType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PacketMetadataSpec {
    pub id: u32,
    pub name: String,
    pub bitwidth: u32,
    pub type_name: Option<NamedType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerPacketMetadata {
    pub preamble: Preamble,
    pub metadata: Vec<PacketMetadataSpec>,
}

/// An extern instance declared by the target architecture (for example an
/// action selector).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExternInstance {
    pub preamble: Preamble,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Extern {
    pub extern_type_id: u32,
    pub extern_type_name: String,
    pub instances: Vec<ExternInstance>,
}

/// How a translated type is presented to the controller.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SdnType {
    Bitwidth(u32),
    String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct P4NewTypeTranslation {
    pub uri: String,
    pub sdn_type: SdnType,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum P4NewTypeSpec {
    /// A plain alias of a bit type.
    OriginalType { bitwidth: u32 },
    /// A type the controller sees in a different numbering than the target.
    TranslatedType(P4NewTypeTranslation),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct P4TypeInfo {
    pub new_types: BTreeMap<String, P4NewTypeSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct P4Info {
    pub tables: Vec<Table>,
    pub actions: Vec<Action>,
    pub action_profiles: Vec<ActionProfile>,
    pub counters: Vec<Counter>,
    pub direct_counters: Vec<DirectCounter>,
    pub meters: Vec<Meter>,
    pub direct_meters: Vec<DirectMeter>,
    pub registers: Vec<Register>,
    pub controller_packet_metadata: Vec<ControllerPacketMetadata>,
    pub externs: Vec<Extern>,
    pub type_info: Option<P4TypeInfo>,
}

impl P4Info {
    pub fn table(&self, id: u32) -> Option<&Table> {
        self.tables.iter().find(|t| t.preamble.id == id)
    }

    pub fn action(&self, id: u32) -> Option<&Action> {
        self.actions.iter().find(|a| a.preamble.id == id)
    }

    pub fn action_profile(&self, id: u32) -> Option<&ActionProfile> {
        self.action_profiles.iter().find(|p| p.preamble.id == id)
    }

    pub fn register(&self, id: u32) -> Option<&Register> {
        self.registers.iter().find(|r| r.preamble.id == id)
    }

    pub fn controller_header(
        &self,
        name: &str,
    ) -> Option<&ControllerPacketMetadata> {
        self.controller_packet_metadata
            .iter()
            .find(|c| c.preamble.name == name)
    }
}
