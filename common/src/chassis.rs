// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types describing the declarative chassis configuration and the per-port
//! state reported back to management clients.

use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The SDN port id reserved for the CPU port.  It never appears in a chassis
/// config.
pub const CPU_PORT_ID: u32 = 0xFFFF_FFFD;

/// The SDN port id used when a P4Runtime value leaves the port unspecified.
pub const UNSPECIFIED_PORT_ID: u32 = 0;

/// Identifies a physical port by its location on the chassis.  This is the
/// identity that survives reboots; the SDK port handle does not.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct PortKey {
    pub slot: i32,
    pub port: i32,
    pub channel: i32,
}

impl PortKey {
    pub fn new(slot: i32, port: i32, channel: i32) -> Self {
        PortKey {
            slot,
            port,
            channel,
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.slot, self.port, self.channel)
    }
}

macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            Debug,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Deserialize,
            Serialize,
            JsonSchema,
            strum::Display,
            strum::EnumIter,
        )]
        #[serde(rename_all = "snake_case")]
        #[strum(serialize_all = "snake_case")]
        pub enum $name {
            #[default]
            $($variant),+
        }
    };
}

config_enum! {
    /// The administrative state requested for a port.
    AdminState { Unknown, Enabled, Disabled, Diag }
}

config_enum! {
    /// The operational state of a port as reported by the SDK.
    PortState { Unknown, Up, Down, Failed }
}

config_enum! {
    FecMode { Unknown, On, Off, Auto }
}

config_enum! {
    /// A boolean setting that may be left unset.
    TriState { Unknown, True, False }
}

config_enum! {
    LoopbackState { Unknown, None, Mac, Phy }
}

config_enum! {
    Platform { Unknown, GenericBarefootTofino, GenericBarefootTofino2 }
}

config_enum! {
    /// Whether a port may currently be used for forwarding.
    ForwardingViability { Unknown, TrunkMemberBlock, TrunkMemberUnblock }
}

config_enum! {
    HealthState { Unknown, Good, Bad }
}

config_enum! {
    /// Whether a transceiver or other piece of hardware is present.
    HwState { Unknown, NotPresent, Present, Configured, Ready }
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct Chassis {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub name: String,
}

/// A single switching ASIC in the chassis.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct Node {
    pub id: u64,
    pub slot: i32,
    #[serde(default)]
    pub name: String,
}

/// Per-port settings that may change between configuration pushes.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(default)]
pub struct PortConfigParams {
    pub admin_state: AdminState,
    pub fec_mode: FecMode,
    pub autoneg: TriState,
    pub loopback_mode: LoopbackState,
    pub mtu: i32,
}

/// A port as presented to the operator: a stable id tied to a physical
/// location on the chassis.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct SingletonPort {
    pub id: u32,
    pub node: u64,
    pub slot: i32,
    pub port: i32,
    #[serde(default)]
    pub channel: i32,
    pub speed_bps: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config_params: PortConfigParams,
}

impl SingletonPort {
    pub fn port_key(&self) -> PortKey {
        PortKey::new(self.slot, self.port, self.channel)
    }
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct TrunkPort {
    pub id: u32,
    pub node: u64,
    #[serde(default)]
    pub members: Vec<u32>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct PortGroup {
    pub id: u32,
    #[serde(default)]
    pub members: Vec<u32>,
}

/// Rate limit for a single port, in packets or in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PortShapingConfig {
    PacketShaping {
        max_rate_pps: u64,
        max_burst_packets: u32,
    },
    ByteShaping {
        max_rate_bps: u64,
        max_burst_bytes: u32,
    },
}

/// Where a dropped packet is deflected to.  The target is named either by
/// singleton port id or directly by SDK port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DropTargetPort {
    Port(u32),
    SdkPort(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct DropTarget {
    pub target: DropTargetPort,
    #[serde(default)]
    pub queue: u32,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct DeflectOnDropConfig {
    #[serde(default)]
    pub drop_targets: Vec<DropTarget>,
}

/// Tofino specific extensions, keyed by node id and then by port id.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(default)]
pub struct TofinoConfig {
    pub node_id_to_port_shaping_config:
        BTreeMap<u64, BTreeMap<u32, PortShapingConfig>>,
    pub node_id_to_deflect_on_drop_configs: BTreeMap<u64, DeflectOnDropConfig>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct VendorConfig {
    #[serde(default)]
    pub tofino_config: Option<TofinoConfig>,
}

/// The complete declarative description of the chassis.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(default)]
pub struct ChassisConfig {
    pub description: String,
    pub chassis: Option<Chassis>,
    pub nodes: Vec<Node>,
    pub singleton_ports: Vec<SingletonPort>,
    pub trunk_ports: Vec<TrunkPort>,
    pub port_groups: Vec<PortGroup>,
    pub vendor_config: Option<VendorConfig>,
}

impl ChassisConfig {
    pub fn tofino_config(&self) -> Option<&TofinoConfig> {
        self.vendor_config
            .as_ref()
            .and_then(|v| v.tofino_config.as_ref())
    }
}

/// Packet and byte counters for a single port.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct PortCounters {
    pub in_octets: u64,
    pub out_octets: u64,
    pub in_unicast_pkts: u64,
    pub out_unicast_pkts: u64,
    pub in_broadcast_pkts: u64,
    pub out_broadcast_pkts: u64,
    pub in_multicast_pkts: u64,
    pub out_multicast_pkts: u64,
    pub in_discards: u64,
    pub out_discards: u64,
    pub in_unknown_protos: u64,
    pub in_errors: u64,
    pub out_errors: u64,
    pub in_fcs_errors: u64,
}

/// Hardware details for the front panel port backing a singleton port.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct FrontPanelPortInfo {
    pub physical_port_type: String,
    pub media_type: String,
    pub vendor_name: String,
    pub part_number: String,
    pub serial_number: String,
    pub hw_state: HwState,
}

/// The kinds of per-port data a management client can ask for.  Every
/// request names the node and port it is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PortDataRequest {
    OperStatus { node_id: u64, port_id: u32 },
    AdminStatus { node_id: u64, port_id: u32 },
    MacAddress { node_id: u64, port_id: u32 },
    PortSpeed { node_id: u64, port_id: u32 },
    NegotiatedPortSpeed { node_id: u64, port_id: u32 },
    LacpRouterMac { node_id: u64, port_id: u32 },
    PortCounters { node_id: u64, port_id: u32 },
    AutonegStatus { node_id: u64, port_id: u32 },
    FrontPanelPortInfo { node_id: u64, port_id: u32 },
    FecStatus { node_id: u64, port_id: u32 },
    LoopbackStatus { node_id: u64, port_id: u32 },
    SdnPortId { node_id: u64, port_id: u32 },
    ForwardingViability { node_id: u64, port_id: u32 },
    HealthIndicator { node_id: u64, port_id: u32 },
    LacpSystemPriority { node_id: u64, port_id: u32 },
    PortQosCounters { node_id: u64, port_id: u32, queue_id: u32 },
}

/// The answer to a `PortDataRequest`.  Fields that are unknown for the port
/// are left empty rather than reported as an error.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PortDataResponse {
    OperStatus {
        state: PortState,
        time_last_changed: DateTime<Utc>,
    },
    AdminStatus(AdminState),
    MacAddress(u64),
    PortSpeed(Option<u64>),
    NegotiatedPortSpeed(Option<u64>),
    LacpRouterMac(u64),
    PortCounters(PortCounters),
    AutonegStatus(Option<TriState>),
    FrontPanelPortInfo(FrontPanelPortInfo),
    FecStatus(Option<FecMode>),
    LoopbackStatus(Option<LoopbackState>),
    SdnPortId(u32),
    ForwardingViability(ForwardingViability),
    HealthIndicator(HealthState),
}

/// An asynchronous notification delivered to management-plane subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum GnmiEvent {
    PortOperStateChanged {
        node_id: u64,
        port_id: u32,
        new_state: PortState,
        time_last_changed: DateTime<Utc>,
    },
}
