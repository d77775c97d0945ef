// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use common::bytestring::ByteStringError;
use common::chassis::FecMode;
use common::chassis::LoopbackState;
use common::chassis::PortCounters;
use common::chassis::PortKey;
use common::chassis::PortState;
use common::chassis::TriState;
use common::p4info::P4Info;

mod match_action;
pub use match_action::*;

mod ports;
pub use ports::*;

mod pre;
pub use pre::*;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsicError {
    /// Error reported by the SDE.  This will report both the location in the
    /// ASIC layer that detected the error, as well as the detailed error
    /// message from the SDE.
    #[error("SDE error at {ctx}: {err}")]
    SdeError { ctx: String, err: String },
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An Asic function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// A general indication that a caller is trying to create something that
    /// already exists.
    #[error("Already exists")]
    Exists,
    /// A general indication that a caller is trying to modify or read
    /// something that is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
    /// The ASIC did not complete an asynchronous operation in time.
    #[error("Timed out: {}", .0)]
    Timeout(String),
}

impl From<ByteStringError> for AsicError {
    fn from(e: ByteStringError) -> Self {
        AsicError::InvalidArg(e.to_string())
    }
}

/// An SDE session.  Every table operation is issued against a session, and
/// operations issued between `begin_batch` and `end_batch` are pushed to the
/// hardware together.
pub trait Session: Send + Sync + fmt::Debug {
    fn begin_batch(&self) -> AsicResult<()>;
    fn end_batch(&self) -> AsicResult<()>;
}

pub type SessionHandle = Arc<dyn Session>;

/// A single compiled pipeline within a program: the context and binary
/// artifacts produced by the compiler, and the pipes it applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineProfile {
    pub name: String,
    pub scope: Vec<u32>,
    pub context: String,
    pub config: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Program {
    pub name: String,
    pub bfrt: String,
    pub p4info: P4Info,
    pub pipelines: Vec<PipelineProfile>,
}

/// Everything the SDE needs to install a forwarding pipeline on a device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub programs: Vec<Program>,
}

impl DeviceConfig {
    /// Decode a serialized device config.
    pub fn from_bytes(raw: &[u8]) -> AsicResult<Self> {
        serde_json::from_slice(raw).map_err(|e| {
            AsicError::InvalidArg(format!("malformed device config: {e}"))
        })
    }

    pub fn to_bytes(&self) -> AsicResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| AsicError::Internal(e.to_string()))
    }
}

/// The kinds of state the SDE caches in software and can be asked to refresh
/// from the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncKind {
    Counters,
    Registers,
}

/// One cell of an indirect counter.  A counter that only counts bytes or only
/// counts packets leaves the other field empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndirectCounter {
    pub index: u32,
    pub bytes: Option<u64>,
    pub packets: Option<u64>,
}

/// A two-rate, three-color meter configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeterSpec {
    pub cir: u64,
    pub cburst: u64,
    pub pir: u64,
    pub pburst: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndirectMeter {
    pub index: u32,
    pub in_pps: bool,
    pub spec: MeterSpec,
}

/// A selector group within an action profile.  The SDE expects the whole
/// membership to be written at once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionProfileGroup {
    pub group_id: u32,
    pub max_group_size: u32,
    pub member_ids: Vec<u32>,
    pub member_status: Vec<bool>,
}

/// The `SdeInterface` trait contains every operation the switch daemon
/// requires of the vendor SDE.  All other components reach the hardware only
/// through this trait.  Table ids passed to it are SDE ids; use `get_bfrt_id`
/// to convert from a P4Info id.
pub trait SdeInterface: Send + Sync {
    /// Install a forwarding pipeline on the device.
    fn add_device(&self, device: DeviceId, config: &DeviceConfig)
        -> AsicResult<()>;

    /// Create a new session for issuing table operations.
    fn create_session(&self) -> AsicResult<SessionHandle>;

    /// Create an empty key for the given table.
    fn create_table_key(&self, table_id: u32) -> AsicResult<TableKey>;

    /// Create an empty data object for the given table and action.  An
    /// action id of 0 creates a data object with no action.
    fn create_table_data(
        &self,
        table_id: u32,
        action_id: u32,
    ) -> AsicResult<TableData>;

    /// Reports the operational state of a port.
    fn get_port_state(
        &self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<PortState>;

    fn get_port_counters(
        &self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<PortCounters>;

    /// Register a channel on which the SDE will deliver port state changes.
    /// Only one writer may be registered at a time.
    fn register_port_status_event_writer(
        &self,
        writer: tokio::sync::mpsc::Sender<PortStatusEvent>,
    ) -> AsicResult<()>;

    fn unregister_port_status_event_writer(&self) -> AsicResult<()>;

    /// "Add" a port to the ASIC, carving out the lanes behind `port` and
    /// instructing the ASIC to manage them as a single port.
    fn add_port(
        &self,
        device: DeviceId,
        port: SdkPort,
        speed_bps: u64,
        fec_mode: FecMode,
    ) -> AsicResult<()>;

    /// Unconfigure a port, making its lanes available for reconfiguration.
    fn delete_port(&self, device: DeviceId, port: SdkPort) -> AsicResult<()>;

    fn enable_port(&self, device: DeviceId, port: SdkPort) -> AsicResult<()>;

    fn disable_port(&self, device: DeviceId, port: SdkPort) -> AsicResult<()>;

    fn set_port_autoneg_policy(
        &self,
        device: DeviceId,
        port: SdkPort,
        autoneg: TriState,
    ) -> AsicResult<()>;

    fn set_port_mtu(
        &self,
        device: DeviceId,
        port: SdkPort,
        mtu: i32,
    ) -> AsicResult<()>;

    /// Reports whether `port` names a port the SDE knows about.
    fn is_valid_port(&self, device: DeviceId, port: SdkPort) -> bool;

    fn set_port_loopback_mode(
        &self,
        device: DeviceId,
        port: SdkPort,
        mode: LoopbackState,
    ) -> AsicResult<()>;

    /// Configure the shaping rate of a port, either in packets or in bytes
    /// per second.
    fn set_port_shaping_rate(
        &self,
        device: DeviceId,
        port: SdkPort,
        is_in_pps: bool,
        burst_size: u32,
        rate_per_second: u64,
    ) -> AsicResult<()>;

    fn enable_port_shaping(
        &self,
        device: DeviceId,
        port: SdkPort,
        enable: TriState,
    ) -> AsicResult<()>;

    /// Send packets dropped by the traffic manager to `port` and `queue`.
    fn set_deflect_on_drop_destination(
        &self,
        device: DeviceId,
        port: SdkPort,
        queue: u32,
    ) -> AsicResult<()>;

    /// Given the physical location of a port, return the SDE port handle
    /// for it.  Fails with `Missing` if no such port exists.
    fn get_port_id_from_port_key(
        &self,
        device: DeviceId,
        key: &PortKey,
    ) -> AsicResult<SdkPort>;

    /// Returns the SDE port connected to the host's PCIe interface.
    fn get_pcie_cpu_port(&self, device: DeviceId) -> AsicResult<SdkPort>;

    fn set_tm_cpu_port(&self, device: DeviceId, port: SdkPort)
        -> AsicResult<()>;

    /// Reports whether the device is a software model rather than a real
    /// ASIC.
    fn is_software_model(&self, device: DeviceId) -> AsicResult<bool>;

    /// Transmit a packet from the CPU port.
    fn tx_packet(&self, device: DeviceId, packet: &[u8]) -> AsicResult<()>;

    fn start_packet_io(&self, device: DeviceId) -> AsicResult<()>;

    fn stop_packet_io(&self, device: DeviceId) -> AsicResult<()>;

    /// Register a channel on which packets received from the CPU port are
    /// delivered.
    fn register_packet_receive_writer(
        &self,
        device: DeviceId,
        writer: tokio::sync::mpsc::Sender<Bytes>,
    ) -> AsicResult<()>;

    fn unregister_packet_receive_writer(
        &self,
        device: DeviceId,
    ) -> AsicResult<()>;

    /// Create a multicast node replicating to the given ports and LAGs,
    /// returning the id assigned to it.
    fn create_multicast_node(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        replication_id: u32,
        lag_ids: &[u32],
        ports: &[SdkPort],
    ) -> AsicResult<u32>;

    /// Returns the ids of the nodes currently backing a multicast group.
    fn get_nodes_in_multicast_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        group_id: u32,
    ) -> AsicResult<Vec<u32>>;

    fn delete_multicast_nodes(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        node_ids: &[u32],
    ) -> AsicResult<()>;

    fn get_multicast_node(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        node_id: u32,
    ) -> AsicResult<MulticastNode>;

    fn insert_multicast_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        group_id: u32,
        node_ids: &[u32],
    ) -> AsicResult<()>;

    fn modify_multicast_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        group_id: u32,
        node_ids: &[u32],
    ) -> AsicResult<()>;

    fn delete_multicast_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        group_id: u32,
    ) -> AsicResult<()>;

    /// Returns the requested multicast group, or all groups if `group_id`
    /// is 0.
    fn get_multicast_groups(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        group_id: u32,
    ) -> AsicResult<Vec<MulticastGroup>>;

    fn insert_clone_session(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        clone: &CloneSession,
    ) -> AsicResult<()>;

    fn modify_clone_session(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        clone: &CloneSession,
    ) -> AsicResult<()>;

    fn delete_clone_session(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        session_id: u32,
    ) -> AsicResult<()>;

    /// Returns the requested clone session, or all sessions if `session_id`
    /// is 0.
    fn get_clone_sessions(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        session_id: u32,
    ) -> AsicResult<Vec<CloneSession>>;

    /// Write one cell of an indirect counter, or every cell if no index is
    /// given.
    fn write_indirect_counter(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        counter_id: u32,
        index: Option<u32>,
        byte_count: Option<u64>,
        packet_count: Option<u64>,
    ) -> AsicResult<()>;

    /// Read one cell of an indirect counter, or every cell if no index is
    /// given.  Values are as of the last sync.
    fn read_indirect_counter(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        counter_id: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<IndirectCounter>>;

    fn write_register(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
        value: &[u8],
    ) -> AsicResult<()>;

    /// Returns (index, value) pairs for the requested register cells.
    fn read_registers(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<(u32, u64)>>;

    fn write_indirect_meter(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
        in_pps: bool,
        spec: MeterSpec,
    ) -> AsicResult<()>;

    fn read_indirect_meters(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<IndirectMeter>>;

    fn insert_action_profile_member(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        member_id: u32,
        data: &TableData,
    ) -> AsicResult<()>;

    fn modify_action_profile_member(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        member_id: u32,
        data: &TableData,
    ) -> AsicResult<()>;

    fn delete_action_profile_member(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        member_id: u32,
    ) -> AsicResult<()>;

    /// Returns the requested member, or every member of the profile if
    /// `member_id` is 0.
    fn get_action_profile_members(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        member_id: u32,
    ) -> AsicResult<Vec<(u32, TableData)>>;

    fn insert_action_profile_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()>;

    fn modify_action_profile_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()>;

    fn delete_action_profile_group(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        group_id: u32,
    ) -> AsicResult<()>;

    /// Returns the requested group, or every group of the selector if
    /// `group_id` is 0.
    fn get_action_profile_groups(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        group_id: u32,
    ) -> AsicResult<Vec<ActionProfileGroup>>;

    fn insert_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
    ) -> AsicResult<()>;

    fn modify_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
    ) -> AsicResult<()>;

    fn delete_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
    ) -> AsicResult<()>;

    fn get_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
    ) -> AsicResult<TableData>;

    fn get_all_table_entries(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
    ) -> AsicResult<Vec<(TableKey, TableData)>>;

    fn set_default_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        data: &TableData,
    ) -> AsicResult<()>;

    fn reset_default_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
    ) -> AsicResult<()>;

    fn get_default_table_entry(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
    ) -> AsicResult<TableData>;

    /// Reports whether the table's software state can be synced from the
    /// hardware.
    fn sync_supported(
        &self,
        device: DeviceId,
        table_id: u32,
        kind: SyncKind,
    ) -> bool;

    /// Start an asynchronous sync of the table's software state.  A message
    /// is sent on `notify` when the sync completes.  If the receiver has
    /// already given up, the notification is discarded.
    fn request_sync(
        &self,
        device: DeviceId,
        session: &SessionHandle,
        table_id: u32,
        kind: SyncKind,
        notify: std::sync::mpsc::SyncSender<()>,
    ) -> AsicResult<()>;

    /// Map a P4Info object id to the SDE's id for the same object.
    fn get_bfrt_id(&self, p4info_id: u32) -> AsicResult<u32>;

    /// Map an SDE object id back to its P4Info id.
    fn get_p4info_id(&self, bfrt_id: u32) -> AsicResult<u32>;

    /// Returns the SDE id of the selector built on an action profile.
    fn get_action_selector_bfrt_id(
        &self,
        action_profile_id: u32,
    ) -> AsicResult<u32>;

    /// Returns the SDE id of the action profile behind a selector.
    fn get_action_profile_bfrt_id(
        &self,
        action_selector_id: u32,
    ) -> AsicResult<u32>;
}
