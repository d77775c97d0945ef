// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Shared scaffolding for the unit tests: a logger that writes through the
//! test harness, and a mock of the SDE.

use std::sync::Arc;

use bytes::Bytes;
use cfg_if::cfg_if;
use slog::o;
use slog::Drain;

use aal::ActionProfileGroup;
use aal::AsicResult;
use aal::CloneSession;
use aal::DeviceConfig;
use aal::DeviceId;
use aal::IndirectCounter;
use aal::IndirectMeter;
use aal::MeterSpec;
use aal::MulticastGroup;
use aal::MulticastNode;
use aal::PortStatusEvent;
use aal::SdeInterface;
use aal::SdkPort;
use aal::SessionHandle;
use aal::SyncKind;
use aal::TableData;
use aal::TableKey;
use asic::AsicConfig;
use asic::Handle;
use common::chassis::FecMode;
use common::chassis::LoopbackState;
use common::chassis::PortCounters;
use common::chassis::PortKey;
use common::chassis::PortState;
use common::chassis::TriState;

pub fn test_logger() -> slog::Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, o!())
}

/// A software model of the SDE, for tests that want real state rather than
/// scripted expectations.
pub fn stub_sde() -> Arc<Handle> {
    match Handle::new(&test_logger(), &AsicConfig::default()) {
        Ok(h) => Arc::new(h),
        Err(e) => panic!("failed to create stub handle: {e}"),
    }
}

cfg_if! {
    if #[cfg(test)] {
        mockall::mock! {
            pub Session {}
            impl aal::Session for Session {
                fn begin_batch(&self) -> AsicResult<()>;
                fn end_batch(&self) -> AsicResult<()>;
            }
            impl std::fmt::Debug for Session {
                fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
            }
        }

        mockall::mock! {
            pub Sde {}
            impl SdeInterface for Sde {
                fn add_device(&self, device: DeviceId, config: &DeviceConfig)
                    -> AsicResult<()>;
                fn create_session(&self) -> AsicResult<SessionHandle>;
                fn create_table_key(&self, table_id: u32) -> AsicResult<TableKey>;
                fn create_table_data(&self, table_id: u32, action_id: u32)
                    -> AsicResult<TableData>;
                fn get_port_state(&self, device: DeviceId, port: SdkPort)
                    -> AsicResult<PortState>;
                fn get_port_counters(&self, device: DeviceId, port: SdkPort)
                    -> AsicResult<PortCounters>;
                fn register_port_status_event_writer(
                    &self,
                    writer: tokio::sync::mpsc::Sender<PortStatusEvent>,
                ) -> AsicResult<()>;
                fn unregister_port_status_event_writer(&self) -> AsicResult<()>;
                fn add_port(
                    &self,
                    device: DeviceId,
                    port: SdkPort,
                    speed_bps: u64,
                    fec_mode: FecMode,
                ) -> AsicResult<()>;
                fn delete_port(&self, device: DeviceId, port: SdkPort)
                    -> AsicResult<()>;
                fn enable_port(&self, device: DeviceId, port: SdkPort)
                    -> AsicResult<()>;
                fn disable_port(&self, device: DeviceId, port: SdkPort)
                    -> AsicResult<()>;
                fn set_port_autoneg_policy(
                    &self,
                    device: DeviceId,
                    port: SdkPort,
                    autoneg: TriState,
                ) -> AsicResult<()>;
                fn set_port_mtu(&self, device: DeviceId, port: SdkPort, mtu: i32)
                    -> AsicResult<()>;
                fn is_valid_port(&self, device: DeviceId, port: SdkPort) -> bool;
                fn set_port_loopback_mode(
                    &self,
                    device: DeviceId,
                    port: SdkPort,
                    mode: LoopbackState,
                ) -> AsicResult<()>;
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
                fn set_deflect_on_drop_destination(
                    &self,
                    device: DeviceId,
                    port: SdkPort,
                    queue: u32,
                ) -> AsicResult<()>;
                fn get_port_id_from_port_key(&self, device: DeviceId, key: &PortKey)
                    -> AsicResult<SdkPort>;
                fn get_pcie_cpu_port(&self, device: DeviceId) -> AsicResult<SdkPort>;
                fn set_tm_cpu_port(&self, device: DeviceId, port: SdkPort)
                    -> AsicResult<()>;
                fn is_software_model(&self, device: DeviceId) -> AsicResult<bool>;
                fn tx_packet(&self, device: DeviceId, packet: &[u8]) -> AsicResult<()>;
                fn start_packet_io(&self, device: DeviceId) -> AsicResult<()>;
                fn stop_packet_io(&self, device: DeviceId) -> AsicResult<()>;
                fn register_packet_receive_writer(
                    &self,
                    device: DeviceId,
                    writer: tokio::sync::mpsc::Sender<Bytes>,
                ) -> AsicResult<()>;
                fn unregister_packet_receive_writer(&self, device: DeviceId)
                    -> AsicResult<()>;
                fn create_multicast_node(
                    &self,
                    device: DeviceId,
                    session: &SessionHandle,
                    replication_id: u32,
                    lag_ids: &[u32],
                    ports: &[SdkPort],
                ) -> AsicResult<u32>;
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
                fn get_clone_sessions(
                    &self,
                    device: DeviceId,
                    session: &SessionHandle,
                    session_id: u32,
                ) -> AsicResult<Vec<CloneSession>>;
                fn write_indirect_counter(
                    &self,
                    device: DeviceId,
                    session: &SessionHandle,
                    counter_id: u32,
                    index: Option<u32>,
                    byte_count: Option<u64>,
                    packet_count: Option<u64>,
                ) -> AsicResult<()>;
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
                fn sync_supported(
                    &self,
                    device: DeviceId,
                    table_id: u32,
                    kind: SyncKind,
                ) -> bool;
                fn request_sync(
                    &self,
                    device: DeviceId,
                    session: &SessionHandle,
                    table_id: u32,
                    kind: SyncKind,
                    notify: std::sync::mpsc::SyncSender<()>,
                ) -> AsicResult<()>;
                fn get_bfrt_id(&self, p4info_id: u32) -> AsicResult<u32>;
                fn get_p4info_id(&self, bfrt_id: u32) -> AsicResult<u32>;
                fn get_action_selector_bfrt_id(&self, action_profile_id: u32)
                    -> AsicResult<u32>;
                fn get_action_profile_bfrt_id(&self, action_selector_id: u32)
                    -> AsicResult<u32>;
            }
        }

        /// A session whose batches always open and close cleanly.
        pub fn mock_session() -> SessionHandle {
            let mut session = MockSession::new();
            session.expect_begin_batch().returning(|| Ok(()));
            session.expect_end_batch().returning(|| Ok(()));
            session.expect_fmt().returning(|_| Ok(()));
            Arc::new(session)
        }
    }
}
