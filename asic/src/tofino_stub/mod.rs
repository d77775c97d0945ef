// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A software model of the Tofino SDE.  Every operation is carried out
//! against in-memory state, which lets the daemon run (and be tested)
//! without an ASIC.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::RwLock;
use slog::debug;
use slog::info;
use slog::o;
use tokio::sync::mpsc;

use aal::ActionProfileGroup;
use aal::AsicError;
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
use aal::Session;
use aal::SessionHandle;
use aal::SyncKind;
use aal::TableData;
use aal::TableKey;
use common::chassis::FecMode;
use common::chassis::LoopbackState;
use common::chassis::PortCounters;
use common::chassis::PortKey;
use common::chassis::PortState;
use common::chassis::TriState;

pub mod packetio;
pub mod ports;
pub mod pre;
pub mod schema;
pub mod table;

use schema::Schema;

#[derive(Clone, Debug, Default)]
pub struct AsicConfig {
    /// Overrides the SDE port reported as the PCIe CPU port.
    pub cpu_port: Option<SdkPort>,
}

#[derive(Debug)]
pub struct StubSession {
    id: u64,
    batching: AtomicBool,
}

impl Session for StubSession {
    fn begin_batch(&self) -> AsicResult<()> {
        match self.batching.swap(true, Ordering::SeqCst) {
            false => Ok(()),
            true => Err(AsicError::InvalidArg(format!(
                "session {} already has a batch open",
                self.id
            ))),
        }
    }

    fn end_batch(&self) -> AsicResult<()> {
        match self.batching.swap(false, Ordering::SeqCst) {
            true => Ok(()),
            false => Err(AsicError::InvalidArg(format!(
                "session {} has no batch open",
                self.id
            ))),
        }
    }
}

pub struct StubHandle {
    log: slog::Logger,
    cpu_port: SdkPort,
    next_session: AtomicU64,
    schema: RwLock<Option<Arc<Schema>>>,
    ports: Mutex<ports::PortData>,
    port_status_tx: Mutex<Option<mpsc::Sender<PortStatusEvent>>>,
    pre: Mutex<BTreeMap<DeviceId, pre::PreData>>,
    tables: Mutex<BTreeMap<DeviceId, table::TableStore>>,
    packet_io: Mutex<BTreeMap<DeviceId, packetio::PacketIo>>,
}

impl StubHandle {
    pub fn new(log: &slog::Logger, config: &AsicConfig) -> AsicResult<Self> {
        let log = log.new(o!("unit" => "tofino_stub"));
        Ok(StubHandle {
            log,
            cpu_port: config.cpu_port.unwrap_or(ports::PCIE_CPU_PORT),
            next_session: AtomicU64::new(1),
            schema: RwLock::new(None),
            ports: Mutex::new(ports::PortData::default()),
            port_status_tx: Mutex::new(None),
            pre: Mutex::new(BTreeMap::new()),
            tables: Mutex::new(BTreeMap::new()),
            packet_io: Mutex::new(BTreeMap::new()),
        })
    }

    fn schema(&self) -> AsicResult<Arc<Schema>> {
        self.schema.read().clone().ok_or_else(|| {
            AsicError::Uninitialized("no pipeline installed".to_string())
        })
    }

    fn with_tables<T, F>(&self, device: DeviceId, f: F) -> AsicResult<T>
    where
        F: FnOnce(&mut table::TableStore) -> AsicResult<T>,
    {
        let mut tables = self.tables.lock();
        f(tables.entry(device).or_default())
    }

    fn with_pre<T, F>(&self, device: DeviceId, f: F) -> AsicResult<T>
    where
        F: FnOnce(&mut pre::PreData) -> AsicResult<T>,
    {
        let mut pre = self.pre.lock();
        f(pre.entry(device).or_default())
    }

    fn with_packet_io<T, F>(&self, device: DeviceId, f: F) -> AsicResult<T>
    where
        F: FnOnce(&mut packetio::PacketIo) -> AsicResult<T>,
    {
        let mut pio = self.packet_io.lock();
        f(pio.entry(device).or_default())
    }

    /// Returns every packet transmitted on the device so far.
    pub fn transmitted_packets(&self, device: DeviceId) -> Vec<Bytes> {
        self.packet_io
            .lock()
            .get(&device)
            .map(|p| p.transmitted())
            .unwrap_or_default()
    }

    /// Deliver a packet to the registered receive writer, as though it had
    /// been punted to the CPU by the pipeline.
    pub fn inject_packet(
        &self,
        device: DeviceId,
        packet: Bytes,
    ) -> AsicResult<()> {
        self.with_packet_io(device, |p| p.receive(packet))
    }

    /// The port the traffic manager sends CPU-bound packets to, if one has
    /// been set.
    pub fn tm_cpu_port(&self, device: DeviceId) -> Option<SdkPort> {
        self.ports.lock().tm_cpu_port.get(&device).copied()
    }

    pub fn is_model(&self) -> bool {
        true
    }
}

impl SdeInterface for StubHandle {
    fn add_device(
        &self,
        device: DeviceId,
        config: &DeviceConfig,
    ) -> AsicResult<()> {
        let program = config.programs.first().ok_or_else(|| {
            AsicError::InvalidArg("device config has no programs".to_string())
        })?;
        info!(self.log, "installing program {} on device {}",
            program.name, device);
        let schema = Schema::new(&program.p4info);
        *self.schema.write() = Some(Arc::new(schema));
        // Installing a pipeline resets the device, so its forwarding state
        // and its ports are gone.
        self.tables.lock().remove(&device);
        self.pre.lock().remove(&device);
        let mut ports = self.ports.lock();
        ports.ports.retain(|(d, _), _| *d != device);
        ports.deflect_on_drop.remove(&device);
        ports.tm_cpu_port.remove(&device);
        Ok(())
    }

    fn create_session(&self) -> AsicResult<SessionHandle> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        debug!(self.log, "created session {}", id);
        Ok(Arc::new(StubSession {
            id,
            batching: AtomicBool::new(false),
        }))
    }

    fn create_table_key(&self, table_id: u32) -> AsicResult<TableKey> {
        Ok(TableKey::new(self.schema()?.table(table_id)?))
    }

    fn create_table_data(
        &self,
        table_id: u32,
        action_id: u32,
    ) -> AsicResult<TableData> {
        Ok(TableData::new(self.schema()?.table(table_id)?, action_id))
    }

    fn get_port_state(
        &self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<PortState> {
        ports::get_state(self, device, port)
    }

    fn get_port_counters(
        &self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<PortCounters> {
        ports::get_counters(self, device, port)
    }

    fn register_port_status_event_writer(
        &self,
        writer: mpsc::Sender<PortStatusEvent>,
    ) -> AsicResult<()> {
        *self.port_status_tx.lock() = Some(writer);
        Ok(())
    }

    fn unregister_port_status_event_writer(&self) -> AsicResult<()> {
        *self.port_status_tx.lock() = None;
        Ok(())
    }

    fn add_port(
        &self,
        device: DeviceId,
        port: SdkPort,
        speed_bps: u64,
        fec_mode: FecMode,
    ) -> AsicResult<()> {
        info!(self.log, "adding port {} on device {}", port, device;
            "speed_bps" => speed_bps, "fec" => %fec_mode);
        ports::add_port(self, device, port, speed_bps, fec_mode)
    }

    fn delete_port(&self, device: DeviceId, port: SdkPort) -> AsicResult<()> {
        info!(self.log, "deleting port {} on device {}", port, device);
        ports::delete_port(self, device, port)
    }

    fn enable_port(&self, device: DeviceId, port: SdkPort) -> AsicResult<()> {
        info!(self.log, "enabling port {} on device {}", port, device);
        ports::set_enable(self, device, port, true)
    }

    fn disable_port(&self, device: DeviceId, port: SdkPort) -> AsicResult<()> {
        info!(self.log, "disabling port {} on device {}", port, device);
        ports::set_enable(self, device, port, false)
    }

    fn set_port_autoneg_policy(
        &self,
        device: DeviceId,
        port: SdkPort,
        autoneg: TriState,
    ) -> AsicResult<()> {
        ports::update(self, device, port, |p| p.autoneg = autoneg)
    }

    fn set_port_mtu(
        &self,
        device: DeviceId,
        port: SdkPort,
        mtu: i32,
    ) -> AsicResult<()> {
        if mtu < 0 {
            return Err(AsicError::InvalidArg(format!("invalid mtu {mtu}")));
        }
        ports::update(self, device, port, |p| p.mtu = mtu)
    }

    fn is_valid_port(&self, device: DeviceId, port: SdkPort) -> bool {
        ports::is_valid(self, device, port)
    }

    fn set_port_loopback_mode(
        &self,
        device: DeviceId,
        port: SdkPort,
        mode: LoopbackState,
    ) -> AsicResult<()> {
        ports::update(self, device, port, |p| p.loopback = mode)
    }

    fn set_port_shaping_rate(
        &self,
        device: DeviceId,
        port: SdkPort,
        is_in_pps: bool,
        burst_size: u32,
        rate_per_second: u64,
    ) -> AsicResult<()> {
        ports::update(self, device, port, |p| {
            p.shaping = Some((is_in_pps, burst_size, rate_per_second))
        })
    }

    fn enable_port_shaping(
        &self,
        device: DeviceId,
        port: SdkPort,
        enable: TriState,
    ) -> AsicResult<()> {
        ports::update(self, device, port, |p| p.shaping_enabled = enable)
    }

    fn set_deflect_on_drop_destination(
        &self,
        device: DeviceId,
        port: SdkPort,
        queue: u32,
    ) -> AsicResult<()> {
        info!(self.log, "deflecting drops on device {} to port {} queue {}",
            device, port, queue);
        self.ports.lock().deflect_on_drop.insert(device, (port, queue));
        Ok(())
    }

    fn get_port_id_from_port_key(
        &self,
        _device: DeviceId,
        key: &PortKey,
    ) -> AsicResult<SdkPort> {
        ports::port_from_key(key)
    }

    fn get_pcie_cpu_port(&self, _device: DeviceId) -> AsicResult<SdkPort> {
        Ok(self.cpu_port)
    }

    fn set_tm_cpu_port(
        &self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<()> {
        self.ports.lock().tm_cpu_port.insert(device, port);
        Ok(())
    }

    fn is_software_model(&self, _device: DeviceId) -> AsicResult<bool> {
        Ok(true)
    }

    fn tx_packet(&self, device: DeviceId, packet: &[u8]) -> AsicResult<()> {
        self.with_packet_io(device, |p| p.tx(packet))
    }

    fn start_packet_io(&self, device: DeviceId) -> AsicResult<()> {
        self.with_packet_io(device, |p| {
            p.start();
            Ok(())
        })
    }

    fn stop_packet_io(&self, device: DeviceId) -> AsicResult<()> {
        self.with_packet_io(device, |p| {
            p.stop();
            Ok(())
        })
    }

    fn register_packet_receive_writer(
        &self,
        device: DeviceId,
        writer: mpsc::Sender<Bytes>,
    ) -> AsicResult<()> {
        self.with_packet_io(device, |p| {
            p.set_writer(Some(writer));
            Ok(())
        })
    }

    fn unregister_packet_receive_writer(
        &self,
        device: DeviceId,
    ) -> AsicResult<()> {
        self.with_packet_io(device, |p| {
            p.set_writer(None);
            Ok(())
        })
    }

    fn create_multicast_node(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        replication_id: u32,
        lag_ids: &[u32],
        ports: &[SdkPort],
    ) -> AsicResult<u32> {
        self.with_pre(device, |pre| {
            Ok(pre.node_create(replication_id, lag_ids, ports))
        })
    }

    fn get_nodes_in_multicast_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        group_id: u32,
    ) -> AsicResult<Vec<u32>> {
        self.with_pre(device, |pre| pre.group_nodes(group_id))
    }

    fn delete_multicast_nodes(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        node_ids: &[u32],
    ) -> AsicResult<()> {
        self.with_pre(device, |pre| pre.nodes_delete(node_ids))
    }

    fn get_multicast_node(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        node_id: u32,
    ) -> AsicResult<MulticastNode> {
        self.with_pre(device, |pre| pre.node_get(node_id))
    }

    fn insert_multicast_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        group_id: u32,
        node_ids: &[u32],
    ) -> AsicResult<()> {
        info!(self.log, "creating multicast group {}", group_id);
        self.with_pre(device, |pre| pre.group_insert(group_id, node_ids))
    }

    fn modify_multicast_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        group_id: u32,
        node_ids: &[u32],
    ) -> AsicResult<()> {
        self.with_pre(device, |pre| pre.group_modify(group_id, node_ids))
    }

    fn delete_multicast_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        group_id: u32,
    ) -> AsicResult<()> {
        info!(self.log, "destroying multicast group {}", group_id);
        self.with_pre(device, |pre| pre.group_delete(group_id))
    }

    fn get_multicast_groups(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        group_id: u32,
    ) -> AsicResult<Vec<MulticastGroup>> {
        self.with_pre(device, |pre| pre.groups_get(group_id))
    }

    fn insert_clone_session(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        clone: &CloneSession,
    ) -> AsicResult<()> {
        self.with_pre(device, |pre| pre.clone_insert(clone))
    }

    fn modify_clone_session(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        clone: &CloneSession,
    ) -> AsicResult<()> {
        self.with_pre(device, |pre| pre.clone_modify(clone))
    }

    fn delete_clone_session(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        session_id: u32,
    ) -> AsicResult<()> {
        self.with_pre(device, |pre| pre.clone_delete(session_id))
    }

    fn get_clone_sessions(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        session_id: u32,
    ) -> AsicResult<Vec<CloneSession>> {
        self.with_pre(device, |pre| pre.clones_get(session_id))
    }

    fn write_indirect_counter(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        counter_id: u32,
        index: Option<u32>,
        byte_count: Option<u64>,
        packet_count: Option<u64>,
    ) -> AsicResult<()> {
        let info = self.counter_info(counter_id)?;
        self.with_tables(device, |t| {
            t.counter_write(counter_id, info, index, byte_count, packet_count)
        })
    }

    fn read_indirect_counter(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        counter_id: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<IndirectCounter>> {
        let info = self.counter_info(counter_id)?;
        self.with_tables(device, |t| t.counter_read(counter_id, info, index))
    }

    fn write_register(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
        value: &[u8],
    ) -> AsicResult<()> {
        let info = self.register_info(table_id)?;
        self.with_tables(device, |t| {
            t.register_write(table_id, info, index, value)
        })
    }

    fn read_registers(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<(u32, u64)>> {
        let info = self.register_info(table_id)?;
        self.with_tables(device, |t| t.register_read(table_id, info, index))
    }

    fn write_indirect_meter(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
        in_pps: bool,
        spec: MeterSpec,
    ) -> AsicResult<()> {
        let size = self.meter_size(table_id)?;
        self.with_tables(device, |t| {
            t.meter_write(table_id, size, index, in_pps, spec)
        })
    }

    fn read_indirect_meters(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        index: Option<u32>,
    ) -> AsicResult<Vec<IndirectMeter>> {
        let size = self.meter_size(table_id)?;
        self.with_tables(device, |t| t.meter_read(table_id, size, index))
    }

    fn insert_action_profile_member(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        member_id: u32,
        data: &TableData,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| t.member_insert(table_id, member_id, data))
    }

    fn modify_action_profile_member(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        member_id: u32,
        data: &TableData,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| t.member_modify(table_id, member_id, data))
    }

    fn delete_action_profile_member(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        member_id: u32,
    ) -> AsicResult<()> {
        let selector = self.schema()?.selector_of(table_id).ok();
        self.with_tables(device, |t| {
            t.member_delete(table_id, selector, member_id)
        })
    }

    fn get_action_profile_members(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        member_id: u32,
    ) -> AsicResult<Vec<(u32, TableData)>> {
        self.with_tables(device, |t| t.members_get(table_id, member_id))
    }

    fn insert_action_profile_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()> {
        let profile = self.schema()?.profile_of(table_id)?;
        self.with_tables(device, |t| t.group_insert(table_id, profile, group))
    }

    fn modify_action_profile_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        group: &ActionProfileGroup,
    ) -> AsicResult<()> {
        let profile = self.schema()?.profile_of(table_id)?;
        self.with_tables(device, |t| t.group_modify(table_id, profile, group))
    }

    fn delete_action_profile_group(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        group_id: u32,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| t.group_delete(table_id, group_id))
    }

    fn get_action_profile_groups(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        group_id: u32,
    ) -> AsicResult<Vec<ActionProfileGroup>> {
        self.with_tables(device, |t| t.groups_get(table_id, group_id))
    }

    fn insert_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| t.entry_insert(table_id, key, data))
    }

    fn modify_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
        data: &TableData,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| t.entry_modify(table_id, key, data))
    }

    fn delete_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| t.entry_delete(table_id, key))
    }

    fn get_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        key: &TableKey,
    ) -> AsicResult<TableData> {
        self.with_tables(device, |t| t.entry_get(table_id, key))
    }

    fn get_all_table_entries(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
    ) -> AsicResult<Vec<(TableKey, TableData)>> {
        let schema = self.schema()?.table(table_id)?;
        self.with_tables(device, |t| Ok(t.entries_all(schema)))
    }

    fn set_default_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        data: &TableData,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| {
            t.default_set(table_id, data);
            Ok(())
        })
    }

    fn reset_default_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
    ) -> AsicResult<()> {
        self.with_tables(device, |t| {
            t.default_reset(table_id);
            Ok(())
        })
    }

    fn get_default_table_entry(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
    ) -> AsicResult<TableData> {
        let schema = self.schema()?.table(table_id)?;
        self.with_tables(device, |t| Ok(t.default_get(schema)))
    }

    fn sync_supported(
        &self,
        _device: DeviceId,
        table_id: u32,
        kind: SyncKind,
    ) -> bool {
        let Ok(schema) = self.schema() else {
            return false;
        };
        match kind {
            SyncKind::Counters => {
                schema.counters.contains_key(&table_id)
                    || schema.direct_counters.contains(&table_id)
            }
            SyncKind::Registers => schema.registers.contains_key(&table_id),
        }
    }

    fn request_sync(
        &self,
        device: DeviceId,
        _session: &SessionHandle,
        table_id: u32,
        kind: SyncKind,
        notify: std::sync::mpsc::SyncSender<()>,
    ) -> AsicResult<()> {
        if !self.sync_supported(device, table_id, kind) {
            return Err(AsicError::OperationUnsupported);
        }
        // The software model is always in sync with itself.
        if notify.try_send(()).is_err() {
            debug!(self.log, "sync of table {} completed after the caller \
                gave up", table_id);
        }
        Ok(())
    }

    fn get_bfrt_id(&self, p4info_id: u32) -> AsicResult<u32> {
        self.schema()?.bfrt_id(p4info_id)
    }

    fn get_p4info_id(&self, bfrt_id: u32) -> AsicResult<u32> {
        self.schema()?.p4info_id(bfrt_id)
    }

    fn get_action_selector_bfrt_id(
        &self,
        action_profile_id: u32,
    ) -> AsicResult<u32> {
        self.schema()?.selector_of(action_profile_id)
    }

    fn get_action_profile_bfrt_id(
        &self,
        action_selector_id: u32,
    ) -> AsicResult<u32> {
        self.schema()?.profile_of(action_selector_id)
    }
}

impl StubHandle {
    fn counter_info(&self, id: u32) -> AsicResult<schema::CounterInfo> {
        self.schema()?
            .counters
            .get(&id)
            .copied()
            .ok_or_else(|| AsicError::Missing(format!("no counter {id}")))
    }

    fn register_info(&self, id: u32) -> AsicResult<schema::RegisterInfo> {
        self.schema()?
            .registers
            .get(&id)
            .copied()
            .ok_or_else(|| AsicError::Missing(format!("no register {id}")))
    }

    fn meter_size(&self, id: u32) -> AsicResult<u32> {
        self.schema()?
            .meters
            .get(&id)
            .copied()
            .ok_or_else(|| AsicError::Missing(format!("no meter {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::Program;
    use common::p4info::ActionRef;
    use common::p4info::Counter;
    use common::p4info::CounterUnit;
    use common::p4info::MatchField;
    use common::p4info::P4Info;
    use common::p4info::Preamble;
    use common::p4info::Table;
    use pretty_assertions::assert_eq;
    use slog::Drain;

    fn test_logger() -> slog::Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, o!())
    }

    fn device_config() -> DeviceConfig {
        let p4info = P4Info {
            tables: vec![Table {
                preamble: Preamble {
                    id: 0x0200_0001,
                    ..Default::default()
                },
                match_fields: vec![MatchField {
                    id: 1,
                    bitwidth: 32,
                    ..Default::default()
                }],
                action_refs: vec![ActionRef {
                    id: 0x0100_0001,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            counters: vec![Counter {
                preamble: Preamble {
                    id: 0x1200_0001,
                    ..Default::default()
                },
                unit: CounterUnit::Both,
                size: 8,
                ..Default::default()
            }],
            ..Default::default()
        };
        DeviceConfig {
            programs: vec![Program {
                name: "test".to_string(),
                p4info,
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_tables_need_pipeline() {
        let hdl = StubHandle::new(&test_logger(), &AsicConfig::default())
            .unwrap();
        assert!(matches!(
            hdl.create_table_key(0x0200_0001),
            Err(AsicError::Uninitialized(_))
        ));
        hdl.add_device(0, &device_config()).unwrap();
        assert!(hdl.create_table_key(0x0200_0001).is_ok());
        assert!(hdl.create_table_key(0x0200_0002).is_err());
    }

    #[test]
    fn test_table_entry_round_trip() {
        let hdl = StubHandle::new(&test_logger(), &AsicConfig::default())
            .unwrap();
        hdl.add_device(0, &device_config()).unwrap();
        let session = hdl.create_session().unwrap();
        session.begin_batch().unwrap();
        assert!(session.begin_batch().is_err());

        let mut key = hdl.create_table_key(0x0200_0001).unwrap();
        key.set_exact(1, &[10, 0, 0, 1]).unwrap();
        let data = hdl.create_table_data(0x0200_0001, 0x0100_0001).unwrap();
        hdl.insert_table_entry(0, &session, 0x0200_0001, &key, &data)
            .unwrap();
        session.end_batch().unwrap();

        let all = hdl.get_all_table_entries(0, &session, 0x0200_0001).unwrap();
        assert_eq!(all, vec![(key.clone(), data.clone())]);
        assert_eq!(
            hdl.get_table_entry(0, &session, 0x0200_0001, &key).unwrap(),
            data
        );
        // Reinstalling the pipeline clears the tables.
        hdl.add_device(0, &device_config()).unwrap();
        assert!(hdl
            .get_all_table_entries(0, &session, 0x0200_0001)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_port_events() {
        let hdl = StubHandle::new(&test_logger(), &AsicConfig::default())
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        hdl.register_port_status_event_writer(tx).unwrap();

        let port = hdl
            .get_port_id_from_port_key(0, &PortKey::new(1, 2, 0))
            .unwrap();
        assert!(!hdl.is_valid_port(0, port));
        hdl.add_port(0, port, 100_000_000_000, FecMode::Unknown).unwrap();
        assert!(hdl.is_valid_port(0, port));
        assert_eq!(hdl.get_port_state(0, port).unwrap(), PortState::Down);

        hdl.enable_port(0, port).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!((event.port, event.state), (port, PortState::Up));

        hdl.disable_port(0, port).unwrap();
        assert_eq!(rx.try_recv().unwrap().state, PortState::Down);
        hdl.delete_port(0, port).unwrap();
        assert!(hdl.enable_port(0, port).is_err());
    }

    #[test]
    fn test_counter_sync() {
        let hdl = StubHandle::new(&test_logger(), &AsicConfig::default())
            .unwrap();
        hdl.add_device(0, &device_config()).unwrap();
        let session = hdl.create_session().unwrap();
        assert!(hdl.sync_supported(0, 0x1200_0001, SyncKind::Counters));
        assert!(!hdl.sync_supported(0, 0x1200_0001, SyncKind::Registers));

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        hdl.request_sync(0, &session, 0x1200_0001, SyncKind::Counters, tx)
            .unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();

        hdl.write_indirect_counter(
            0,
            &session,
            0x1200_0001,
            Some(3),
            Some(100),
            Some(2),
        )
        .unwrap();
        let cells = hdl
            .read_indirect_counter(0, &session, 0x1200_0001, Some(3))
            .unwrap();
        assert_eq!(
            cells,
            vec![IndirectCounter {
                index: 3,
                bytes: Some(100),
                packets: Some(2)
            }]
        );
    }

    #[test]
    fn test_packet_io() {
        let hdl = StubHandle::new(&test_logger(), &AsicConfig::default())
            .unwrap();
        assert!(hdl.tx_packet(0, b"early").is_err());
        let (tx, mut rx) = mpsc::channel(4);
        hdl.register_packet_receive_writer(0, tx).unwrap();
        hdl.start_packet_io(0).unwrap();
        hdl.tx_packet(0, b"hello").unwrap();
        assert_eq!(hdl.transmitted_packets(0), vec![Bytes::from("hello")]);
        hdl.inject_packet(0, Bytes::from("punt")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from("punt"));
        assert_eq!(hdl.get_pcie_cpu_port(0).unwrap(), ports::PCIE_CPU_PORT);
    }
}
