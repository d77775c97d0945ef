// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A single switching device, as seen by a P4Runtime controller.
//!
//! The node owns the per-entity managers of one device.  It installs
//! forwarding pipelines on the device in two steps (save, then commit) and
//! fans the updates of each write request out to the manager responsible
//! for them.  Every entity passes through the translator on its way to and
//! from the SDE.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;

use crate::action_profile_manager::ActionProfileManager;
use crate::counter_manager::CounterManager;
use crate::packetio_manager::PacketIoManager;
use crate::pre_manager::PreManager;
use crate::table_manager::TableManager;
use crate::translator::Translator;
use crate::translator::TranslatingWriter;
use crate::types::sde_call;
use crate::types::ErrorAccumulator;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::write_entities;
use crate::writer::Writer;
use aal::DeviceConfig;
use aal::DeviceId;
use aal::SdeInterface;
use aal::SessionHandle;
use common::chassis::ChassisConfig;
use common::p4info::P4Info;
use common::p4rt::Atomicity;
use common::p4rt::Entity;
use common::p4rt::ExternEntry;
use common::p4rt::ForwardingPipelineConfig;
use common::p4rt::PacketIn;
use common::p4rt::ReadRequest;
use common::p4rt::ReadResponse;
use common::p4rt::StreamMessageRequest;
use common::p4rt::StreamMessageResponse;
use common::p4rt::UpdateType;
use common::p4rt::WriteRequest;
use common::p4rt::TNA_EXTERN_ACTION_PROFILE_ID;
use common::p4rt::TNA_EXTERN_ACTION_SELECTOR_ID;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum NodeState {
    Uninitialized,
    ChassisReady,
    ConfigSaved,
    PipelineReady,
}

/// A pipeline that has been saved but not yet committed.
#[derive(Clone, Debug)]
struct StagedPipeline {
    /// The P4Info as the controller sees it.
    p4info: P4Info,
    /// What the SDE is handed on commit; its programs carry the P4Info in
    /// SDE numbering.
    device_config: DeviceConfig,
}

#[derive(Debug)]
struct NodeInner {
    state: NodeState,
    node_id: u64,
    staged: Option<StagedPipeline>,
}

/// Presents the packets punted to the controller as stream responses.
struct PacketInWriter(Arc<dyn Writer<StreamMessageResponse>>);

impl Writer<PacketIn> for PacketInWriter {
    fn write(&self, msg: PacketIn) -> bool {
        self.0.write(StreamMessageResponse::Packet(msg))
    }
}

pub struct Node {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    translator: Arc<Translator>,
    table_manager: TableManager,
    action_profile_manager: ActionProfileManager,
    pre_manager: PreManager,
    counter_manager: CounterManager,
    packetio_manager: PacketIoManager,
    inner: RwLock<NodeInner>,
}

fn unsupported(entity: &Entity) -> StratumError {
    StratumError::Unimplemented(format!(
        "Unsupported entity type: {}.",
        entity.kind()
    ))
}

impl Node {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        translator: Arc<Translator>,
        device: DeviceId,
        sync_timeout: Duration,
    ) -> Self {
        let log = log.new(o!("unit" => "node", "device" => device));
        Node {
            table_manager: TableManager::new(
                &log,
                sde.clone(),
                device,
                sync_timeout,
            ),
            action_profile_manager: ActionProfileManager::new(
                &log,
                sde.clone(),
                device,
            ),
            pre_manager: PreManager::new(&log, sde.clone(), device),
            counter_manager: CounterManager::new(
                &log,
                sde.clone(),
                device,
                sync_timeout,
            ),
            packetio_manager: PacketIoManager::new(
                &log,
                sde.clone(),
                translator.clone(),
                device,
            ),
            log,
            sde,
            device,
            translator,
            inner: RwLock::new(NodeInner {
                state: NodeState::Uninitialized,
                node_id: 0,
                staged: None,
            }),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    /// Take on the identity of `node_id` and learn the numbering of its
    /// ports.
    pub fn push_chassis_config(
        &self,
        config: &ChassisConfig,
        node_id: u64,
    ) -> StratumResult<()> {
        let mut inner = self.inner.write();
        self.translator.push_chassis_config(config, node_id)?;
        inner.node_id = node_id;
        if inner.state == NodeState::Uninitialized {
            inner.state = NodeState::ChassisReady;
        }
        info!(self.log, "chassis config pushed"; "node_id" => node_id);
        Ok(())
    }

    pub fn verify_chassis_config(
        &self,
        config: &ChassisConfig,
        node_id: u64,
    ) -> StratumResult<()> {
        match config.nodes.iter().any(|n| n.id == node_id) {
            true => Ok(()),
            false => Err(StratumError::InvalidParam(format!(
                "Node {node_id} is not part of the chassis config."
            ))),
        }
    }

    /// Check that `config` could be installed and work out what the SDE
    /// would be handed.
    fn extract_and_verify(
        &self,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<StagedPipeline> {
        let p4info = config.p4info.as_ref().ok_or_else(|| {
            StratumError::InvalidParam("Missing P4 info.".to_string())
        })?;
        if config.p4_device_config.is_empty() {
            return Err(StratumError::InvalidParam(
                "Missing P4 device config.".to_string(),
            ));
        }
        let mut device_config =
            sde_call!(DeviceConfig::from_bytes(&config.p4_device_config))?;
        if device_config.programs.is_empty() {
            return Err(StratumError::InvalidParam(
                "P4 device config has no programs.".to_string(),
            ));
        }
        self.packetio_manager
            .verify_forwarding_pipeline_config(p4info)?;
        let translated = self.translator.translate_p4info(p4info)?;
        for program in device_config.programs.iter_mut() {
            program.p4info = translated.clone();
        }
        Ok(StagedPipeline {
            p4info: p4info.clone(),
            device_config,
        })
    }

    pub fn verify_forwarding_pipeline_config(
        &self,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<()> {
        self.extract_and_verify(config).map(|_| ())
    }

    /// Verify `config` and hold on to it until the next commit.
    pub fn save_forwarding_pipeline_config(
        &self,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<()> {
        let mut inner = self.inner.write();
        if inner.state == NodeState::Uninitialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        let staged = self.extract_and_verify(config)?;
        debug!(self.log, "pipeline saved";
            "programs" => staged.device_config.programs.len());
        inner.staged = Some(staged);
        if inner.state == NodeState::ChassisReady {
            inner.state = NodeState::ConfigSaved;
        }
        Ok(())
    }

    /// Install the saved pipeline on the device and hand it to every
    /// manager.  A failure part way through leaves the managers that were
    /// already updated in place; only a new push recovers from that.
    pub fn commit_forwarding_pipeline_config(&self) -> StratumResult<()> {
        let mut inner = self.inner.write();
        if inner.state == NodeState::Uninitialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        let staged = inner.staged.clone().ok_or_else(|| {
            StratumError::NotInitialized(
                "No forwarding pipeline config has been saved.".to_string(),
            )
        })?;
        let sdk_p4info = staged
            .device_config
            .programs
            .first()
            .map(|p| p.p4info.clone())
            .ok_or_else(|| {
                StratumError::InvalidParam(
                    "P4 device config has no programs.".to_string(),
                )
            })?;

        sde_call!(self.sde.add_device(self.device, &staged.device_config))?;
        self.translator
            .push_forwarding_pipeline_config(&staged.p4info)?;
        self.packetio_manager
            .push_forwarding_pipeline_config(&sdk_p4info)?;
        self.table_manager
            .push_forwarding_pipeline_config(&sdk_p4info)?;
        self.action_profile_manager
            .push_forwarding_pipeline_config(&sdk_p4info)?;
        self.pre_manager.push_forwarding_pipeline_config(&sdk_p4info)?;
        self.counter_manager
            .push_forwarding_pipeline_config(&sdk_p4info)?;

        inner.state = NodeState::PipelineReady;
        info!(self.log, "forwarding pipeline committed";
            "node_id" => inner.node_id,
            "tables" => sdk_p4info.tables.len());
        Ok(())
    }

    pub fn push_forwarding_pipeline_config(
        &self,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<()> {
        self.save_forwarding_pipeline_config(config)?;
        self.commit_forwarding_pipeline_config()
    }

    /// Stop packet IO and forget the node's identity.  The node ends up
    /// uninitialized even if part of the shutdown failed.
    pub fn shutdown(&self) -> StratumResult<()> {
        let mut inner = self.inner.write();
        let mut errors = ErrorAccumulator::new();
        errors.push(self.packetio_manager.shutdown());
        inner.state = NodeState::Uninitialized;
        inner.node_id = 0;
        inner.staged = None;
        info!(self.log, "node shut down");
        errors.into_result()
    }

    /// Fail unless the node is set up and `device_id` names it.
    fn check_request(&self, device_id: u64) -> StratumResult<()> {
        let inner = self.inner.read();
        if inner.state == NodeState::Uninitialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        if device_id != inner.node_id {
            return Err(StratumError::InvalidParam(format!(
                "Request device id {device_id} must be same as id of this \
                 node ({}).",
                inner.node_id
            )));
        }
        Ok(())
    }

    fn write_extern_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &ExternEntry,
    ) -> StratumResult<()> {
        match entry.extern_type_id {
            TNA_EXTERN_ACTION_PROFILE_ID | TNA_EXTERN_ACTION_SELECTOR_ID => self
                .action_profile_manager
                .write_action_profile_entry(session, update_type, entry),
            id => Err(StratumError::Unimplemented(format!(
                "Unsupported extern entry with type id {id}."
            ))),
        }
    }

    fn write_entity(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entity: &Entity,
    ) -> StratumResult<()> {
        let entity = self.translator.translate_entity(entity, true)?;
        match &entity {
            Entity::TableEntry(e) => {
                self.table_manager.write_table_entry(session, update_type, e)
            }
            Entity::ExternEntry(e) => {
                self.write_extern_entry(session, update_type, e)
            }
            Entity::ActionProfileMember(m) => self
                .action_profile_manager
                .write_action_profile_member(session, update_type, m),
            Entity::ActionProfileGroup(g) => self
                .action_profile_manager
                .write_action_profile_group(session, update_type, g),
            Entity::PacketReplicationEngineEntry(e) => {
                self.pre_manager.write_pre_entry(session, update_type, e)
            }
            Entity::DirectCounterEntry(e) => self
                .table_manager
                .write_direct_counter_entry(session, update_type, e),
            Entity::CounterEntry(e) => self
                .counter_manager
                .write_indirect_counter_entry(session, update_type, e),
            Entity::RegisterEntry(e) => {
                self.table_manager.write_register_entry(session, update_type, e)
            }
            Entity::MeterEntry(e) => {
                self.table_manager.write_meter_entry(session, update_type, e)
            }
            Entity::DirectMeterEntry(_)
            | Entity::ValueSetEntry(_)
            | Entity::DigestEntry(_) => Err(unsupported(&entity)),
        }
    }

    /// Apply every update of `req` in order, within a single batch.  A
    /// failed update doesn't stop the ones after it; `results` gets one
    /// entry per update.
    pub fn write_forwarding_entries(
        &self,
        req: &WriteRequest,
        results: &mut Vec<StratumResult<()>>,
    ) -> StratumResult<()> {
        self.check_request(req.device_id)?;
        if req.atomicity != Atomicity::ContinueOnError {
            return Err(StratumError::InvalidParam(format!(
                "Request atomicity {:?} is not supported.",
                req.atomicity
            )));
        }

        let session = sde_call!(self.sde.create_session())?;
        sde_call!(session.begin_batch())?;
        let mut success = true;
        for update in &req.updates {
            let result =
                self.write_entity(&session, update.update_type, &update.entity);
            if let Err(e) = &result {
                error!(self.log, "write failed";
                    "kind" => update.entity.kind(),
                    "type" => %update.update_type,
                    "error" => %e);
                success = false;
            }
            results.push(result);
        }
        sde_call!(session.end_batch())?;

        if !success {
            return Err(StratumError::AtLeastOneOperFailed(
                "One or more write operations failed.".to_string(),
            ));
        }
        debug!(self.log, "entities written"; "updates" => req.updates.len());
        Ok(())
    }

    fn read_extern_entry(
        &self,
        session: &SessionHandle,
        entry: &ExternEntry,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        match entry.extern_type_id {
            TNA_EXTERN_ACTION_PROFILE_ID | TNA_EXTERN_ACTION_SELECTOR_ID => self
                .action_profile_manager
                .read_action_profile_entry(session, entry, writer),
            id => Err(StratumError::OperNotSupported(format!(
                "Unsupported extern entry with type id {id}."
            ))),
        }
    }

    /// Read one entity of a request.  Counter values are returned rather
    /// than written, so that they all end up in one response.
    fn read_entity(
        &self,
        session: &SessionHandle,
        entity: &Entity,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<Vec<Entity>> {
        let entity = self.translator.translate_entity(entity, true)?;
        match &entity {
            Entity::TableEntry(e) => {
                self.table_manager.read_table_entry(session, e, writer)?;
            }
            Entity::ExternEntry(e) => {
                self.read_extern_entry(session, e, writer)?;
            }
            Entity::ActionProfileMember(m) => self
                .action_profile_manager
                .read_action_profile_member(session, m, writer)?,
            Entity::ActionProfileGroup(g) => self
                .action_profile_manager
                .read_action_profile_group(session, g, writer)?,
            Entity::PacketReplicationEngineEntry(e) => {
                self.pre_manager.read_pre_entry(session, e, writer)?;
            }
            Entity::DirectCounterEntry(e) => {
                let counter =
                    self.table_manager.read_direct_counter_entry(session, e)?;
                return Ok(vec![Entity::DirectCounterEntry(counter)]);
            }
            Entity::CounterEntry(e) => {
                let counters = self
                    .counter_manager
                    .read_indirect_counter_entry(session, e)?;
                return Ok(counters
                    .into_iter()
                    .map(Entity::CounterEntry)
                    .collect());
            }
            Entity::RegisterEntry(e) => {
                self.table_manager.read_register_entry(session, e, writer)?;
            }
            Entity::MeterEntry(e) => {
                self.table_manager.read_meter_entry(session, e, writer)?;
            }
            Entity::DirectMeterEntry(_)
            | Entity::ValueSetEntry(_)
            | Entity::DigestEntry(_) => return Err(unsupported(&entity)),
        }
        Ok(Vec::new())
    }

    /// Read every entity named in `req`.  Matching entities are sent to
    /// `writer` in controller numbering; counter values follow in a single
    /// final response.  `details` gets one entry per requested entity.
    pub fn read_forwarding_entries(
        &self,
        req: &ReadRequest,
        writer: &dyn Writer<ReadResponse>,
        details: &mut Vec<StratumResult<()>>,
    ) -> StratumResult<()> {
        self.check_request(req.device_id)?;
        let session = sde_call!(self.sde.create_session())?;
        let writer = TranslatingWriter::new(&self.translator, writer);

        let mut counters = Vec::new();
        let mut success = true;
        for entity in &req.entities {
            let result = self
                .read_entity(&session, entity, &writer)
                .map(|found| counters.extend(found));
            if let Err(e) = &result {
                debug!(self.log, "read failed";
                    "kind" => entity.kind(),
                    "error" => %e);
                success = false;
            }
            details.push(result);
        }
        write_entities(&writer, counters)?;

        match success {
            true => Ok(()),
            false => Err(StratumError::AtLeastOneOperFailed(
                "One or more read operations failed.".to_string(),
            )),
        }
    }

    /// Send everything the pipeline punts to the controller to `writer`.
    pub fn register_stream_message_response_writer(
        &self,
        writer: Arc<dyn Writer<StreamMessageResponse>>,
    ) -> StratumResult<()> {
        if self.state() == NodeState::Uninitialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        self.packetio_manager
            .register_packet_receive_writer(Arc::new(PacketInWriter(writer)));
        Ok(())
    }

    pub fn unregister_stream_message_response_writer(
        &self,
    ) -> StratumResult<()> {
        if self.state() == NodeState::Uninitialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        self.packetio_manager.unregister_packet_receive_writer();
        Ok(())
    }

    pub fn handle_stream_message_request(
        &self,
        request: &StreamMessageRequest,
    ) -> StratumResult<()> {
        match request {
            StreamMessageRequest::Packet(packet) => {
                if self.state() == NodeState::Uninitialized {
                    return Err(StratumError::NotInitialized(
                        "Not initialized!".to_string(),
                    ));
                }
                self.packetio_manager.transmit_packet(packet)
            }
            // Digests are never generated, so there is nothing to ack.
            StreamMessageRequest::DigestAck(_) => Ok(()),
            StreamMessageRequest::Arbitration(_) => {
                Err(StratumError::Unimplemented(
                    "Arbitration is not handled on the device stream."
                        .to_string(),
                ))
            }
        }
    }
}
