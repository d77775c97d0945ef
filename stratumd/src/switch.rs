// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The switch as a whole: the chassis manager plus one node per device.
//!
//! Requests from the management and P4Runtime services enter here and are
//! routed to the chassis manager or to the node they name.  Nodes are bound
//! to node ids by the chassis config; until one has been pushed, every
//! per-node request is rejected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use slog::info;
use slog::o;
use uuid::Uuid;

use crate::chassis::ChassisManager;
use crate::node::Node;
use crate::phal::PhalInterface;
use crate::port_map::PortMapper;
use crate::translator::Translator;
use crate::types::sde_call;
use crate::types::ErrorAccumulator;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::Writer;
use aal::DeviceId;
use aal::SdeInterface;
use common::chassis::ChassisConfig;
use common::chassis::GnmiEvent;
use common::chassis::PortDataRequest;
use common::chassis::PortDataResponse;
use common::p4rt::ForwardingPipelineConfig;
use common::p4rt::ReadRequest;
use common::p4rt::ReadResponse;
use common::p4rt::StreamMessageRequest;
use common::p4rt::StreamMessageResponse;
use common::p4rt::WriteRequest;

/// Settings shared by every node on the switch.
#[derive(Clone, Debug)]
pub struct NodeSettings {
    /// How long to wait for the SDE to sync counters or registers.
    pub sync_timeout: Duration,
    /// Rewrite translated P4Runtime values to SDK values and back.
    pub translation_enabled: bool,
    /// Accept port values with leading zero bytes.
    pub legacy_bytestring: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            sync_timeout: Duration::from_secs(1),
            translation_enabled: true,
            legacy_bytestring: false,
        }
    }
}

pub struct Switch {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    phal: Arc<dyn PhalInterface>,
    chassis: ChassisManager,
    device_nodes: BTreeMap<DeviceId, Arc<Node>>,
    // Filled in by each chassis config push.  Pipeline changes hold the
    // write lock so that entry reads and writes never see them half done.
    nodes: RwLock<BTreeMap<u64, Arc<Node>>>,
}

fn unknown_node(node_id: u64) -> StratumError {
    StratumError::InvalidParam(format!(
        "Node with ID {node_id} is unknown or no config has been pushed to \
         it yet."
    ))
}

impl Switch {
    /// Build a switch that manages each of `devices`.
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        phal: Arc<dyn PhalInterface>,
        devices: &[DeviceId],
        settings: &NodeSettings,
    ) -> Self {
        let log = log.new(o!("unit" => "switch"));
        let device_nodes = devices
            .iter()
            .map(|&device| {
                let translator = Arc::new(Translator::new(
                    &log,
                    sde.clone(),
                    device,
                    settings.translation_enabled,
                    settings.legacy_bytestring,
                ));
                let node = Node::new(
                    &log,
                    sde.clone(),
                    translator,
                    device,
                    settings.sync_timeout,
                );
                (device, Arc::new(node))
            })
            .collect();
        let chassis = ChassisManager::new(
            &log,
            sde.clone(),
            phal.clone(),
            Arc::new(PortMapper::new()),
        );
        Switch {
            log,
            sde,
            phal,
            chassis,
            device_nodes,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    fn node_for_device(&self, device: DeviceId) -> StratumResult<Arc<Node>> {
        self.device_nodes.get(&device).cloned().ok_or_else(|| {
            StratumError::InvalidParam(format!("Unit {device} is unknown."))
        })
    }

    fn node(&self, node_id: u64) -> StratumResult<Arc<Node>> {
        Self::lookup(&self.nodes.read(), node_id)
    }

    fn lookup(
        nodes: &BTreeMap<u64, Arc<Node>>,
        node_id: u64,
    ) -> StratumResult<Arc<Node>> {
        nodes.get(&node_id).cloned().ok_or_else(|| unknown_node(node_id))
    }

    /// Check that `config` is acceptable to the chassis manager, and that
    /// every node it names has a device to run on.
    pub fn verify_chassis_config(
        &self,
        config: &ChassisConfig,
    ) -> StratumResult<()> {
        self.chassis.verify_chassis_config(config)?;
        for (unit, node) in config.nodes.iter().enumerate() {
            self.node_for_device(unit as DeviceId)?
                .verify_chassis_config(config, node.id)?;
        }
        Ok(())
    }

    pub fn push_chassis_config(
        &self,
        config: &ChassisConfig,
    ) -> StratumResult<()> {
        let mut nodes = self.nodes.write();
        self.verify_chassis_config(config)?;
        self.phal.push_chassis_config(config)?;
        self.chassis.push_chassis_config(config)?;

        nodes.clear();
        for (node_id, unit) in self.chassis.get_node_id_to_unit_map()? {
            let node = self.node_for_device(unit)?;
            node.push_chassis_config(config, node_id)?;
            nodes.insert(node_id, node);
        }
        info!(self.log, "chassis config pushed"; "nodes" => nodes.len());
        Ok(())
    }

    pub fn verify_forwarding_pipeline_config(
        &self,
        node_id: u64,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<()> {
        let nodes = self.nodes.write();
        Self::lookup(&nodes, node_id)?.verify_forwarding_pipeline_config(config)
    }

    /// Install a pipeline on a node.  The device loses its ports when a
    /// pipeline is installed, so they are rebuilt from the chassis config
    /// afterwards.
    pub fn push_forwarding_pipeline_config(
        &self,
        node_id: u64,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<()> {
        let nodes = self.nodes.write();
        let node = Self::lookup(&nodes, node_id)?;
        node.push_forwarding_pipeline_config(config)?;
        self.restore_device(node_id, &node)?;
        info!(self.log, "forwarding pipeline pushed"; "node_id" => node_id);
        Ok(())
    }

    /// Stage a pipeline on a node.  The device is left alone until the
    /// pipeline is committed.
    pub fn save_forwarding_pipeline_config(
        &self,
        node_id: u64,
        config: &ForwardingPipelineConfig,
    ) -> StratumResult<()> {
        let nodes = self.nodes.write();
        Self::lookup(&nodes, node_id)?
            .save_forwarding_pipeline_config(config)?;
        info!(self.log, "forwarding pipeline saved"; "node_id" => node_id);
        Ok(())
    }

    /// Install the staged pipeline, then rebuild the ports it wiped out.
    pub fn commit_forwarding_pipeline_config(
        &self,
        node_id: u64,
    ) -> StratumResult<()> {
        let nodes = self.nodes.write();
        let node = Self::lookup(&nodes, node_id)?;
        node.commit_forwarding_pipeline_config()?;
        self.restore_device(node_id, &node)?;
        info!(self.log, "forwarding pipeline committed"; "node_id" => node_id);
        Ok(())
    }

    // A device comes back from a pipeline install with no ports and no CPU
    // port.
    fn restore_device(&self, node_id: u64, node: &Node) -> StratumResult<()> {
        self.chassis.replay_ports_config(node_id)?;
        let device = node.device();
        let cpu_port = sde_call!(self.sde.get_pcie_cpu_port(device))?;
        sde_call!(self.sde.set_tm_cpu_port(device, cpu_port))
    }

    pub fn write_forwarding_entries(
        &self,
        req: &WriteRequest,
        results: &mut Vec<StratumResult<()>>,
    ) -> StratumResult<()> {
        if req.updates.is_empty() {
            return Ok(());
        }
        if req.device_id == 0 {
            return Err(StratumError::InvalidParam(
                "No device_id in WriteRequest.".to_string(),
            ));
        }
        let nodes = self.nodes.read();
        Self::lookup(&nodes, req.device_id)?
            .write_forwarding_entries(req, results)
    }

    pub fn read_forwarding_entries(
        &self,
        req: &ReadRequest,
        writer: &dyn Writer<ReadResponse>,
        details: &mut Vec<StratumResult<()>>,
    ) -> StratumResult<()> {
        if req.device_id == 0 {
            return Err(StratumError::InvalidParam(
                "No device_id in ReadRequest.".to_string(),
            ));
        }
        let nodes = self.nodes.read();
        Self::lookup(&nodes, req.device_id)?
            .read_forwarding_entries(req, writer, details)
    }

    pub fn register_stream_message_response_writer(
        &self,
        node_id: u64,
        writer: Arc<dyn Writer<StreamMessageResponse>>,
    ) -> StratumResult<()> {
        self.node(node_id)?
            .register_stream_message_response_writer(writer)
    }

    pub fn unregister_stream_message_response_writer(
        &self,
        node_id: u64,
    ) -> StratumResult<()> {
        self.node(node_id)?.unregister_stream_message_response_writer()
    }

    pub fn handle_stream_message_request(
        &self,
        node_id: u64,
        request: &StreamMessageRequest,
    ) -> StratumResult<()> {
        self.node(node_id)?.handle_stream_message_request(request)
    }

    pub fn register_event_notify_writer(
        &self,
        writer: Arc<dyn Writer<GnmiEvent>>,
    ) -> Uuid {
        self.chassis.register_event_notify_writer(writer)
    }

    pub fn unregister_event_notify_writer(
        &self,
        id: Uuid,
    ) -> StratumResult<()> {
        self.chassis.unregister_event_notify_writer(id)
    }

    /// Answer each of `requests` in turn.  Successful answers go to
    /// `writer`, and `details` gets the outcome of every request.  A failed
    /// request doesn't fail the call.
    pub fn retrieve_value(
        &self,
        requests: &[PortDataRequest],
        writer: &dyn Writer<PortDataResponse>,
        details: &mut Vec<StratumResult<()>>,
    ) -> StratumResult<()> {
        let _nodes = self.nodes.read();
        for request in requests {
            let status = self.chassis.get_port_data(request).and_then(|r| {
                match writer.write(r) {
                    true => Ok(()),
                    false => Err(StratumError::Internal(
                        "Failed to write the data response.".to_string(),
                    )),
                }
            });
            details.push(status);
        }
        Ok(())
    }

    /// Shut down every node, then the chassis and platform.  Everything is
    /// shut down even if some of it fails.
    pub fn shutdown(&self) -> StratumResult<()> {
        let mut nodes = self.nodes.write();
        let mut errors = ErrorAccumulator::new();
        for node in self.device_nodes.values() {
            errors.push(node.shutdown());
        }
        errors.push(self.chassis.shutdown());
        errors.push(self.phal.shutdown());
        nodes.clear();
        info!(self.log, "switch shut down");
        errors.into_result()
    }
}
