// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The chassis manager owns the port layer of the switch.
//!
//! A chassis config names the nodes (one per ASIC) and the singleton ports
//! living on each of them.  Pushing a config brings the SDE's ports in line
//! with it: new ports are added, ports that disappeared are deleted, and
//! ports whose settings changed are reconfigured in place where the SDE
//! allows it.  The manager keeps the config it last applied, so that later
//! pushes can be computed as a diff, and so that the whole thing can be
//! replayed into an SDE that has lost its state.
//!
//! The manager also turns the SDE's port status events into gNMI
//! notifications.  The SDE writes events into a channel; a dedicated thread
//! drains it, updates the cached port state, and hands an event to every
//! registered gNMI writer.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use parking_lot::RwLock;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::phal::PhalInterface;
use crate::port_map::PortMapper;
use crate::port_map::PortMapping;
use crate::types::sde_call;
use crate::types::ErrorAccumulator;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::Writer;
use aal::DeviceId;
use aal::PortStatusEvent;
use aal::SdeInterface;
use aal::SdkPort;
use common::chassis::AdminState;
use common::chassis::ChassisConfig;
use common::chassis::DropTargetPort;
use common::chassis::FecMode;
use common::chassis::ForwardingViability;
use common::chassis::GnmiEvent;
use common::chassis::HealthState;
use common::chassis::LoopbackState;
use common::chassis::Platform;
use common::chassis::PortConfigParams;
use common::chassis::PortCounters;
use common::chassis::PortDataRequest;
use common::chassis::PortDataResponse;
use common::chassis::PortKey;
use common::chassis::PortShapingConfig;
use common::chassis::PortState;
use common::chassis::SingletonPort;
use common::chassis::TofinoConfig;
use common::chassis::TriState;
use common::chassis::CPU_PORT_ID;

const PORT_STATUS_CHANNEL_DEPTH: usize = 1024;

/// Reported for both the port and the LACP router MAC until the platform
/// layer can tell us the real addresses.
const DUMMY_MAC_ADDRESS: u64 = 0x1122_3344_5566;

/// The settings last applied to a port.  A field is `None` until it has been
/// pushed to the SDE.  An admin state of `Unknown` means that the port could
/// not be configured, and must be added from scratch on the next push.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PortConfig {
    admin_state: AdminState,
    speed_bps: Option<u64>,
    mtu: Option<i32>,
    autoneg: Option<TriState>,
    fec_mode: Option<FecMode>,
    loopback_mode: Option<LoopbackState>,
    shaping: Option<PortShapingConfig>,
}

impl PortConfig {
    /// Rebuild the singleton port this config was applied from.
    fn as_singleton_port(&self, port: &SingletonPort) -> SingletonPort {
        SingletonPort {
            speed_bps: self.speed_bps.unwrap_or_default(),
            config_params: PortConfigParams {
                admin_state: self.admin_state,
                fec_mode: self.fec_mode.unwrap_or_default(),
                autoneg: self.autoneg.unwrap_or_default(),
                loopback_mode: self.loopback_mode.unwrap_or_default(),
                mtu: self.mtu.unwrap_or_default(),
            },
            ..port.clone()
        }
    }
}

#[derive(Debug, Default)]
struct ChassisState {
    initialized: bool,
    node_id_to_unit: BTreeMap<u64, DeviceId>,
    unit_to_node_id: BTreeMap<DeviceId, u64>,
    // All of the per-port maps are keyed by node id, then port id.
    port_state: BTreeMap<u64, BTreeMap<u32, PortState>>,
    port_time_last_changed: BTreeMap<u64, BTreeMap<u32, DateTime<Utc>>>,
    port_config: BTreeMap<u64, BTreeMap<u32, PortConfig>>,
    port_key: BTreeMap<u64, BTreeMap<u32, PortKey>>,
    tofino_config: Option<TofinoConfig>,
}

impl ChassisState {
    fn unit(&self, node_id: u64) -> StratumResult<DeviceId> {
        self.node_id_to_unit.get(&node_id).copied().ok_or_else(|| {
            StratumError::InvalidParam(format!("Unknown node {node_id}."))
        })
    }

    fn port_config(
        &self,
        node_id: u64,
        port_id: u32,
    ) -> StratumResult<&PortConfig> {
        self.port_config
            .get(&node_id)
            .and_then(|p| p.get(&port_id))
            .ok_or_else(|| not_configured(node_id, port_id))
    }
}

fn not_configured(node_id: u64, port_id: u32) -> StratumError {
    StratumError::InvalidParam(format!(
        "Port {port_id} is not configured or not known for node {node_id}."
    ))
}

type GnmiWriters = BTreeMap<Uuid, Arc<dyn Writer<GnmiEvent>>>;

pub struct ChassisManager {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    phal: Arc<dyn PhalInterface>,
    ports: Arc<PortMapper>,
    state: Arc<RwLock<ChassisState>>,
    gnmi_writers: Arc<RwLock<GnmiWriters>>,
    event_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChassisManager {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        phal: Arc<dyn PhalInterface>,
        ports: Arc<PortMapper>,
    ) -> Self {
        ChassisManager {
            log: log.new(o!("unit" => "chassis")),
            sde,
            phal,
            ports,
            state: Arc::new(RwLock::new(ChassisState::default())),
            gnmi_writers: Arc::new(RwLock::new(BTreeMap::new())),
            event_thread: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Bring the SDE's ports in line with `config`.
    ///
    /// The config is verified first, and nothing is changed if it is
    /// rejected.  Once ports start being configured, a failure on one port
    /// doesn't stop the others; every failure is reported in the result.  A
    /// port that failed is remembered as such, and is rebuilt from scratch
    /// on the next push.
    pub fn push_chassis_config(
        &self,
        config: &ChassisConfig,
    ) -> StratumResult<()> {
        let handles = self.resolve_chassis_config(config)?;
        if !self.is_initialized() {
            self.register_event_writers()?;
        }

        let mut state = self.state.write();
        let mut next = ChassisState {
            initialized: true,
            tofino_config: config.tofino_config().cloned(),
            ..Default::default()
        };
        let mut mappings: BTreeMap<DeviceId, PortMapping> = BTreeMap::new();
        for (unit, node) in config.nodes.iter().enumerate() {
            let unit = unit as DeviceId;
            next.node_id_to_unit.insert(node.id, unit);
            next.unit_to_node_id.insert(unit, node.id);
            mappings.insert(unit, PortMapping::new());
        }

        let mut resolved = Vec::with_capacity(config.singleton_ports.len());
        for port in &config.singleton_ports {
            let unit = next.unit(port.node)?;
            let key = port.port_key();
            let sdk_port = handles
                .get(&(port.node, port.id))
                .copied()
                .ok_or_else(|| not_configured(port.node, port.id))?;
            mappings.entry(unit).or_default().insert(port.id, sdk_port)?;
            next.port_key.entry(port.node).or_default().insert(port.id, key);
            next.port_state
                .entry(port.node)
                .or_default()
                .insert(port.id, PortState::Unknown);
            next.port_time_last_changed
                .entry(port.node)
                .or_default()
                .insert(port.id, DateTime::<Utc>::UNIX_EPOCH);
            resolved.push((port, unit, sdk_port));
        }

        let mut errors = ErrorAccumulator::new();
        for (port, unit, sdk_port) in resolved {
            let shaping = port_shaping(config.tofino_config(), port);
            let mut applied = PortConfig::default();
            let result = match state.port_config(port.node, port.id) {
                Err(_) => self.add_port_helper(
                    unit,
                    sdk_port,
                    port,
                    shaping,
                    &mut applied,
                ),
                Ok(old) if old.admin_state == AdminState::Unknown => {
                    // The last attempt to configure this port failed part
                    // way through.  Start over.
                    if self.sde.is_valid_port(unit, sdk_port) {
                        errors.push(sde_call!(
                            self.sde.delete_port(unit, sdk_port)
                        ));
                    }
                    self.add_port_helper(
                        unit,
                        sdk_port,
                        port,
                        shaping,
                        &mut applied,
                    )
                }
                Ok(old) => {
                    let old = old.clone();
                    self.update_port_helper(
                        unit,
                        sdk_port,
                        port,
                        shaping,
                        &old,
                        &mut applied,
                    )
                }
            };
            if let Err(e) = &result {
                error!(self.log, "failed to configure port";
                    "port_id" => port.id,
                    "node_id" => port.node,
                    "error" => %e);
                applied.admin_state = AdminState::Unknown;
            }
            errors.push(result);
            next.port_config
                .entry(port.node)
                .or_default()
                .insert(port.id, applied);
        }

        // Delete the ports that are no longer in the config.
        for (node_id, ports) in &state.port_config {
            let Some(unit) = state.node_id_to_unit.get(node_id).copied() else {
                continue;
            };
            for port_id in ports.keys() {
                if next
                    .port_config
                    .get(node_id)
                    .is_some_and(|p| p.contains_key(port_id))
                {
                    continue;
                }
                let sdk_port = match self.ports.to_sdk_port(unit, *port_id) {
                    Ok(p) => p,
                    Err(e) => {
                        errors.push::<()>(Err(e));
                        continue;
                    }
                };
                if self.sde.is_valid_port(unit, sdk_port) {
                    info!(self.log, "deleting port";
                        "port_id" => port_id,
                        "node_id" => node_id,
                        "sdk_port" => sdk_port);
                    errors.push(sde_call!(self.sde.delete_port(unit, sdk_port)));
                }
            }
        }

        if let Some(tofino) = config.tofino_config() {
            for node_id in tofino.node_id_to_deflect_on_drop_configs.keys() {
                errors.push(self.apply_deflect_on_drop(
                    &next,
                    &mappings,
                    *node_id,
                ));
            }
        }

        self.ports.clear();
        for (unit, mapping) in mappings {
            self.ports.install(unit, mapping);
        }
        *state = next;
        info!(self.log, "chassis config pushed";
            "nodes" => config.nodes.len(),
            "ports" => config.singleton_ports.len());
        errors.into_result()
    }

    /// Check `config` without applying any of it.
    pub fn verify_chassis_config(
        &self,
        config: &ChassisConfig,
    ) -> StratumResult<()> {
        self.resolve_chassis_config(config).map(|_| ())
    }

    /// Verify `config`, returning the SDK port of every singleton port
    /// keyed by node id and port id.  Each port key is looked up in the SDE
    /// exactly once.
    fn resolve_chassis_config(
        &self,
        config: &ChassisConfig,
    ) -> StratumResult<BTreeMap<(u64, u32), SdkPort>> {
        if !config.trunk_ports.is_empty() {
            return Err(StratumError::Unimplemented(
                "Trunk ports are not supported on Tofino.".to_string(),
            ));
        }
        if !config.port_groups.is_empty() {
            return Err(StratumError::Unimplemented(
                "Port groups are not supported on Tofino.".to_string(),
            ));
        }
        if config.nodes.is_empty() {
            return Err(StratumError::InvalidParam(
                "The config must contain at least one node.".to_string(),
            ));
        }
        match config.chassis.as_ref().map(|c| c.platform) {
            Some(Platform::GenericBarefootTofino)
            | Some(Platform::GenericBarefootTofino2) => {}
            p => {
                return Err(StratumError::InvalidParam(format!(
                    "Unsupported platform: {}",
                    p.unwrap_or_default()
                )))
            }
        }

        let mut node_id_to_unit = BTreeMap::new();
        for (unit, node) in config.nodes.iter().enumerate() {
            if node.id == 0 {
                return Err(StratumError::InvalidParam(
                    "Invalid node id 0 in the config.".to_string(),
                ));
            }
            if node.slot <= 0 {
                return Err(StratumError::InvalidParam(format!(
                    "Invalid slot {} for node {}.",
                    node.slot, node.id
                )));
            }
            if node_id_to_unit.insert(node.id, unit as DeviceId).is_some() {
                return Err(StratumError::InvalidParam(format!(
                    "The node id {} was already recorded.",
                    node.id
                )));
            }
        }

        let mut port_ids: BTreeSet<(u64, u32)> = BTreeSet::new();
        let mut port_keys: BTreeSet<PortKey> = BTreeSet::new();
        let mut new_port_keys: BTreeMap<(u64, u32), PortKey> = BTreeMap::new();
        let mut handles = BTreeMap::new();
        for port in &config.singleton_ports {
            let id = port.id;
            if id == CPU_PORT_ID {
                return Err(StratumError::InvalidParam(format!(
                    "SingletonPort {id} has the reserved CPU port id."
                )));
            }
            if id == 0 {
                return Err(StratumError::InvalidParam(
                    "Invalid singleton port id 0.".to_string(),
                ));
            }
            if port.slot <= 0 || port.port <= 0 {
                return Err(StratumError::InvalidParam(format!(
                    "Invalid location {} for SingletonPort {id}.",
                    port.port_key()
                )));
            }
            if port.speed_bps == 0 {
                return Err(StratumError::InvalidParam(format!(
                    "No speed given for SingletonPort {id}."
                )));
            }
            let Some(unit) = node_id_to_unit.get(&port.node).copied() else {
                return Err(StratumError::InvalidParam(format!(
                    "Invalid ChassisConfig, unknown node id {} for port {id}.",
                    port.node
                )));
            };
            if !port_ids.insert((port.node, id)) {
                return Err(StratumError::InvalidParam(format!(
                    "The id of SingletonPort {id} was already recorded for \
                     node {}.",
                    port.node
                )));
            }
            let key = port.port_key();
            if !port_keys.insert(key) {
                return Err(StratumError::InvalidParam(format!(
                    "The location {key} of SingletonPort {id} was already \
                     recorded."
                )));
            }
            let sdk_port =
                PortMapper::register_port(self.sde.as_ref(), unit, &key)?;
            handles.insert((port.node, id), sdk_port);
            new_port_keys.insert((port.node, id), key);
        }

        let state = self.state.read();
        if state.initialized {
            if state.node_id_to_unit != node_id_to_unit {
                return Err(StratumError::RebootRequired(
                    "The mapping from node id to unit has changed."
                        .to_string(),
                ));
            }
            for (node_id, keys) in &state.port_key {
                for (port_id, key) in keys {
                    match new_port_keys.get(&(*node_id, *port_id)) {
                        Some(new_key) if new_key != key => {
                            return Err(StratumError::RebootRequired(format!(
                                "Port {port_id} in node {node_id} moved from \
                                 {key} to {new_key}."
                            )))
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(handles)
    }

    fn apply_port_shaping(
        &self,
        unit: DeviceId,
        sdk_port: SdkPort,
        shaping: &PortShapingConfig,
    ) -> StratumResult<()> {
        let (in_pps, burst, rate) = match *shaping {
            PortShapingConfig::PacketShaping {
                max_rate_pps,
                max_burst_packets,
            } => (true, max_burst_packets, max_rate_pps),
            PortShapingConfig::ByteShaping {
                max_rate_bps,
                max_burst_bytes,
            } => (false, max_burst_bytes, max_rate_bps),
        };
        sde_call!(self
            .sde
            .set_port_shaping_rate(unit, sdk_port, in_pps, burst, rate))?;
        sde_call!(self.sde.enable_port_shaping(unit, sdk_port, TriState::True))
    }

    /// Add a port that the SDE doesn't have yet.  `applied` records each
    /// setting as it reaches the SDE.
    fn add_port_helper(
        &self,
        unit: DeviceId,
        sdk_port: SdkPort,
        port: &SingletonPort,
        shaping: Option<PortShapingConfig>,
        applied: &mut PortConfig,
    ) -> StratumResult<()> {
        let params = &port.config_params;
        match params.admin_state {
            AdminState::Unknown => {
                return Err(StratumError::InvalidParam(format!(
                    "Invalid admin state for port {} in node {} (SDK port \
                     {sdk_port}).",
                    port.id, port.node
                )))
            }
            AdminState::Diag => {
                return Err(StratumError::Unimplemented(format!(
                    "Unsupported 'diags' admin state for port {} in node {} \
                     (SDK port {sdk_port}).",
                    port.id, port.node
                )))
            }
            _ => {}
        }

        info!(self.log, "adding port";
            "port_id" => port.id,
            "node_id" => port.node,
            "sdk_port" => sdk_port,
            "speed_bps" => port.speed_bps,
            "fec_mode" => %params.fec_mode);
        sde_call!(self.sde.add_port(
            unit,
            sdk_port,
            port.speed_bps,
            params.fec_mode
        ))?;
        applied.speed_bps = Some(port.speed_bps);
        applied.admin_state = AdminState::Disabled;
        applied.fec_mode = Some(params.fec_mode);

        if params.mtu != 0 {
            sde_call!(self.sde.set_port_mtu(unit, sdk_port, params.mtu))?;
            applied.mtu = Some(params.mtu);
        }
        if params.autoneg != TriState::Unknown {
            sde_call!(self.sde.set_port_autoneg_policy(
                unit,
                sdk_port,
                params.autoneg
            ))?;
            applied.autoneg = Some(params.autoneg);
        }
        if params.loopback_mode != LoopbackState::Unknown {
            sde_call!(self.sde.set_port_loopback_mode(
                unit,
                sdk_port,
                params.loopback_mode
            ))?;
            applied.loopback_mode = Some(params.loopback_mode);
        }
        if let Some(shaping) = shaping {
            self.apply_port_shaping(unit, sdk_port, &shaping)?;
            applied.shaping = Some(shaping);
        }

        if params.admin_state == AdminState::Enabled {
            info!(self.log, "enabling port";
                "port_id" => port.id,
                "node_id" => port.node,
                "sdk_port" => sdk_port);
            sde_call!(self.sde.enable_port(unit, sdk_port))?;
            applied.admin_state = AdminState::Enabled;
        }
        Ok(())
    }

    /// Reconfigure a port the SDE already has, changing only what differs
    /// from `old`.
    fn update_port_helper(
        &self,
        unit: DeviceId,
        sdk_port: SdkPort,
        port: &SingletonPort,
        shaping: Option<PortShapingConfig>,
        old: &PortConfig,
        applied: &mut PortConfig,
    ) -> StratumResult<()> {
        *applied = old.clone();
        if !self.sde.is_valid_port(unit, sdk_port) {
            return Err(StratumError::Internal(format!(
                "Port {} in node {} is not valid (SDK port {sdk_port}).",
                port.id, port.node
            )));
        }
        let params = &port.config_params;

        if old.speed_bps != Some(port.speed_bps) {
            info!(self.log, "changing port speed";
                "port_id" => port.id,
                "node_id" => port.node,
                "speed_bps" => port.speed_bps);
            sde_call!(self.sde.disable_port(unit, sdk_port))?;
            sde_call!(self.sde.delete_port(unit, sdk_port))?;
            let mut readded = PortConfig::default();
            match self.add_port_helper(
                unit,
                sdk_port,
                port,
                shaping,
                &mut readded,
            ) {
                Ok(()) => {
                    *applied = readded;
                    return Ok(());
                }
                Err(e) => {
                    error!(self.log, "failed to add port with new speed, \
                        restoring the old config";
                        "port_id" => port.id,
                        "node_id" => port.node,
                        "error" => %e);
                    if self.sde.is_valid_port(unit, sdk_port) {
                        if let Err(e) = self.sde.delete_port(unit, sdk_port) {
                            warn!(self.log, "failed to delete port";
                                "port_id" => port.id,
                                "sdk_port" => sdk_port,
                                "error" => %e);
                        }
                    }
                    let previous = old.as_singleton_port(port);
                    let mut restored = PortConfig::default();
                    if let Err(e) = self.add_port_helper(
                        unit,
                        sdk_port,
                        &previous,
                        old.shaping,
                        &mut restored,
                    ) {
                        error!(self.log, "failed to restore port";
                            "port_id" => port.id,
                            "error" => %e);
                    }
                    *applied = restored;
                    return Err(StratumError::InvalidParam(format!(
                        "Could not add port {} with new speed {} to node \
                         {}: {e}",
                        port.id, port.speed_bps, port.node
                    )));
                }
            }
        }

        if old.fec_mode != Some(params.fec_mode) {
            return Err(StratumError::Unimplemented(format!(
                "The FEC mode for port {} in node {} has changed; you need to \
                 delete the port and add it again.",
                port.id, port.node
            )));
        }
        match params.admin_state {
            AdminState::Unknown => {
                return Err(StratumError::InvalidParam(format!(
                    "Invalid admin state for port {} in node {} (SDK port \
                     {sdk_port}).",
                    port.id, port.node
                )))
            }
            AdminState::Diag => {
                return Err(StratumError::Unimplemented(format!(
                    "Unsupported 'diags' admin state for port {} in node {} \
                     (SDK port {sdk_port}).",
                    port.id, port.node
                )))
            }
            _ => {}
        }

        // An mtu of 0 or an unknown autoneg policy leaves the port's
        // current setting alone.
        let mut config_changed = false;
        if params.mtu != 0 && old.mtu != Some(params.mtu) {
            sde_call!(self.sde.set_port_mtu(unit, sdk_port, params.mtu))?;
            applied.mtu = Some(params.mtu);
            config_changed = true;
        }
        if params.autoneg != TriState::Unknown
            && old.autoneg != Some(params.autoneg)
        {
            sde_call!(self.sde.set_port_autoneg_policy(
                unit,
                sdk_port,
                params.autoneg
            ))?;
            applied.autoneg = Some(params.autoneg);
            config_changed = true;
        }
        if params.loopback_mode != LoopbackState::Unknown
            && old.loopback_mode != Some(params.loopback_mode)
        {
            sde_call!(self.sde.set_port_loopback_mode(
                unit,
                sdk_port,
                params.loopback_mode
            ))?;
            applied.loopback_mode = Some(params.loopback_mode);
            config_changed = true;
        }
        if old.shaping != shaping {
            match &shaping {
                Some(s) => self.apply_port_shaping(unit, sdk_port, s)?,
                None => sde_call!(self.sde.enable_port_shaping(
                    unit,
                    sdk_port,
                    TriState::False
                ))?,
            }
            applied.shaping = shaping;
            config_changed = true;
        }

        let (need_disable, need_enable) = match params.admin_state {
            AdminState::Disabled => {
                (old.admin_state != AdminState::Disabled, false)
            }
            AdminState::Enabled => {
                let disable =
                    config_changed && old.admin_state != AdminState::Disabled;
                (disable, disable || old.admin_state == AdminState::Disabled)
            }
            _ => (false, false),
        };
        if need_disable {
            info!(self.log, "disabling port";
                "port_id" => port.id,
                "node_id" => port.node,
                "sdk_port" => sdk_port);
            sde_call!(self.sde.disable_port(unit, sdk_port))?;
            applied.admin_state = AdminState::Disabled;
        }
        if need_enable {
            info!(self.log, "enabling port";
                "port_id" => port.id,
                "node_id" => port.node,
                "sdk_port" => sdk_port);
            sde_call!(self.sde.enable_port(unit, sdk_port))?;
            applied.admin_state = AdminState::Enabled;
        }
        Ok(())
    }

    fn apply_deflect_on_drop(
        &self,
        state: &ChassisState,
        mappings: &BTreeMap<DeviceId, PortMapping>,
        node_id: u64,
    ) -> StratumResult<()> {
        let Some(config) = state
            .tofino_config
            .as_ref()
            .and_then(|t| t.node_id_to_deflect_on_drop_configs.get(&node_id))
        else {
            return Ok(());
        };
        let unit = state.unit(node_id)?;
        let mut errors = ErrorAccumulator::new();
        for target in &config.drop_targets {
            let sdk_port = match target.target {
                DropTargetPort::Port(port_id) => {
                    match mappings.get(&unit).map(|m| m.to_sdk_port(port_id)) {
                        Some(Ok(p)) => p,
                        _ => {
                            errors.push::<()>(Err(not_configured(
                                node_id, port_id,
                            )));
                            continue;
                        }
                    }
                }
                DropTargetPort::SdkPort(p) => {
                    if !self.sde.is_valid_port(unit, p) {
                        errors.push::<()>(Err(StratumError::InvalidParam(
                            format!(
                                "Invalid deflect-on-drop SDK port {p} on \
                                 node {node_id}."
                            ),
                        )));
                        continue;
                    }
                    p
                }
            };
            info!(self.log, "setting deflect-on-drop destination";
                "node_id" => node_id,
                "sdk_port" => sdk_port,
                "queue" => target.queue);
            errors.push(sde_call!(self.sde.set_deflect_on_drop_destination(
                unit,
                sdk_port,
                target.queue
            )));
        }
        errors.into_result()
    }

    /// Re-apply the configuration of every port on `node_id`, as though the
    /// ports were new.  This is used after the SDE has been restarted, when
    /// the state of the hardware is unknown.  MTU and autoneg are always
    /// re-applied.
    pub fn replay_ports_config(&self, node_id: u64) -> StratumResult<()> {
        let mut state = self.state.write();
        if !state.initialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        let unit = state.unit(node_id)?;
        if let Some(states) = state.port_state.get_mut(&node_id) {
            states.values_mut().for_each(|s| *s = PortState::Unknown);
        }
        if let Some(times) = state.port_time_last_changed.get_mut(&node_id) {
            times
                .values_mut()
                .for_each(|t| *t = DateTime::<Utc>::UNIX_EPOCH);
        }

        let mut errors = ErrorAccumulator::new();
        let configs = state.port_config.remove(&node_id).unwrap_or_default();
        let mut replayed = BTreeMap::new();
        for (port_id, config) in configs {
            let mut applied = PortConfig::default();
            errors.push(self.replay_port(
                unit,
                node_id,
                port_id,
                &config,
                &mut applied,
            ));
            replayed.insert(port_id, applied);
        }
        // What was re-applied is what the SDE now has.
        state.port_config.insert(node_id, replayed);

        let mappings: BTreeMap<DeviceId, PortMapping> = self
            .ports
            .mapping(unit)
            .map(|m| (unit, (*m).clone()))
            .into_iter()
            .collect();
        errors.push(self.apply_deflect_on_drop(&state, &mappings, node_id));
        errors.into_result()
    }

    /// Rebuild one port from its cached config.  `applied` records each
    /// setting as it reaches the SDE.
    fn replay_port(
        &self,
        unit: DeviceId,
        node_id: u64,
        port_id: u32,
        config: &PortConfig,
        applied: &mut PortConfig,
    ) -> StratumResult<()> {
        if config.admin_state == AdminState::Unknown {
            warn!(self.log, "not replaying port with unknown admin state";
                "port_id" => port_id,
                "node_id" => node_id);
            return Ok(());
        }
        let sdk_port = self.ports.to_sdk_port(unit, port_id)?;
        let (Some(speed), Some(fec)) = (config.speed_bps, config.fec_mode)
        else {
            return Err(StratumError::Internal(format!(
                "Port {port_id} in node {node_id} has no speed or FEC mode \
                 recorded."
            )));
        };
        info!(self.log, "replaying port";
            "port_id" => port_id,
            "node_id" => node_id,
            "sdk_port" => sdk_port);
        sde_call!(self.sde.add_port(unit, sdk_port, speed, fec))?;
        applied.speed_bps = Some(speed);
        applied.admin_state = AdminState::Disabled;
        applied.fec_mode = Some(fec);

        if let Some(mtu) = config.mtu {
            sde_call!(self.sde.set_port_mtu(unit, sdk_port, mtu))?;
            applied.mtu = Some(mtu);
        }
        if let Some(autoneg) = config.autoneg {
            sde_call!(self
                .sde
                .set_port_autoneg_policy(unit, sdk_port, autoneg))?;
            applied.autoneg = Some(autoneg);
        }
        if let Some(mode) = config.loopback_mode {
            sde_call!(self.sde.set_port_loopback_mode(unit, sdk_port, mode))?;
            applied.loopback_mode = Some(mode);
        }
        if let Some(shaping) = &config.shaping {
            self.apply_port_shaping(unit, sdk_port, shaping)?;
            applied.shaping = Some(*shaping);
        }
        if config.admin_state == AdminState::Enabled {
            sde_call!(self.sde.enable_port(unit, sdk_port))?;
            applied.admin_state = AdminState::Enabled;
        }
        Ok(())
    }

    /// Answer a single gNMI-style query about a port.
    pub fn get_port_data(
        &self,
        request: &PortDataRequest,
    ) -> StratumResult<PortDataResponse> {
        if !self.is_initialized() {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        let config = |node_id, port_id| {
            self.state.read().port_config(node_id, port_id).cloned()
        };
        let response = match *request {
            PortDataRequest::OperStatus { node_id, port_id } => {
                PortDataResponse::OperStatus {
                    state: self.get_port_state(node_id, port_id)?,
                    time_last_changed: self
                        .get_port_time_last_changed(node_id, port_id)?,
                }
            }
            PortDataRequest::AdminStatus { node_id, port_id } => {
                PortDataResponse::AdminStatus(
                    config(node_id, port_id)?.admin_state,
                )
            }
            PortDataRequest::MacAddress { node_id, port_id } => {
                config(node_id, port_id)?;
                PortDataResponse::MacAddress(DUMMY_MAC_ADDRESS)
            }
            PortDataRequest::PortSpeed { node_id, port_id } => {
                PortDataResponse::PortSpeed(config(node_id, port_id)?.speed_bps)
            }
            PortDataRequest::NegotiatedPortSpeed { node_id, port_id } => {
                let speed = config(node_id, port_id)?.speed_bps;
                match self.get_port_state(node_id, port_id)? {
                    PortState::Up => PortDataResponse::NegotiatedPortSpeed(speed),
                    _ => PortDataResponse::NegotiatedPortSpeed(None),
                }
            }
            PortDataRequest::LacpRouterMac { node_id, port_id } => {
                config(node_id, port_id)?;
                PortDataResponse::LacpRouterMac(DUMMY_MAC_ADDRESS)
            }
            PortDataRequest::PortCounters { node_id, port_id } => {
                PortDataResponse::PortCounters(
                    self.get_port_counters(node_id, port_id)?,
                )
            }
            PortDataRequest::AutonegStatus { node_id, port_id } => {
                PortDataResponse::AutonegStatus(
                    config(node_id, port_id)?.autoneg,
                )
            }
            PortDataRequest::FrontPanelPortInfo { node_id, port_id } => {
                let key = self.port_key(node_id, port_id)?;
                PortDataResponse::FrontPanelPortInfo(
                    self.phal.get_front_panel_port_info(key.slot, key.port)?,
                )
            }
            PortDataRequest::FecStatus { node_id, port_id } => {
                PortDataResponse::FecStatus(config(node_id, port_id)?.fec_mode)
            }
            PortDataRequest::LoopbackStatus { node_id, port_id } => {
                PortDataResponse::LoopbackStatus(
                    config(node_id, port_id)?.loopback_mode,
                )
            }
            PortDataRequest::SdnPortId { node_id, port_id } => {
                PortDataResponse::SdnPortId(
                    self.get_sdk_port_id(node_id, port_id)?,
                )
            }
            PortDataRequest::ForwardingViability { node_id, port_id } => {
                config(node_id, port_id)?;
                PortDataResponse::ForwardingViability(
                    ForwardingViability::Unknown,
                )
            }
            PortDataRequest::HealthIndicator { node_id, port_id } => {
                config(node_id, port_id)?;
                PortDataResponse::HealthIndicator(HealthState::Unknown)
            }
            PortDataRequest::LacpSystemPriority { .. }
            | PortDataRequest::PortQosCounters { .. } => {
                return Err(StratumError::Unimplemented(format!(
                    "DataRequest field {request:?} is not supported yet!"
                )))
            }
        };
        Ok(response)
    }

    fn port_key(&self, node_id: u64, port_id: u32) -> StratumResult<PortKey> {
        self.state
            .read()
            .port_key
            .get(&node_id)
            .and_then(|p| p.get(&port_id))
            .copied()
            .ok_or_else(|| not_configured(node_id, port_id))
    }

    /// The operational state of a port.  This is served from the cache
    /// unless no event has been seen for the port yet.
    pub fn get_port_state(
        &self,
        node_id: u64,
        port_id: u32,
    ) -> StratumResult<PortState> {
        let unit = {
            let state = self.state.read();
            let unit = state.unit(node_id)?;
            let cached = state
                .port_state
                .get(&node_id)
                .and_then(|p| p.get(&port_id))
                .copied()
                .ok_or_else(|| not_configured(node_id, port_id))?;
            if cached != PortState::Unknown {
                return Ok(cached);
            }
            unit
        };
        let sdk_port = self.ports.to_sdk_port(unit, port_id)?;
        sde_call!(self.sde.get_port_state(unit, sdk_port))
    }

    pub fn get_port_time_last_changed(
        &self,
        node_id: u64,
        port_id: u32,
    ) -> StratumResult<DateTime<Utc>> {
        self.state
            .read()
            .port_time_last_changed
            .get(&node_id)
            .and_then(|p| p.get(&port_id))
            .copied()
            .ok_or_else(|| not_configured(node_id, port_id))
    }

    pub fn get_port_counters(
        &self,
        node_id: u64,
        port_id: u32,
    ) -> StratumResult<PortCounters> {
        let unit = self.get_unit_from_node_id(node_id)?;
        let sdk_port = self.ports.to_sdk_port(unit, port_id)?;
        sde_call!(self.sde.get_port_counters(unit, sdk_port))
    }

    pub fn get_sdk_port_id(
        &self,
        node_id: u64,
        port_id: u32,
    ) -> StratumResult<SdkPort> {
        let unit = self.get_unit_from_node_id(node_id)?;
        self.port_key(node_id, port_id)?;
        self.ports.to_sdk_port(unit, port_id)
    }

    pub fn get_port_loopback_state(
        &self,
        node_id: u64,
        port_id: u32,
    ) -> StratumResult<LoopbackState> {
        let state = self.state.read();
        Ok(state
            .port_config(node_id, port_id)?
            .loopback_mode
            .unwrap_or_default())
    }

    pub fn get_node_id_to_unit_map(
        &self,
    ) -> StratumResult<BTreeMap<u64, DeviceId>> {
        let state = self.state.read();
        if !state.initialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        Ok(state.node_id_to_unit.clone())
    }

    pub fn get_unit_from_node_id(&self, node_id: u64) -> StratumResult<DeviceId> {
        let state = self.state.read();
        if !state.initialized {
            return Err(StratumError::NotInitialized(
                "Not initialized!".to_string(),
            ));
        }
        state.unit(node_id)
    }

    /// Add a writer for gNMI events.  The returned id is used to remove it.
    pub fn register_event_notify_writer(
        &self,
        writer: Arc<dyn Writer<GnmiEvent>>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.gnmi_writers.write().insert(id, writer);
        id
    }

    pub fn unregister_event_notify_writer(&self, id: Uuid) -> StratumResult<()> {
        match self.gnmi_writers.write().remove(&id) {
            Some(_) => Ok(()),
            None => Err(StratumError::NotFound(format!(
                "no gNMI event writer with id {id}"
            ))),
        }
    }

    /// Start listening to the SDE's port status events.
    fn register_event_writers(&self) -> StratumResult<()> {
        let mut thread = self.event_thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(PORT_STATUS_CHANNEL_DEPTH);
        sde_call!(self.sde.register_port_status_event_writer(tx))?;

        let log = self.log.new(o!("unit" => "port_status"));
        let state = self.state.clone();
        let ports = self.ports.clone();
        let writers = self.gnmi_writers.clone();
        let handle = thread::Builder::new()
            .name("port-status".to_string())
            .spawn(move || port_status_loop(log, rx, state, ports, writers))
            .map_err(|e| {
                StratumError::Internal(format!(
                    "failed to spawn port status thread: {e}"
                ))
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop listening to port status events.  Unregistering closes the
    /// channel, which ends the reader thread.
    fn unregister_event_writers(&self) -> StratumResult<()> {
        sde_call!(self.sde.unregister_port_status_event_writer())?;
        if let Some(handle) = self.event_thread.lock().take() {
            handle.join().map_err(|_| {
                StratumError::Internal(
                    "port status thread panicked".to_string(),
                )
            })?;
        }
        Ok(())
    }

    pub fn shutdown(&self) -> StratumResult<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        let mut errors = ErrorAccumulator::new();
        errors.push(self.unregister_event_writers());
        *self.state.write() = ChassisState::default();
        self.ports.clear();
        info!(self.log, "chassis manager shut down");
        errors.into_result()
    }
}

fn port_shaping(
    tofino: Option<&TofinoConfig>,
    port: &SingletonPort,
) -> Option<PortShapingConfig> {
    tofino
        .and_then(|t| t.node_id_to_port_shaping_config.get(&port.node))
        .and_then(|p| p.get(&port.id))
        .copied()
}

fn port_status_loop(
    log: slog::Logger,
    mut rx: mpsc::Receiver<PortStatusEvent>,
    state: Arc<RwLock<ChassisState>>,
    ports: Arc<PortMapper>,
    writers: Arc<RwLock<GnmiWriters>>,
) {
    while let Some(event) = rx.blocking_recv() {
        let (node_id, port_id) = {
            let mut state = state.write();
            let Some(node_id) =
                state.unit_to_node_id.get(&event.device).copied()
            else {
                debug!(log, "event for unknown device";
                    "device" => event.device);
                continue;
            };
            let Ok(port_id) = ports.to_singleton_port(event.device, event.port)
            else {
                debug!(log, "event for unknown SDK port";
                    "device" => event.device,
                    "sdk_port" => event.port);
                continue;
            };
            let Some(port_state) = state
                .port_state
                .get_mut(&node_id)
                .and_then(|p| p.get_mut(&port_id))
            else {
                debug!(log, "event for unconfigured port";
                    "node_id" => node_id,
                    "port_id" => port_id);
                continue;
            };
            *port_state = event.state;
            state
                .port_time_last_changed
                .entry(node_id)
                .or_default()
                .insert(port_id, event.time_last_changed);
            (node_id, port_id)
        };
        info!(log, "port state changed";
            "node_id" => node_id,
            "port_id" => port_id,
            "state" => %event.state);

        for writer in writers.read().values() {
            let event = GnmiEvent::PortOperStateChanged {
                node_id,
                port_id,
                new_state: event.state,
                time_last_changed: event.time_last_changed,
            };
            if !writer.write(event) {
                debug!(log, "gNMI writer went away");
            }
        }
    }
    info!(log, "port status channel closed");
}
