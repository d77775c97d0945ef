// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use chrono::Utc;
use slog::debug;
use slog::error;

use crate::tofino_stub::StubHandle;
use aal::AsicError;
use aal::AsicResult;
use aal::DeviceId;
use aal::PortStatusEvent;
use aal::SdkPort;
use common::chassis::FecMode;
use common::chassis::LoopbackState;
use common::chassis::PortCounters;
use common::chassis::PortKey;
use common::chassis::PortState;
use common::chassis::TriState;

// Mirroring a 32-port Tofino board, with each QSFP port split into at most 4
// channels.  Front panel ports are spread across the 4 pipes, 16 per pipe.
pub const QSFP_PORT_COUNT: i32 = 32;
pub const CHANNELS_PER_PORT: i32 = 4;
const PORTS_PER_PIPE: i32 = 16;

/// The PCIe CPU port of a Tofino: pipe 2, local port 64.
pub const PCIE_CPU_PORT: SdkPort = 320;

#[derive(Clone, Debug, Default)]
pub struct StubPort {
    pub speed_bps: u64,
    pub fec: FecMode,
    pub enabled: bool,
    pub autoneg: TriState,
    pub mtu: i32,
    pub loopback: LoopbackState,
    pub shaping: Option<(bool, u32, u64)>,
    pub shaping_enabled: TriState,
    pub state: PortState,
}

#[derive(Debug, Default)]
pub struct PortData {
    pub ports: BTreeMap<(DeviceId, SdkPort), StubPort>,
    pub deflect_on_drop: BTreeMap<DeviceId, (SdkPort, u32)>,
    pub tm_cpu_port: BTreeMap<DeviceId, SdkPort>,
}

fn no_port(device: DeviceId, port: SdkPort) -> AsicError {
    AsicError::InvalidArg(format!("no such port: {port} on device {device}"))
}

impl PortData {
    fn get_port(
        &self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<&StubPort> {
        self.ports
            .get(&(device, port))
            .ok_or_else(|| no_port(device, port))
    }

    fn get_port_mut(
        &mut self,
        device: DeviceId,
        port: SdkPort,
    ) -> AsicResult<&mut StubPort> {
        self.ports
            .get_mut(&(device, port))
            .ok_or_else(|| no_port(device, port))
    }
}

/// Map a front panel location to the device port the SDE would assign it.
pub fn port_from_key(key: &PortKey) -> AsicResult<SdkPort> {
    if key.slot < 1
        || key.port < 1
        || key.port > QSFP_PORT_COUNT
        || key.channel < 0
        || key.channel >= CHANNELS_PER_PORT
    {
        return Err(AsicError::Missing(format!("no port at {key}")));
    }
    let pipe = (key.port - 1) / PORTS_PER_PIPE;
    let local = ((key.port - 1) % PORTS_PER_PIPE) * CHANNELS_PER_PORT
        + key.channel;
    Ok(((pipe << 7) | local) as SdkPort)
}

pub fn add_port(
    hdl: &StubHandle,
    device: DeviceId,
    port: SdkPort,
    speed_bps: u64,
    fec: FecMode,
) -> AsicResult<()> {
    let mut data = hdl.ports.lock();
    if data.ports.contains_key(&(device, port)) {
        return Err(AsicError::Exists);
    }
    data.ports.insert(
        (device, port),
        StubPort {
            speed_bps,
            fec,
            state: PortState::Down,
            ..Default::default()
        },
    );
    Ok(())
}

pub fn delete_port(
    hdl: &StubHandle,
    device: DeviceId,
    port: SdkPort,
) -> AsicResult<()> {
    let mut data = hdl.ports.lock();
    match data.ports.remove(&(device, port)) {
        Some(_) => Ok(()),
        None => Err(no_port(device, port)),
    }
}

/// When a port is enabled in the stub, it automatically comes online.  Every
/// change in the operational state is reported to the registered writer, as
/// the SDE would on real hardware.
pub fn set_enable(
    hdl: &StubHandle,
    device: DeviceId,
    port: SdkPort,
    enabled: bool,
) -> AsicResult<()> {
    let state = match enabled {
        true => PortState::Up,
        false => PortState::Down,
    };
    {
        let mut data = hdl.ports.lock();
        let p = data.get_port_mut(device, port)?;
        p.enabled = enabled;
        if p.state == state {
            return Ok(());
        }
        p.state = state;
    }

    let tx = hdl.port_status_tx.lock();
    match tx.as_ref() {
        Some(tx) => {
            let event = PortStatusEvent {
                device,
                port,
                state,
                time_last_changed: Utc::now(),
            };
            if let Err(e) = tx.try_send(event) {
                error!(hdl.log, "failed to send port status event: {e:?}");
            }
        }
        None => debug!(hdl.log, "no port status writer registered"),
    }
    Ok(())
}

pub fn update<F>(
    hdl: &StubHandle,
    device: DeviceId,
    port: SdkPort,
    f: F,
) -> AsicResult<()>
where
    F: FnOnce(&mut StubPort),
{
    let mut data = hdl.ports.lock();
    f(data.get_port_mut(device, port)?);
    Ok(())
}

pub fn get_state(
    hdl: &StubHandle,
    device: DeviceId,
    port: SdkPort,
) -> AsicResult<PortState> {
    let data = hdl.ports.lock();
    Ok(data.get_port(device, port)?.state)
}

/// The stub doesn't move any traffic, so all counters read as zero.
pub fn get_counters(
    hdl: &StubHandle,
    device: DeviceId,
    port: SdkPort,
) -> AsicResult<PortCounters> {
    let data = hdl.ports.lock();
    data.get_port(device, port)?;
    Ok(PortCounters::default())
}

pub fn is_valid(hdl: &StubHandle, device: DeviceId, port: SdkPort) -> bool {
    hdl.ports.lock().ports.contains_key(&(device, port))
}
