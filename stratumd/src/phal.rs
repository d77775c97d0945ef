// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The platform side of the chassis: transceivers, fans and power supplies.
//! The chassis manager only needs to ask it about front panel ports.

use common::chassis::ChassisConfig;
use common::chassis::FrontPanelPortInfo;
use common::chassis::HwState;

use crate::types::StratumResult;

pub trait PhalInterface: Send + Sync {
    /// Apply the platform-specific parts of `config`.
    fn push_chassis_config(
        &self,
        _config: &ChassisConfig,
    ) -> StratumResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> StratumResult<()> {
        Ok(())
    }

    /// Describe whatever is plugged into the front panel port at
    /// (`slot`, `port`).
    fn get_front_panel_port_info(
        &self,
        slot: i32,
        port: i32,
    ) -> StratumResult<FrontPanelPortInfo>;
}

/// A platform with no manageable peripherals.
#[derive(Debug, Default)]
pub struct NullPhal;

impl PhalInterface for NullPhal {
    fn get_front_panel_port_info(
        &self,
        _slot: i32,
        _port: i32,
    ) -> StratumResult<FrontPanelPortInfo> {
        Ok(FrontPanelPortInfo {
            hw_state: HwState::Unknown,
            ..Default::default()
        })
    }
}
