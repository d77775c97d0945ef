// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use chrono::DateTime;
use chrono::Utc;

use common::chassis::PortState;

/// Identifies a single switching device managed by the SDK.
pub type DeviceId = i32;

/// The SDK's runtime-assigned handle for a port.  These are only meaningful
/// for the lifetime of the configuration that created them.
pub type SdkPort = u32;

/// When the SDK detects a change in a port's operational state, it sends a
/// PortStatusEvent to every registered writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortStatusEvent {
    pub device: DeviceId,
    pub port: SdkPort,
    pub state: PortState,
    pub time_last_changed: DateTime<Utc>,
}
