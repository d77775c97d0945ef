// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Packet replication engine objects.

use crate::SdkPort;

/// A single replication point: one copy of the packet is made for every port
/// and LAG listed, tagged with `replication_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MulticastNode {
    pub replication_id: u32,
    pub lag_ids: Vec<u32>,
    pub ports: Vec<SdkPort>,
}

/// A multicast group and the nodes backing it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MulticastGroup {
    pub group_id: u32,
    pub node_ids: Vec<u32>,
}

/// A mirror session copying packets to a single egress port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloneSession {
    pub session_id: u32,
    pub egress_port: SdkPort,
    pub cos: u32,
    pub max_pkt_len: u32,
}
