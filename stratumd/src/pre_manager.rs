// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The packet replication engine: multicast groups and clone sessions.
//!
//! A multicast group is backed by SDE nodes, one per replica instance, each
//! listing the egress ports copies are sent to.  Nodes are always created
//! before the group that refers to them and deleted after it, so a group
//! never refers to a node that doesn't exist.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use slog::debug;
use slog::o;
use slog::warn;

use crate::types::sde_call;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::write_entities;
use crate::writer::Writer;
use aal::CloneSession;
use aal::DeviceId;
use aal::SdeInterface;
use aal::SdkPort;
use aal::SessionHandle;
use common::p4info::P4Info;
use common::p4rt::CloneSessionEntry;
use common::p4rt::Entity;
use common::p4rt::MulticastGroupEntry;
use common::p4rt::PacketReplicationEngineEntry;
use common::p4rt::ReadResponse;
use common::p4rt::Replica;
use common::p4rt::UpdateType;

/// The highest clone session id the hardware supports.
pub const MAX_CLONE_SESSION_ID: u32 = 1015;

pub const MAX_MULTICAST_GROUP_ID: u32 = 0xFFFF;

const MAX_REPLICA_INSTANCE: u32 = 0xFFFF;

const MAX_PACKET_LENGTH: i32 = 0xFFFF;

const MAX_CLASS_OF_SERVICE: u32 = 8;

fn invalid(msg: &str) -> StratumError {
    StratumError::InvalidParam(msg.to_string())
}

/// The egress ports of each replica instance.
fn ports_by_instance(
    entry: &MulticastGroupEntry,
) -> StratumResult<BTreeMap<u32, Vec<SdkPort>>> {
    let mut instances: BTreeMap<u32, Vec<SdkPort>> = BTreeMap::new();
    for replica in &entry.replicas {
        if replica.instance > MAX_REPLICA_INSTANCE {
            return Err(StratumError::InvalidParam(format!(
                "Replica instance {} of multicast group {} doesn't fit in 16 \
                 bits.",
                replica.instance, entry.multicast_group_id
            )));
        }
        let ports = instances.entry(replica.instance).or_default();
        if !ports.contains(&replica.egress_port) {
            ports.push(replica.egress_port);
        }
    }
    Ok(instances)
}

fn check_group_id(group_id: u32) -> StratumResult<()> {
    match group_id {
        0 => Err(invalid("Multicast group id 0 is reserved.")),
        id if id > MAX_MULTICAST_GROUP_ID => Err(StratumError::InvalidParam(
            format!("Multicast group id {id} exceeds maximum value."),
        )),
        _ => Ok(()),
    }
}

fn check_session_id(session_id: u32) -> StratumResult<()> {
    match session_id == 0 || session_id > MAX_CLONE_SESSION_ID {
        true => Err(invalid("Invalid session id")),
        false => Ok(()),
    }
}

/// Validate a clone session and convert it to its SDE form.
fn sde_clone_session(
    entry: &CloneSessionEntry,
    update_type: UpdateType,
) -> StratumResult<CloneSession> {
    check_session_id(entry.session_id)?;
    if entry.packet_length_bytes > MAX_PACKET_LENGTH {
        return Err(invalid("Packet length exceeds maximum value"));
    }
    let max_pkt_len = u32::try_from(entry.packet_length_bytes)
        .map_err(|_| invalid("Invalid packet length"))?;
    let replica = match entry.replicas.as_slice() {
        [replica] => replica,
        [] => return Err(invalid("Clone session has no replica")),
        _ => return Err(invalid("Multiple replicas are not supported")),
    };
    if update_type == UpdateType::Insert
        && entry.class_of_service >= MAX_CLASS_OF_SERVICE
    {
        return Err(invalid("Class of service must be smaller than 8"));
    }
    if replica.egress_port == 0 {
        return Err(invalid("Invalid egress port"));
    }
    if replica.instance != 0 {
        return Err(invalid("Instances on Replicas are not supported"));
    }
    Ok(CloneSession {
        session_id: entry.session_id,
        egress_port: replica.egress_port,
        cos: entry.class_of_service,
        max_pkt_len,
    })
}

pub struct PreManager {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    // Set once a pipeline has been pushed.
    ready: RwLock<bool>,
}

impl PreManager {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        device: DeviceId,
    ) -> Self {
        PreManager {
            log: log.new(o!("unit" => "pre_manager")),
            sde,
            device,
            ready: RwLock::new(false),
        }
    }

    /// The replication engine has no P4Info-derived state; installing the
    /// pipeline cleared whatever the device held before.
    pub fn push_forwarding_pipeline_config(
        &self,
        _p4info: &P4Info,
    ) -> StratumResult<()> {
        *self.ready.write() = true;
        Ok(())
    }

    fn check_ready(ready: bool) -> StratumResult<()> {
        match ready {
            true => Ok(()),
            false => Err(StratumError::NotInitialized(
                "No forwarding pipeline has been pushed.".to_string(),
            )),
        }
    }

    pub fn write_pre_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &PacketReplicationEngineEntry,
    ) -> StratumResult<()> {
        let ready = self.ready.write();
        Self::check_ready(*ready)?;
        match entry {
            PacketReplicationEngineEntry::MulticastGroupEntry(group) => {
                self.write_multicast_group(session, update_type, group)
            }
            PacketReplicationEngineEntry::CloneSessionEntry(clone) => {
                self.write_clone_session(session, update_type, clone)
            }
        }
    }

    pub fn read_pre_entry(
        &self,
        session: &SessionHandle,
        entry: &PacketReplicationEngineEntry,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        let ready = self.ready.read();
        Self::check_ready(*ready)?;
        let entities = match entry {
            PacketReplicationEngineEntry::MulticastGroupEntry(group) => {
                self.read_multicast_groups(session, group.multicast_group_id)?
            }
            PacketReplicationEngineEntry::CloneSessionEntry(clone) => {
                self.read_clone_sessions(session, clone.session_id)?
            }
        };
        write_entities(writer, entities)
    }

    /// Create one node per replica instance.  If any creation fails, the
    /// nodes created so far are removed again.
    fn create_nodes(
        &self,
        session: &SessionHandle,
        entry: &MulticastGroupEntry,
    ) -> StratumResult<Vec<u32>> {
        let mut node_ids = Vec::new();
        for (instance, ports) in ports_by_instance(entry)? {
            match sde_call!(self.sde.create_multicast_node(
                self.device,
                session,
                instance,
                &[],
                &ports
            )) {
                Ok(id) => node_ids.push(id),
                Err(e) => {
                    self.discard_nodes(session, &node_ids);
                    return Err(e);
                }
            }
        }
        Ok(node_ids)
    }

    fn discard_nodes(&self, session: &SessionHandle, node_ids: &[u32]) {
        if node_ids.is_empty() {
            return;
        }
        if let Err(e) = sde_call!(self.sde.delete_multicast_nodes(
            self.device,
            session,
            node_ids
        )) {
            warn!(self.log, "failed to remove multicast nodes";
                "nodes" => ?node_ids,
                "error" => %e);
        }
    }

    fn write_multicast_group(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &MulticastGroupEntry,
    ) -> StratumResult<()> {
        let group_id = entry.multicast_group_id;
        check_group_id(group_id)?;
        match update_type {
            UpdateType::Insert => {
                let node_ids = self.create_nodes(session, entry)?;
                let result = sde_call!(self.sde.insert_multicast_group(
                    self.device,
                    session,
                    group_id,
                    &node_ids
                ));
                if result.is_err() {
                    self.discard_nodes(session, &node_ids);
                }
                result
            }
            UpdateType::Modify => {
                let old_ids = sde_call!(self.sde.get_nodes_in_multicast_group(
                    self.device,
                    session,
                    group_id
                ))?;
                let node_ids = self.create_nodes(session, entry)?;
                if let Err(e) = sde_call!(self.sde.modify_multicast_group(
                    self.device,
                    session,
                    group_id,
                    &node_ids
                )) {
                    self.discard_nodes(session, &node_ids);
                    return Err(e);
                }
                debug!(self.log, "modified multicast group";
                    "group_id" => group_id,
                    "old_nodes" => ?old_ids,
                    "new_nodes" => ?node_ids);
                sde_call!(self.sde.delete_multicast_nodes(
                    self.device,
                    session,
                    &old_ids
                ))
            }
            UpdateType::Delete => {
                let old_ids = sde_call!(self.sde.get_nodes_in_multicast_group(
                    self.device,
                    session,
                    group_id
                ))?;
                sde_call!(self.sde.delete_multicast_group(
                    self.device,
                    session,
                    group_id
                ))?;
                sde_call!(self.sde.delete_multicast_nodes(
                    self.device,
                    session,
                    &old_ids
                ))
            }
            UpdateType::Unspecified => Err(StratumError::Unimplemented(format!(
                "Unsupported update type {update_type} for multicast group \
                 {group_id}."
            ))),
        }
    }

    fn write_clone_session(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &CloneSessionEntry,
    ) -> StratumResult<()> {
        match update_type {
            UpdateType::Insert => {
                let clone = sde_clone_session(entry, update_type)?;
                sde_call!(self.sde.insert_clone_session(
                    self.device,
                    session,
                    &clone
                ))
            }
            UpdateType::Modify => {
                let clone = sde_clone_session(entry, update_type)?;
                sde_call!(self.sde.modify_clone_session(
                    self.device,
                    session,
                    &clone
                ))
            }
            UpdateType::Delete => {
                check_session_id(entry.session_id)?;
                sde_call!(self.sde.delete_clone_session(
                    self.device,
                    session,
                    entry.session_id
                ))
            }
            UpdateType::Unspecified => Err(StratumError::Unimplemented(format!(
                "Unsupported update type {update_type} for clone session {}.",
                entry.session_id
            ))),
        }
    }

    fn read_multicast_groups(
        &self,
        session: &SessionHandle,
        group_id: u32,
    ) -> StratumResult<Vec<Entity>> {
        let groups = sde_call!(self.sde.get_multicast_groups(
            self.device,
            session,
            group_id
        ))?;
        let mut entities = Vec::with_capacity(groups.len());
        for group in groups {
            let mut replicas = Vec::new();
            for node_id in &group.node_ids {
                let node = sde_call!(self.sde.get_multicast_node(
                    self.device,
                    session,
                    *node_id
                ))?;
                replicas.extend(node.ports.iter().map(|port| Replica {
                    egress_port: *port,
                    instance: node.replication_id,
                }));
            }
            replicas.sort_by_key(|r| (r.instance, r.egress_port));
            entities.push(Entity::PacketReplicationEngineEntry(
                PacketReplicationEngineEntry::MulticastGroupEntry(
                    MulticastGroupEntry {
                        multicast_group_id: group.group_id,
                        replicas,
                    },
                ),
            ));
        }
        Ok(entities)
    }

    fn read_clone_sessions(
        &self,
        session: &SessionHandle,
        session_id: u32,
    ) -> StratumResult<Vec<Entity>> {
        let sessions = sde_call!(self.sde.get_clone_sessions(
            self.device,
            session,
            session_id
        ))?;
        Ok(sessions
            .into_iter()
            .map(|c| {
                Entity::PacketReplicationEngineEntry(
                    PacketReplicationEngineEntry::CloneSessionEntry(
                        CloneSessionEntry {
                            session_id: c.session_id,
                            replicas: vec![Replica {
                                egress_port: c.egress_port,
                                instance: 0,
                            }],
                            class_of_service: c.cos,
                            packet_length_bytes: i32::try_from(c.max_pkt_len)
                                .unwrap_or(i32::MAX),
                        },
                    ),
                )
            })
            .collect())
    }
}
