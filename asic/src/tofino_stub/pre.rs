// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use aal::AsicError;
use aal::AsicResult;
use aal::CloneSession;
use aal::MulticastGroup;
use aal::MulticastNode;
use aal::SdkPort;

/// Replication state for a single device.  Groups refer to nodes by id, and
/// the stub refuses to let a group refer to a node that doesn't exist.
#[derive(Debug, Default)]
pub struct PreData {
    next_node_id: u32,
    nodes: BTreeMap<u32, MulticastNode>,
    groups: BTreeMap<u32, Vec<u32>>,
    clone_sessions: BTreeMap<u32, CloneSession>,
}

fn no_group(group_id: u32) -> AsicError {
    AsicError::Missing(format!("no such multicast group: {group_id}"))
}

impl PreData {
    pub fn node_create(
        &mut self,
        replication_id: u32,
        lag_ids: &[u32],
        ports: &[SdkPort],
    ) -> u32 {
        self.next_node_id += 1;
        let id = self.next_node_id;
        self.nodes.insert(
            id,
            MulticastNode {
                replication_id,
                lag_ids: lag_ids.to_vec(),
                ports: ports.to_vec(),
            },
        );
        id
    }

    pub fn node_get(&self, node_id: u32) -> AsicResult<MulticastNode> {
        self.nodes.get(&node_id).cloned().ok_or_else(|| {
            AsicError::Missing(format!("no such multicast node: {node_id}"))
        })
    }

    pub fn nodes_delete(&mut self, node_ids: &[u32]) -> AsicResult<()> {
        for id in node_ids {
            self.node_get(*id)?;
            if let Some((group, _)) =
                self.groups.iter().find(|(_, nodes)| nodes.contains(id))
            {
                return Err(AsicError::InvalidArg(format!(
                    "multicast node {id} is still used by group {group}"
                )));
            }
        }
        for id in node_ids {
            self.nodes.remove(id);
        }
        Ok(())
    }

    fn check_nodes(&self, node_ids: &[u32]) -> AsicResult<()> {
        for id in node_ids {
            self.node_get(*id)?;
        }
        Ok(())
    }

    pub fn group_nodes(&self, group_id: u32) -> AsicResult<Vec<u32>> {
        self.groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| no_group(group_id))
    }

    pub fn group_insert(
        &mut self,
        group_id: u32,
        node_ids: &[u32],
    ) -> AsicResult<()> {
        if self.groups.contains_key(&group_id) {
            return Err(AsicError::Exists);
        }
        self.check_nodes(node_ids)?;
        self.groups.insert(group_id, node_ids.to_vec());
        Ok(())
    }

    pub fn group_modify(
        &mut self,
        group_id: u32,
        node_ids: &[u32],
    ) -> AsicResult<()> {
        self.check_nodes(node_ids)?;
        match self.groups.get_mut(&group_id) {
            Some(nodes) => {
                *nodes = node_ids.to_vec();
                Ok(())
            }
            None => Err(no_group(group_id)),
        }
    }

    pub fn group_delete(&mut self, group_id: u32) -> AsicResult<()> {
        match self.groups.remove(&group_id) {
            Some(_) => Ok(()),
            None => Err(no_group(group_id)),
        }
    }

    pub fn groups_get(&self, group_id: u32) -> AsicResult<Vec<MulticastGroup>> {
        if group_id != 0 {
            let node_ids = self.group_nodes(group_id)?;
            return Ok(vec![MulticastGroup { group_id, node_ids }]);
        }
        Ok(self
            .groups
            .iter()
            .map(|(group_id, node_ids)| MulticastGroup {
                group_id: *group_id,
                node_ids: node_ids.clone(),
            })
            .collect())
    }

    pub fn clone_insert(&mut self, clone: &CloneSession) -> AsicResult<()> {
        if self.clone_sessions.contains_key(&clone.session_id) {
            return Err(AsicError::Exists);
        }
        self.clone_sessions.insert(clone.session_id, *clone);
        Ok(())
    }

    pub fn clone_modify(&mut self, clone: &CloneSession) -> AsicResult<()> {
        match self.clone_sessions.get_mut(&clone.session_id) {
            Some(c) => {
                *c = *clone;
                Ok(())
            }
            None => Err(AsicError::Missing(format!(
                "no such clone session: {}",
                clone.session_id
            ))),
        }
    }

    pub fn clone_delete(&mut self, session_id: u32) -> AsicResult<()> {
        match self.clone_sessions.remove(&session_id) {
            Some(_) => Ok(()),
            None => Err(AsicError::Missing(format!(
                "no such clone session: {session_id}"
            ))),
        }
    }

    pub fn clones_get(&self, session_id: u32) -> AsicResult<Vec<CloneSession>> {
        if session_id == 0 {
            return Ok(self.clone_sessions.values().copied().collect());
        }
        match self.clone_sessions.get(&session_id) {
            Some(c) => Ok(vec![*c]),
            None => Err(AsicError::Missing(format!(
                "no such clone session: {session_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_refers_to_live_nodes() {
        let mut pre = PreData::default();
        let a = pre.node_create(1, &[], &[1, 2]);
        let b = pre.node_create(2, &[], &[3]);
        assert_ne!(a, b);

        assert!(pre.group_insert(55, &[a, 99]).is_err());
        pre.group_insert(55, &[a]).unwrap();
        assert!(matches!(pre.group_insert(55, &[b]), Err(AsicError::Exists)));

        // A node can't be removed while a group still points at it.
        assert!(pre.nodes_delete(&[a]).is_err());
        pre.group_modify(55, &[b]).unwrap();
        pre.nodes_delete(&[a]).unwrap();
        assert!(pre.node_get(a).is_err());

        assert_eq!(pre.groups_get(0).unwrap().len(), 1);
        pre.group_delete(55).unwrap();
        assert!(pre.groups_get(55).is_err());
    }

    #[test]
    fn test_clone_sessions() {
        let mut pre = PreData::default();
        let clone = CloneSession {
            session_id: 7,
            egress_port: 4,
            cos: 1,
            max_pkt_len: 1500,
        };
        pre.clone_insert(&clone).unwrap();
        assert!(pre.clone_insert(&clone).is_err());
        pre.clone_modify(&CloneSession { cos: 2, ..clone }).unwrap();
        assert_eq!(pre.clones_get(7).unwrap()[0].cos, 2);
        pre.clone_delete(7).unwrap();
        assert!(pre.clones_get(0).unwrap().is_empty());
    }
}
