// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Action profile members and action selector groups.
//!
//! A group write always carries the complete membership: the SDE replaces
//! the member list of the group wholesale rather than adding or removing
//! individual members.

use std::sync::Arc;

use parking_lot::RwLock;
use slog::debug;
use slog::o;

use crate::table_manager::action_from_data;
use crate::table_manager::build_action_data;
use crate::table_manager::ONE_SHOT_ID_BASE;
use crate::types::sde_call;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::write_entities;
use crate::writer::Writer;
use aal::DeviceId;
use aal::SdeInterface;
use aal::SessionHandle;
use common::p4info::ActionProfile;
use common::p4info::P4Info;
use common::p4rt::ActionProfileGroup;
use common::p4rt::ActionProfileMember;
use common::p4rt::Entity;
use common::p4rt::ExternEntry;
use common::p4rt::ExternPayload;
use common::p4rt::GroupMember;
use common::p4rt::ReadResponse;
use common::p4rt::UpdateType;
use common::p4rt::TNA_EXTERN_ACTION_PROFILE_ID;
use common::p4rt::TNA_EXTERN_ACTION_SELECTOR_ID;

fn find_profile(
    p4info: &P4Info,
    action_profile_id: u32,
) -> StratumResult<&ActionProfile> {
    p4info.action_profile(action_profile_id).ok_or_else(|| {
        StratumError::NotFound(format!(
            "Action profile {action_profile_id} not found in P4Info."
        ))
    })
}

/// Ids from `ONE_SHOT_ID_BASE` up are managed by the table manager on
/// behalf of one-shot action sets.
fn check_user_id(what: &str, id: u32) -> StratumResult<()> {
    match id {
        0 => Err(StratumError::InvalidParam(format!("Invalid {what} id 0."))),
        id if id >= ONE_SHOT_ID_BASE => Err(StratumError::InvalidParam(
            format!("{what} id {id} is reserved."),
        )),
        _ => Ok(()),
    }
}

pub struct ActionProfileManager {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    p4info: RwLock<Option<Arc<P4Info>>>,
}

impl ActionProfileManager {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        device: DeviceId,
    ) -> Self {
        ActionProfileManager {
            log: log.new(o!("unit" => "action_profile_manager")),
            sde,
            device,
            p4info: RwLock::new(None),
        }
    }

    pub fn push_forwarding_pipeline_config(
        &self,
        p4info: &P4Info,
    ) -> StratumResult<()> {
        *self.p4info.write() = Some(Arc::new(p4info.clone()));
        debug!(self.log, "pipeline pushed";
            "profiles" => p4info.action_profiles.len());
        Ok(())
    }

    fn installed(p4info: &Option<Arc<P4Info>>) -> StratumResult<Arc<P4Info>> {
        p4info.clone().ok_or_else(|| {
            StratumError::NotInitialized(
                "No forwarding pipeline has been pushed.".to_string(),
            )
        })
    }

    pub fn write_action_profile_member(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        member: &ActionProfileMember,
    ) -> StratumResult<()> {
        let guard = self.p4info.write();
        let p4info = Self::installed(&guard)?;
        find_profile(&p4info, member.action_profile_id)?;
        check_user_id("Member", member.member_id)?;
        let profile_id =
            sde_call!(self.sde.get_bfrt_id(member.action_profile_id))?;

        let data = match update_type {
            UpdateType::Insert | UpdateType::Modify => {
                let action = member.action.as_ref().ok_or_else(|| {
                    StratumError::InvalidParam(format!(
                        "Member {} has no action.",
                        member.member_id
                    ))
                })?;
                build_action_data(self.sde.as_ref(), &p4info, profile_id, action)?
            }
            UpdateType::Delete => {
                return sde_call!(self.sde.delete_action_profile_member(
                    self.device,
                    session,
                    profile_id,
                    member.member_id
                ));
            }
            UpdateType::Unspecified => {
                return Err(StratumError::InvalidParam(
                    "Unspecified update type.".to_string(),
                ))
            }
        };
        match update_type {
            UpdateType::Insert => sde_call!(self.sde.insert_action_profile_member(
                self.device,
                session,
                profile_id,
                member.member_id,
                &data
            )),
            _ => sde_call!(self.sde.modify_action_profile_member(
                self.device,
                session,
                profile_id,
                member.member_id,
                &data
            )),
        }
    }

    pub fn write_action_profile_group(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        group: &ActionProfileGroup,
    ) -> StratumResult<()> {
        let guard = self.p4info.write();
        let p4info = Self::installed(&guard)?;
        let profile = find_profile(&p4info, group.action_profile_id)?;
        if !profile.with_selector {
            return Err(StratumError::InvalidParam(format!(
                "Action profile {} has no selector, so it can't hold groups.",
                group.action_profile_id
            )));
        }
        check_user_id("Group", group.group_id)?;
        let profile_id =
            sde_call!(self.sde.get_bfrt_id(group.action_profile_id))?;
        let selector_id =
            sde_call!(self.sde.get_action_selector_bfrt_id(profile_id))?;

        if update_type == UpdateType::Delete {
            return sde_call!(self.sde.delete_action_profile_group(
                self.device,
                session,
                selector_id,
                group.group_id
            ));
        }
        if update_type == UpdateType::Unspecified {
            return Err(StratumError::InvalidParam(
                "Unspecified update type.".to_string(),
            ));
        }

        for m in &group.members {
            check_user_id("Member", m.member_id)?;
            if m.weight > 1 {
                return Err(StratumError::Unimplemented(format!(
                    "Member {} of group {} has weight {}; only weight 1 is \
                     supported.",
                    m.member_id, group.group_id, m.weight
                )));
            }
        }
        let max_group_size = u32::try_from(group.max_size).map_err(|_| {
            StratumError::InvalidParam(format!(
                "Invalid max size {} for group {}.",
                group.max_size, group.group_id
            ))
        })?;
        let sde_group = aal::ActionProfileGroup {
            group_id: group.group_id,
            max_group_size,
            member_ids: group.members.iter().map(|m| m.member_id).collect(),
            member_status: vec![true; group.members.len()],
        };
        match update_type {
            UpdateType::Insert => sde_call!(self.sde.insert_action_profile_group(
                self.device,
                session,
                selector_id,
                &sde_group
            )),
            _ => sde_call!(self.sde.modify_action_profile_group(
                self.device,
                session,
                selector_id,
                &sde_group
            )),
        }
    }

    /// Write a member or group wrapped in an extern entry.
    pub fn write_action_profile_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &ExternEntry,
    ) -> StratumResult<()> {
        match (entry.extern_type_id, &entry.entry) {
            (
                TNA_EXTERN_ACTION_PROFILE_ID,
                Some(ExternPayload::ActionProfileMember(member)),
            ) => {
                let member = ActionProfileMember {
                    action_profile_id: profile_or(member.action_profile_id, entry),
                    ..member.clone()
                };
                self.write_action_profile_member(session, update_type, &member)
            }
            (
                TNA_EXTERN_ACTION_SELECTOR_ID,
                Some(ExternPayload::ActionProfileGroup(group)),
            ) => {
                let group = ActionProfileGroup {
                    action_profile_id: profile_or(group.action_profile_id, entry),
                    ..group.clone()
                };
                self.write_action_profile_group(session, update_type, &group)
            }
            (type_id, _) => Err(StratumError::InvalidParam(format!(
                "Extern entry of type {type_id} doesn't carry an action \
                 profile member or group."
            ))),
        }
    }

    fn p4_member(
        &self,
        p4info: &P4Info,
        action_profile_id: u32,
        member_id: u32,
        data: &aal::TableData,
    ) -> StratumResult<Entity> {
        Ok(Entity::ActionProfileMember(ActionProfileMember {
            action_profile_id,
            member_id,
            action: Some(action_from_data(self.sde.as_ref(), p4info, data)?),
        }))
    }

    /// Read one member, or every member of the profile if the member id is
    /// 0.
    pub fn read_action_profile_member(
        &self,
        session: &SessionHandle,
        member: &ActionProfileMember,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        let guard = self.p4info.read();
        let p4info = Self::installed(&guard)?;
        if member.action_profile_id == 0 {
            return Err(StratumError::InvalidParam(
                "Reading members of every action profile is not supported."
                    .to_string(),
            ));
        }
        find_profile(&p4info, member.action_profile_id)?;
        let profile_id =
            sde_call!(self.sde.get_bfrt_id(member.action_profile_id))?;
        let members = sde_call!(self.sde.get_action_profile_members(
            self.device,
            session,
            profile_id,
            member.member_id
        ))?;
        let entities = members
            .iter()
            .filter(|(id, _)| *id < ONE_SHOT_ID_BASE)
            .map(|(id, data)| {
                self.p4_member(&p4info, member.action_profile_id, *id, data)
            })
            .collect::<StratumResult<Vec<_>>>()?;
        write_entities(writer, entities)
    }

    /// Read one group, or every group of the selector if the group id is 0.
    pub fn read_action_profile_group(
        &self,
        session: &SessionHandle,
        group: &ActionProfileGroup,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        let guard = self.p4info.read();
        let p4info = Self::installed(&guard)?;
        if group.action_profile_id == 0 {
            return Err(StratumError::InvalidParam(
                "Reading groups of every action profile is not supported."
                    .to_string(),
            ));
        }
        find_profile(&p4info, group.action_profile_id)?;
        let profile_id = sde_call!(self.sde.get_bfrt_id(group.action_profile_id))?;
        let selector_id =
            sde_call!(self.sde.get_action_selector_bfrt_id(profile_id))?;
        let groups = sde_call!(self.sde.get_action_profile_groups(
            self.device,
            session,
            selector_id,
            group.group_id
        ))?;

        // The group is reported against the profile the selector is built
        // on, in P4Info numbering.
        let action_profile_id = sde_call!(self
            .sde
            .get_action_profile_bfrt_id(selector_id)
            .and_then(|id| self.sde.get_p4info_id(id)))?;
        let entities = groups
            .into_iter()
            .filter(|g| g.group_id < ONE_SHOT_ID_BASE)
            .map(|g| {
                Entity::ActionProfileGroup(ActionProfileGroup {
                    action_profile_id,
                    group_id: g.group_id,
                    members: g
                        .member_ids
                        .iter()
                        .map(|member_id| GroupMember {
                            member_id: *member_id,
                            weight: 1,
                        })
                        .collect(),
                    max_size: i32::try_from(g.max_group_size).unwrap_or(i32::MAX),
                })
            })
            .collect();
        write_entities(writer, entities)
    }

    /// Read members or groups through an extern entry.  Results are
    /// reported as plain members and groups.
    pub fn read_action_profile_entry(
        &self,
        session: &SessionHandle,
        entry: &ExternEntry,
        writer: &dyn Writer<ReadResponse>,
    ) -> StratumResult<()> {
        match (entry.extern_type_id, &entry.entry) {
            (TNA_EXTERN_ACTION_PROFILE_ID, payload) => {
                let member = match payload {
                    Some(ExternPayload::ActionProfileMember(m)) => m.clone(),
                    _ => ActionProfileMember::default(),
                };
                let member = ActionProfileMember {
                    action_profile_id: profile_or(member.action_profile_id, entry),
                    ..member
                };
                self.read_action_profile_member(session, &member, writer)
            }
            (TNA_EXTERN_ACTION_SELECTOR_ID, payload) => {
                let group = match payload {
                    Some(ExternPayload::ActionProfileGroup(g)) => g.clone(),
                    _ => ActionProfileGroup::default(),
                };
                let group = ActionProfileGroup {
                    action_profile_id: profile_or(group.action_profile_id, entry),
                    ..group
                };
                self.read_action_profile_group(session, &group, writer)
            }
            (type_id, _) => Err(StratumError::OperNotSupported(format!(
                "Reading extern entries of type {type_id} is not supported."
            ))),
        }
    }
}

/// The profile a wrapped member or group belongs to: its own, or the
/// extern instance it was wrapped in.
fn profile_or(action_profile_id: u32, entry: &ExternEntry) -> u32 {
    match action_profile_id {
        0 => entry.extern_id,
        id => id,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::table_manager::tests::installed_sde;
    use crate::table_manager::tests::p4info;
    use crate::table_manager::tests::PROFILE;
    use crate::table_manager::tests::SELECTOR_TABLE;
    use crate::table_manager::tests::SET_PORT;
    use crate::table_manager::TableManager;
    use crate::test_utils::test_logger;
    use crate::types::ErrorCode;
    use asic::Handle;
    use common::p4rt::Action;
    use common::p4rt::ActionParam;
    use common::p4rt::ActionProfileAction;
    use common::p4rt::ActionProfileActionSet;
    use common::p4rt::FieldMatch;
    use common::p4rt::TableAction;
    use common::p4rt::TableEntry;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<Handle>, ActionProfileManager, SessionHandle) {
        let sde = installed_sde();
        let mgr = ActionProfileManager::new(&test_logger(), sde.clone(), 0);
        mgr.push_forwarding_pipeline_config(&p4info()).unwrap();
        let session = sde.create_session().unwrap();
        (sde, mgr, session)
    }

    fn set_port(port: u8) -> Action {
        Action {
            action_id: SET_PORT,
            params: vec![ActionParam {
                param_id: 1,
                value: Bytes::from(vec![0, port]),
            }],
        }
    }

    fn member(member_id: u32, port: Option<u8>) -> ActionProfileMember {
        ActionProfileMember {
            action_profile_id: PROFILE,
            member_id,
            action: port.map(set_port),
        }
    }

    fn group(group_id: u32, members: &[u32]) -> ActionProfileGroup {
        ActionProfileGroup {
            action_profile_id: PROFILE,
            group_id,
            members: members
                .iter()
                .map(|id| GroupMember {
                    member_id: *id,
                    weight: 1,
                })
                .collect(),
            max_size: 4,
        }
    }

    fn read_members(
        mgr: &ActionProfileManager,
        session: &SessionHandle,
        query: &ActionProfileMember,
    ) -> StratumResult<Vec<Entity>> {
        let out: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        mgr.read_action_profile_member(session, query, &out)?;
        Ok(out.into_inner().into_iter().flat_map(|r| r.entities).collect())
    }

    fn read_groups(
        mgr: &ActionProfileManager,
        session: &SessionHandle,
        query: &ActionProfileGroup,
    ) -> StratumResult<Vec<Entity>> {
        let out: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        mgr.read_action_profile_group(session, query, &out)?;
        Ok(out.into_inner().into_iter().flat_map(|r| r.entities).collect())
    }

    #[test]
    fn test_member_lifecycle() {
        let (_sde, mgr, session) = setup();
        mgr.write_action_profile_member(
            &session,
            UpdateType::Insert,
            &member(1, Some(5)),
        )
        .unwrap();
        mgr.write_action_profile_member(
            &session,
            UpdateType::Insert,
            &member(2, Some(6)),
        )
        .unwrap();
        mgr.write_action_profile_member(
            &session,
            UpdateType::Modify,
            &member(2, Some(7)),
        )
        .unwrap();

        let all = read_members(&mgr, &session, &member(0, None)).unwrap();
        assert_eq!(
            all,
            vec![
                Entity::ActionProfileMember(member(1, Some(5))),
                Entity::ActionProfileMember(member(2, Some(7))),
            ]
        );

        mgr.write_action_profile_member(&session, UpdateType::Delete, &member(1, None))
            .unwrap();
        let err = read_members(&mgr, &session, &member(1, None)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntryNotFound);
    }

    #[test]
    fn test_member_validation() {
        let (_sde, mgr, session) = setup();
        let err = mgr
            .write_action_profile_member(&session, UpdateType::Insert, &member(1, None))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let err = mgr
            .write_action_profile_member(
                &session,
                UpdateType::Insert,
                &member(ONE_SHOT_ID_BASE + 1, Some(1)),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let mut unknown = member(1, Some(1));
        unknown.action_profile_id = 0x1100_00ff;
        let err = mgr
            .write_action_profile_member(&session, UpdateType::Insert, &unknown)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = read_members(
            &mgr,
            &session,
            &ActionProfileMember::default(),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn test_group_lifecycle() {
        let (_sde, mgr, session) = setup();
        for id in 1..=3 {
            mgr.write_action_profile_member(
                &session,
                UpdateType::Insert,
                &member(id, Some(id as u8)),
            )
            .unwrap();
        }

        // Members must exist before a group can use them.
        let err = mgr
            .write_action_profile_group(&session, UpdateType::Insert, &group(10, &[1, 9]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        mgr.write_action_profile_group(&session, UpdateType::Insert, &group(10, &[1, 2]))
            .unwrap();
        mgr.write_action_profile_group(&session, UpdateType::Modify, &group(10, &[2, 3]))
            .unwrap();
        assert_eq!(
            read_groups(&mgr, &session, &group(0, &[])).unwrap(),
            vec![Entity::ActionProfileGroup(group(10, &[2, 3]))]
        );

        // A member in use can't be removed.
        let err = mgr
            .write_action_profile_member(&session, UpdateType::Delete, &member(2, None))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);

        let mut weighted = group(10, &[2]);
        weighted.members[0].weight = 2;
        let err = mgr
            .write_action_profile_group(&session, UpdateType::Modify, &weighted)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);

        mgr.write_action_profile_group(&session, UpdateType::Delete, &group(10, &[]))
            .unwrap();
        assert!(read_groups(&mgr, &session, &group(0, &[])).unwrap().is_empty());
        mgr.write_action_profile_member(&session, UpdateType::Delete, &member(2, None))
            .unwrap();
    }

    #[test]
    fn test_extern_entries() {
        let (_sde, mgr, session) = setup();
        let wrapped = ExternEntry {
            extern_type_id: TNA_EXTERN_ACTION_PROFILE_ID,
            extern_id: PROFILE,
            entry: Some(ExternPayload::ActionProfileMember(ActionProfileMember {
                action_profile_id: 0,
                ..member(4, Some(8))
            })),
        };
        mgr.write_action_profile_entry(&session, UpdateType::Insert, &wrapped)
            .unwrap();

        let group_entry = ExternEntry {
            extern_type_id: TNA_EXTERN_ACTION_SELECTOR_ID,
            extern_id: PROFILE,
            entry: Some(ExternPayload::ActionProfileGroup(group(20, &[4]))),
        };
        mgr.write_action_profile_entry(&session, UpdateType::Insert, &group_entry)
            .unwrap();

        let out: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        let query = ExternEntry {
            entry: None,
            ..wrapped.clone()
        };
        mgr.read_action_profile_entry(&session, &query, &out).unwrap();
        let query = ExternEntry {
            entry: None,
            ..group_entry
        };
        mgr.read_action_profile_entry(&session, &query, &out).unwrap();
        let entities: Vec<Entity> =
            out.into_inner().into_iter().flat_map(|r| r.entities).collect();
        assert_eq!(
            entities,
            vec![
                Entity::ActionProfileMember(member(4, Some(8))),
                Entity::ActionProfileGroup(group(20, &[4])),
            ]
        );

        let other = ExternEntry {
            extern_type_id: 200,
            ..wrapped
        };
        let sink: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        let err = mgr
            .read_action_profile_entry(&session, &other, &sink)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OperNotSupported);
        let err = mgr
            .write_action_profile_entry(&session, UpdateType::Insert, &other)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn test_one_shot_objects_hidden() {
        let (sde, mgr, session) = setup();
        let tables =
            TableManager::new(&test_logger(), sde.clone(), 0, Duration::from_secs(1));
        tables.push_forwarding_pipeline_config(&p4info()).unwrap();
        let entry = TableEntry {
            table_id: SELECTOR_TABLE,
            matches: vec![FieldMatch::exact(1, vec![0, 1])],
            action: Some(TableAction::ActionProfileActionSet(
                ActionProfileActionSet {
                    action_profile_actions: vec![ActionProfileAction {
                        action: set_port(1),
                        weight: 1,
                    }],
                },
            )),
            ..Default::default()
        };
        tables
            .write_table_entry(&session, UpdateType::Insert, &entry)
            .unwrap();

        assert!(read_members(&mgr, &session, &member(0, None))
            .unwrap()
            .is_empty());
        assert!(read_groups(&mgr, &session, &group(0, &[])).unwrap().is_empty());
    }
}
