// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Indirect counters.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use slog::debug;
use slog::o;

use crate::sync::sync_table;
use crate::table_manager::sdk_index;
use crate::types::sde_call;
use crate::types::StratumError;
use crate::types::StratumResult;
use aal::DeviceId;
use aal::SdeInterface;
use aal::SessionHandle;
use aal::SyncKind;
use common::p4info::Counter;
use common::p4info::CounterUnit;
use common::p4info::P4Info;
use common::p4rt::CounterData;
use common::p4rt::CounterEntry;
use common::p4rt::Index;
use common::p4rt::UpdateType;

pub struct CounterManager {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    sync_timeout: Duration,
    p4info: RwLock<Option<Arc<P4Info>>>,
}

fn count(value: i64, what: &str) -> StratumResult<u64> {
    u64::try_from(value).map_err(|_| {
        StratumError::InvalidParam(format!("Negative {what} count {value}."))
    })
}

impl CounterManager {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        device: DeviceId,
        sync_timeout: Duration,
    ) -> Self {
        CounterManager {
            log: log.new(o!("unit" => "counter_manager")),
            sde,
            device,
            sync_timeout,
            p4info: RwLock::new(None),
        }
    }

    pub fn push_forwarding_pipeline_config(
        &self,
        p4info: &P4Info,
    ) -> StratumResult<()> {
        *self.p4info.write() = Some(Arc::new(p4info.clone()));
        debug!(self.log, "pipeline pushed"; "counters" => p4info.counters.len());
        Ok(())
    }

    fn installed(p4info: &Option<Arc<P4Info>>) -> StratumResult<Arc<P4Info>> {
        p4info.clone().ok_or_else(|| {
            StratumError::NotInitialized(
                "No forwarding pipeline has been pushed.".to_string(),
            )
        })
    }

    fn find_counter(p4info: &P4Info, counter_id: u32) -> StratumResult<&Counter> {
        p4info
            .counters
            .iter()
            .find(|c| c.preamble.id == counter_id)
            .ok_or_else(|| {
                StratumError::NotFound(format!(
                    "Counter {counter_id} not found in P4Info."
                ))
            })
    }

    /// Set one cell of a counter, or every cell if no index is given.  Only
    /// the values the counter's unit covers are written.
    pub fn write_indirect_counter_entry(
        &self,
        session: &SessionHandle,
        update_type: UpdateType,
        entry: &CounterEntry,
    ) -> StratumResult<()> {
        if update_type != UpdateType::Modify {
            return Err(StratumError::InvalidParam(
                "Counters can only be modified.".to_string(),
            ));
        }
        let guard = self.p4info.write();
        let p4info = Self::installed(&guard)?;
        let counter = Self::find_counter(&p4info, entry.counter_id)?;
        let data = entry.data.ok_or_else(|| {
            StratumError::InvalidParam(format!(
                "Entry for counter {} has no data.",
                entry.counter_id
            ))
        })?;
        let bytes = count(data.byte_count, "byte")?;
        let packets = count(data.packet_count, "packet")?;
        let (bytes, packets) = match counter.unit {
            CounterUnit::Bytes => (Some(bytes), None),
            CounterUnit::Packets => (None, Some(packets)),
            CounterUnit::Both | CounterUnit::Unspecified => {
                (Some(bytes), Some(packets))
            }
        };

        let counter_id = sde_call!(self.sde.get_bfrt_id(entry.counter_id))?;
        let index = sdk_index(entry.index)?;
        sde_call!(self.sde.write_indirect_counter(
            self.device,
            session,
            counter_id,
            index,
            bytes,
            packets
        ))
    }

    fn read_counter(
        &self,
        session: &SessionHandle,
        p4_id: u32,
        index: Option<Index>,
    ) -> StratumResult<Vec<CounterEntry>> {
        let counter_id = sde_call!(self.sde.get_bfrt_id(p4_id))?;
        let index = sdk_index(index)?;
        sync_table(
            self.sde.as_ref(),
            self.device,
            session,
            counter_id,
            SyncKind::Counters,
            self.sync_timeout,
        )?;
        let cells = sde_call!(self.sde.read_indirect_counter(
            self.device,
            session,
            counter_id,
            index
        ))?;
        Ok(cells
            .into_iter()
            .map(|c| CounterEntry {
                counter_id: p4_id,
                index: Some(Index {
                    index: i64::from(c.index),
                }),
                data: Some(CounterData {
                    byte_count: c.bytes.map_or(0, saturating_i64),
                    packet_count: c.packets.map_or(0, saturating_i64),
                }),
            })
            .collect())
    }

    /// Read one cell of a counter, or every cell if no index is given.  A
    /// counter id of 0 reads every counter.  Values are synced from the
    /// hardware first.
    pub fn read_indirect_counter_entry(
        &self,
        session: &SessionHandle,
        entry: &CounterEntry,
    ) -> StratumResult<Vec<CounterEntry>> {
        let guard = self.p4info.read();
        let p4info = Self::installed(&guard)?;
        if entry.counter_id == 0 {
            let mut entries = Vec::new();
            for counter in &p4info.counters {
                entries.extend(self.read_counter(
                    session,
                    counter.preamble.id,
                    None,
                )?);
            }
            return Ok(entries);
        }
        Self::find_counter(&p4info, entry.counter_id)?;
        self.read_counter(session, entry.counter_id, entry.index)
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use aal::DeviceConfig;
    use aal::Program;
    use asic::Handle;
    use common::p4info::Preamble;
    use mockall::predicate::eq;

    use super::*;
    use crate::test_utils::mock_session;
    use crate::test_utils::stub_sde;
    use crate::test_utils::test_logger;
    use crate::test_utils::MockSde;
    use crate::types::ErrorCode;
    use pretty_assertions::assert_eq;

    const BOTH: u32 = 0x1200_0001;
    const PACKETS: u32 = 0x1200_0002;

    fn p4info() -> P4Info {
        let counter = |id, unit| Counter {
            preamble: Preamble {
                id,
                name: format!("c{id:x}"),
                ..Default::default()
            },
            unit,
            size: 4,
            ..Default::default()
        };
        P4Info {
            counters: vec![
                counter(BOTH, CounterUnit::Both),
                counter(PACKETS, CounterUnit::Packets),
            ],
            ..Default::default()
        }
    }

    fn setup() -> (Arc<Handle>, CounterManager, SessionHandle) {
        let sde = stub_sde();
        let config = DeviceConfig {
            programs: vec![Program {
                p4info: p4info(),
                ..Default::default()
            }],
        };
        sde.add_device(0, &config).unwrap();
        let mgr = CounterManager::new(
            &test_logger(),
            sde.clone(),
            0,
            Duration::from_secs(1),
        );
        mgr.push_forwarding_pipeline_config(&p4info()).unwrap();
        let session = sde.create_session().unwrap();
        (sde, mgr, session)
    }

    fn entry(counter_id: u32, index: Option<i64>, data: Option<(i64, i64)>) -> CounterEntry {
        CounterEntry {
            counter_id,
            index: index.map(|index| Index { index }),
            data: data.map(|(byte_count, packet_count)| CounterData {
                byte_count,
                packet_count,
            }),
        }
    }

    #[test]
    fn test_write_and_read() {
        let (_sde, mgr, session) = setup();
        mgr.write_indirect_counter_entry(
            &session,
            UpdateType::Modify,
            &entry(BOTH, Some(2), Some((1500, 3))),
        )
        .unwrap();
        assert_eq!(
            mgr.read_indirect_counter_entry(&session, &entry(BOTH, Some(2), None))
                .unwrap(),
            vec![entry(BOTH, Some(2), Some((1500, 3)))]
        );

        // A packet counter ignores the byte count.
        mgr.write_indirect_counter_entry(
            &session,
            UpdateType::Modify,
            &entry(PACKETS, None, Some((99, 7))),
        )
        .unwrap();
        let all = mgr
            .read_indirect_counter_entry(&session, &entry(PACKETS, None, None))
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|e| e.data == Some(CounterData {
            byte_count: 0,
            packet_count: 7,
        })));

        let everything = mgr
            .read_indirect_counter_entry(&session, &entry(0, None, None))
            .unwrap();
        assert_eq!(everything.len(), 8);
    }

    #[test]
    fn test_bad_writes() {
        let (_sde, mgr, session) = setup();
        for (update_type, e, code) in [
            (
                UpdateType::Insert,
                entry(BOTH, Some(0), Some((1, 1))),
                ErrorCode::InvalidParam,
            ),
            (UpdateType::Modify, entry(BOTH, Some(0), None), ErrorCode::InvalidParam),
            (
                UpdateType::Modify,
                entry(BOTH, Some(0), Some((-1, 1))),
                ErrorCode::InvalidParam,
            ),
            (
                UpdateType::Modify,
                entry(BOTH, Some(4), Some((1, 1))),
                ErrorCode::InvalidParam,
            ),
            (
                UpdateType::Modify,
                entry(0x1200_00ff, None, Some((1, 1))),
                ErrorCode::NotFound,
            ),
        ] {
            let err = mgr
                .write_indirect_counter_entry(&session, update_type, &e)
                .unwrap_err();
            assert_eq!(err.code(), code, "{e:?}");
        }
    }

    #[test]
    fn test_read_times_out() {
        let mut sde = MockSde::new();
        sde.expect_get_bfrt_id().returning(Ok);
        sde.expect_sync_supported()
            .with(eq(0), eq(BOTH), eq(SyncKind::Counters))
            .return_const(true);
        // Accept the request but never signal completion.
        let parked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let keep = parked.clone();
        sde.expect_request_sync().returning(move |_, _, _, _, notify| {
            keep.lock().unwrap().push(notify);
            Ok(())
        });
        sde.expect_read_indirect_counter().never();

        let mgr = CounterManager::new(
            &test_logger(),
            Arc::new(sde),
            0,
            Duration::from_millis(10),
        );
        mgr.push_forwarding_pipeline_config(&p4info()).unwrap();
        let err = mgr
            .read_indirect_counter_entry(&mock_session(), &entry(BOTH, Some(1), None))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OperTimeout);
        assert_eq!(parked.lock().unwrap().len(), 1);
    }
}
