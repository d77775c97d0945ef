// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Refreshing the SDE's software copy of hardware state.
//!
//! Counter and register values are cached by the SDE and only pulled from
//! the ASIC on request.  A sync is asynchronous: the SDE signals completion
//! on a channel handed to it, and we wait for that signal for a bounded
//! time.  If the signal arrives after we gave up, the SDE finds the
//! receiving end gone and drops it.

use std::sync::mpsc;
use std::time::Duration;

use crate::types::sde_call;
use crate::types::StratumError;
use crate::types::StratumResult;
use aal::DeviceId;
use aal::SdeInterface;
use aal::SessionHandle;
use aal::SyncKind;

/// Refresh the software copy of `table_id`, waiting at most `timeout` for
/// the SDE to finish.  Tables the SDE can't sync are left alone.
pub fn sync_table(
    sde: &dyn SdeInterface,
    device: DeviceId,
    session: &SessionHandle,
    table_id: u32,
    kind: SyncKind,
    timeout: Duration,
) -> StratumResult<()> {
    if !sde.sync_supported(device, table_id, kind) {
        return Ok(());
    }

    let (tx, rx) = mpsc::sync_channel(1);
    sde_call!(sde.request_sync(device, session, table_id, kind, tx))?;
    match rx.recv_timeout(timeout) {
        Ok(()) => Ok(()),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(StratumError::OperTimeout(format!(
                "Timeout while syncing {kind:?} of table {table_id}."
            )))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(StratumError::Internal(format!(
                "SDE dropped the {kind:?} sync of table {table_id}."
            )))
        }
    }
}
