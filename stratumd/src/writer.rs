// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::StratumError;
use crate::types::StratumResult;
use common::p4rt::Entity;
use common::p4rt::ReadResponse;

/// A sink for messages flowing back to a client: read responses, stream
/// messages and gNMI events.  `write` returns false once the other end has
/// gone away.
pub trait Writer<T>: Send + Sync {
    fn write(&self, msg: T) -> bool;
}

impl<T: Send> Writer<T> for mpsc::UnboundedSender<T> {
    fn write(&self, msg: T) -> bool {
        self.send(msg).is_ok()
    }
}

/// Collects everything written to it.
impl<T: Send> Writer<T> for Mutex<Vec<T>> {
    fn write(&self, msg: T) -> bool {
        self.lock().push(msg);
        true
    }
}

/// Send `entities` to `writer` as a single read response.
pub fn write_entities(
    writer: &dyn Writer<ReadResponse>,
    entities: Vec<Entity>,
) -> StratumResult<()> {
    match writer.write(ReadResponse { entities }) {
        true => Ok(()),
        false => Err(StratumError::Internal(
            "Write to stream channel failed.".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_writer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(tx.write(7u32));
        assert_eq!(rx.try_recv().unwrap(), 7);
        drop(rx);
        assert!(!tx.write(8));
    }

    #[test]
    fn test_write_entities_to_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel::<ReadResponse>();
        drop(rx);
        assert!(write_entities(&tx, Vec::new()).is_err());

        let collected: Mutex<Vec<ReadResponse>> = Mutex::new(Vec::new());
        write_entities(&collected, Vec::new()).unwrap();
        assert_eq!(collected.lock().len(), 1);
    }
}
