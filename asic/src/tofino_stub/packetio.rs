// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use bytes::Bytes;
use tokio::sync::mpsc;

use aal::AsicError;
use aal::AsicResult;

/// CPU port packet state for a single device.  Transmitted packets go
/// nowhere; they are kept so that tests can look at them.
#[derive(Debug, Default)]
pub struct PacketIo {
    started: bool,
    rx_writer: Option<mpsc::Sender<Bytes>>,
    transmitted: Vec<Bytes>,
}

impl PacketIo {
    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn stop(&mut self) {
        self.started = false;
    }

    pub fn tx(&mut self, packet: &[u8]) -> AsicResult<()> {
        if !self.started {
            return Err(AsicError::Uninitialized(
                "packet io not started".to_string(),
            ));
        }
        self.transmitted.push(Bytes::copy_from_slice(packet));
        Ok(())
    }

    pub fn transmitted(&self) -> Vec<Bytes> {
        self.transmitted.clone()
    }

    pub fn set_writer(&mut self, writer: Option<mpsc::Sender<Bytes>>) {
        self.rx_writer = writer;
    }

    /// Deliver a packet as if it had arrived on the CPU port.
    pub fn receive(&self, packet: Bytes) -> AsicResult<()> {
        if !self.started {
            return Err(AsicError::Uninitialized(
                "packet io not started".to_string(),
            ));
        }
        match &self.rx_writer {
            Some(w) => w
                .try_send(packet)
                .map_err(|e| AsicError::Internal(e.to_string())),
            None => Err(AsicError::Uninitialized(
                "no packet receive writer".to_string(),
            )),
        }
    }
}
