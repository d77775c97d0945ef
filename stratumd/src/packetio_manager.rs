// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Packets to and from the controller.
//!
//! Packets the pipeline punts to the CPU port carry a `packet_in` header
//! in front of the original frame, and packets the controller injects must
//! carry a `packet_out` header.  The layout of both headers comes from the
//! controller packet metadata in the P4Info: the fields appear on the wire
//! in declaration order, each exactly as wide as declared, with no padding
//! between them.
//!
//! Received packets arrive on a channel registered with the SDE and are
//! handled by a dedicated thread, which parses the header and hands the
//! resulting `PacketIn` to the registered writer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use bytes::BytesMut;
use parking_lot::Mutex;
use parking_lot::RwLock;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use tokio::sync::mpsc;

use crate::translator::Translator;
use crate::types::sde_call;
use crate::types::ErrorAccumulator;
use crate::types::StratumError;
use crate::types::StratumResult;
use crate::writer::Writer;
use aal::DeviceId;
use aal::SdeInterface;
use common::bytestring::bytes_for_bits;
use common::bytestring::canonical;
use common::p4info::P4Info;
use common::p4info::PACKET_IN_HEADER;
use common::p4info::PACKET_OUT_HEADER;
use common::p4rt::PacketIn;
use common::p4rt::PacketMetadata;
use common::p4rt::PacketOut;

/// Depth of the channel carrying received packets from the SDE.
const PACKET_RX_CHANNEL_DEPTH: usize = 1024;

/// A run of bits, most significant first.
#[derive(Debug, Default)]
struct BitBuffer {
    bits: VecDeque<bool>,
}

impl BitBuffer {
    /// Append `value` as a field exactly `bit_width` bits wide.
    fn push_back(&mut self, value: &[u8], bit_width: u32) -> StratumResult<()> {
        let too_wide = || {
            StratumError::InvalidParam(format!(
                "Bytestring {value:02x?} overflows bit width {bit_width}."
            ))
        };
        if value.len() > bytes_for_bits(bit_width) {
            return Err(too_wide());
        }
        let mut bits: VecDeque<bool> = value
            .iter()
            .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
            .collect();
        let width = bit_width as usize;
        while bits.len() > width {
            if bits.pop_front() == Some(true) {
                return Err(too_wide());
            }
        }
        while bits.len() < width {
            bits.push_front(false);
        }
        self.bits.extend(bits);
        Ok(())
    }

    /// Remove a field of `bit_width` bits from the front of the buffer.
    /// The most significant byte of the result holds whatever bits don't
    /// fill a whole byte.
    fn pop_field(&mut self, bit_width: u32) -> Bytes {
        let mut out = BytesMut::with_capacity(bytes_for_bits(bit_width));
        let mut byte = 0u8;
        for bit in (0..bit_width).rev() {
            byte = (byte << 1) | u8::from(self.bits.pop_front() == Some(true));
            if bit % 8 == 0 {
                out.extend_from_slice(&[byte]);
                byte = 0;
            }
        }
        out.freeze()
    }

    fn into_bytes(mut self) -> Bytes {
        let width = self.bits.len() as u32;
        self.pop_field(width)
    }
}

/// The fields of one controller header: (metadata id, bit width), in wire
/// order.
type HeaderLayout = Vec<(u32, u32)>;

#[derive(Debug, Default)]
struct PacketIoState {
    initialized: bool,
    packet_in: HeaderLayout,
    packet_out: HeaderLayout,
}

impl PacketIoState {
    fn packet_in_len(&self) -> usize {
        self.packet_in.iter().map(|(_, w)| *w as usize).sum::<usize>() / 8
    }
}

/// Everything the receive thread shares with the manager.
struct Shared {
    log: slog::Logger,
    translator: Arc<Translator>,
    state: RwLock<PacketIoState>,
    rx_writer: Mutex<Option<Arc<dyn Writer<PacketIn>>>>,
}

pub struct PacketIoManager {
    log: slog::Logger,
    sde: Arc<dyn SdeInterface>,
    device: DeviceId,
    shared: Arc<Shared>,
    rx_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Work out the header layouts declared by `p4info`.  Each header must be a
/// whole number of bytes.
fn build_metadata_mapping(
    log: &slog::Logger,
    p4info: &P4Info,
) -> StratumResult<(HeaderLayout, HeaderLayout)> {
    let mut packet_in = Vec::new();
    let mut packet_out = Vec::new();
    for header in &p4info.controller_packet_metadata {
        let layout = match header.preamble.name.as_str() {
            PACKET_IN_HEADER => &mut packet_in,
            PACKET_OUT_HEADER => &mut packet_out,
            name => {
                warn!(log, "skipping unknown controller header";
                    "name" => name);
                continue;
            }
        };
        layout.extend(header.metadata.iter().map(|m| (m.id, m.bitwidth)));
    }

    for (name, layout) in
        [(PACKET_IN_HEADER, &packet_in), (PACKET_OUT_HEADER, &packet_out)]
    {
        let bits: u32 = layout.iter().map(|(_, w)| w).sum();
        if bits % 8 != 0 {
            return Err(StratumError::InvalidParam(format!(
                "{name} header size must be a multiple of 8 bits, not {bits}."
            )));
        }
    }
    Ok((packet_in, packet_out))
}

fn deparse_packet_out(
    layout: &HeaderLayout,
    packet: &PacketOut,
) -> StratumResult<Bytes> {
    let mut header = BitBuffer::default();
    for (id, bit_width) in layout {
        let metadata = packet
            .metadata
            .iter()
            .find(|m| m.metadata_id == *id)
            .ok_or_else(|| {
                StratumError::InvalidParam(format!(
                    "Missing metadata with id {id} in PacketOut."
                ))
            })?;
        header.push_back(&metadata.value, *bit_width)?;
    }
    let mut buf = BytesMut::from(header.into_bytes().as_ref());
    buf.extend_from_slice(&packet.payload);
    Ok(buf.freeze())
}

fn parse_packet_in(
    state: &PacketIoState,
    buf: &[u8],
) -> StratumResult<PacketIn> {
    let header_len = state.packet_in_len();
    if buf.len() < header_len {
        return Err(StratumError::InvalidParam(format!(
            "Received packet is too small: {} < {header_len} bytes.",
            buf.len()
        )));
    }
    let mut header = BitBuffer::default();
    header.push_back(&buf[..header_len], (header_len * 8) as u32)?;
    let metadata = state
        .packet_in
        .iter()
        .map(|(id, bit_width)| PacketMetadata {
            metadata_id: *id,
            value: canonical(&header.pop_field(*bit_width)),
        })
        .collect();
    Ok(PacketIn {
        payload: Bytes::copy_from_slice(&buf[header_len..]),
        metadata,
    })
}

impl Shared {
    fn handle_packet(&self, buf: &[u8]) -> StratumResult<()> {
        let packet = parse_packet_in(&self.state.read(), buf)?;
        let packet = self.translator.translate_packet_in(&packet)?;
        match self.rx_writer.lock().as_ref() {
            Some(writer) => {
                if !writer.write(packet) {
                    debug!(self.log, "packet-in writer went away");
                }
            }
            None => debug!(self.log, "no packet-in writer, dropping packet"),
        }
        Ok(())
    }
}

fn packet_rx_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(buf) = rx.blocking_recv() {
        if let Err(e) = shared.handle_packet(&buf) {
            error!(shared.log, "failed to handle received packet";
                "len" => buf.len(),
                "error" => %e);
        }
    }
    info!(shared.log, "packet receive channel closed");
}

impl PacketIoManager {
    pub fn new(
        log: &slog::Logger,
        sde: Arc<dyn SdeInterface>,
        translator: Arc<Translator>,
        device: DeviceId,
    ) -> Self {
        let log = log.new(o!("unit" => "packetio_manager", "device" => device));
        PacketIoManager {
            shared: Arc::new(Shared {
                log: log.new(o!("thread" => "packet-rx")),
                translator,
                state: RwLock::new(PacketIoState::default()),
                rx_writer: Mutex::new(None),
            }),
            log,
            sde,
            device,
            rx_thread: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.read().initialized
    }

    /// Learn the header layouts of a new pipeline and make sure packet IO
    /// is running.  The receive thread is started on the first push only.
    pub fn push_forwarding_pipeline_config(
        &self,
        p4info: &P4Info,
    ) -> StratumResult<()> {
        let (packet_in, packet_out) =
            build_metadata_mapping(&self.log, p4info)?;
        let mut state = self.shared.state.write();
        state.packet_in = packet_in;
        state.packet_out = packet_out;
        sde_call!(self.sde.start_packet_io(self.device))?;
        if state.initialized {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(PACKET_RX_CHANNEL_DEPTH);
        sde_call!(self.sde.register_packet_receive_writer(self.device, tx))?;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("packet-rx".to_string())
            .spawn(move || packet_rx_loop(shared, rx))
            .map_err(|e| {
                StratumError::Internal(format!(
                    "failed to spawn packet receive thread: {e}"
                ))
            })?;
        *self.rx_thread.lock() = Some(handle);
        state.initialized = true;
        info!(self.log, "packet io started";
            "packet_in_fields" => state.packet_in.len(),
            "packet_out_fields" => state.packet_out.len());
        Ok(())
    }

    /// Check that a pipeline's controller headers could be handled, without
    /// touching the running configuration.
    pub fn verify_forwarding_pipeline_config(
        &self,
        p4info: &P4Info,
    ) -> StratumResult<()> {
        build_metadata_mapping(&self.log, p4info).map(|_| ())
    }

    /// Add a `packet_out` header to `packet` and send it out of the CPU
    /// port.
    pub fn transmit_packet(&self, packet: &PacketOut) -> StratumResult<()> {
        let buf = {
            let state = self.shared.state.read();
            if !state.initialized {
                return Err(StratumError::NotInitialized(
                    "Packet IO has not been started.".to_string(),
                ));
            }
            let packet = self.shared.translator.translate_packet_out(packet)?;
            deparse_packet_out(&state.packet_out, &packet)?
        };
        sde_call!(self.sde.tx_packet(self.device, &buf))
    }

    /// Deliver every received packet to `writer`, replacing any writer
    /// registered before.
    pub fn register_packet_receive_writer(
        &self,
        writer: Arc<dyn Writer<PacketIn>>,
    ) {
        *self.shared.rx_writer.lock() = Some(writer);
    }

    pub fn unregister_packet_receive_writer(&self) {
        *self.shared.rx_writer.lock() = None;
    }

    /// Stop packet IO and forget the pipeline's headers.  Unregistering the
    /// receive channel closes it, which ends the receive thread.
    pub fn shutdown(&self) -> StratumResult<()> {
        self.unregister_packet_receive_writer();
        let mut errors = ErrorAccumulator::new();
        {
            let mut state = self.shared.state.write();
            if state.initialized {
                errors.push(sde_call!(self.sde.stop_packet_io(self.device)));
                errors.push(sde_call!(self
                    .sde
                    .unregister_packet_receive_writer(self.device)));
            }
            *state = PacketIoState::default();
        }
        if let Some(handle) = self.rx_thread.lock().take() {
            errors.push(handle.join().map_err(|_| {
                StratumError::Internal(
                    "packet receive thread panicked".to_string(),
                )
            }));
        }
        debug!(self.log, "packet io shut down");
        errors.into_result()
    }
}
