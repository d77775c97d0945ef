// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `stratumd`, the hardware abstraction
//! daemon for Tofino-based switches.

use std::sync::Arc;

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use structopt::StructOpt;
use tokio::sync::mpsc;

use crate::phal::NullPhal;
use crate::switch::Switch;
use aal::DeviceId;
use common::chassis::ChassisConfig;
use common::chassis::GnmiEvent;
use common::logging::LogFormat;
use common::p4rt::StreamMessageResponse;

mod action_profile_manager;
mod chassis;
mod config;
mod counter_manager;
mod node;
mod packetio_manager;
mod phal;
mod port_map;
mod pre_manager;
mod switch;
mod sync;
mod table_manager;
#[cfg(test)]
mod test_utils;
mod translator;
mod types;
mod writer;

/// The devices managed by the daemon.  Node ids from the chassis config are
/// bound to these in order.
const DEVICES: &[DeviceId] = &[0];

#[derive(Debug, StructOpt)]
#[structopt(name = "stratumd", about = "switch hardware abstraction daemon")]
pub(crate) enum Args {
    /// Run the switch daemon.
    Run(Opt),
    /// Check a chassis config without applying it.
    Verify {
        #[structopt(long, help = "the chassis config to check")]
        chassis_config: String,
    },
}

#[derive(Debug, Default, StructOpt)]
#[structopt(name = "stratumd", about = "switch hardware abstraction daemon")]
pub(crate) struct Opt {
    #[structopt(long, help = "TOML file with default settings")]
    config: Option<String>,

    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<LogFormat>,

    #[structopt(long, help = "chassis config to push at startup")]
    chassis_config: Option<String>,

    #[structopt(
        long,
        help = "forwarding pipeline to push to every node at startup"
    )]
    pipeline_config: Option<String>,

    #[structopt(
        long,
        help = "milliseconds to wait for counter and register syncs"
    )]
    sync_timeout_ms: Option<u64>,

    #[structopt(
        long,
        help = "translate P4Runtime port values (true or false)",
        parse(try_from_str)
    )]
    p4rt_translation: Option<bool>,

    #[structopt(
        long,
        help = "pad translated values read back to their full width",
        parse(try_from_str)
    )]
    legacy_bytestring: Option<bool>,

    #[structopt(long, help = "override the SDE port used as the CPU port")]
    cpu_port: Option<u32>,
}

async fn handle_signals(log: &slog::Logger, mut signals: Signals) {
    let log = log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();
    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT | SIGHUP => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            _ => unreachable!(),
        }
    }
}

// Log every port state change reported by the chassis.
async fn log_events(
    log: slog::Logger,
    mut rx: mpsc::UnboundedReceiver<GnmiEvent>,
) {
    while let Some(event) = rx.recv().await {
        let GnmiEvent::PortOperStateChanged {
            node_id,
            port_id,
            new_state,
            ..
        } = event;
        info!(log, "port state changed";
            "node_id" => node_id,
            "port_id" => port_id,
            "state" => ?new_state);
    }
}

// Log the packets a node punts to the controller.
async fn log_packets(
    log: slog::Logger,
    mut rx: mpsc::UnboundedReceiver<StreamMessageResponse>,
) {
    while let Some(StreamMessageResponse::Packet(packet)) = rx.recv().await {
        debug!(log, "packet in";
            "len" => packet.payload.len(),
            "metadata" => packet.metadata.len());
    }
}

fn push_startup_config(
    log: &slog::Logger,
    switch: &Switch,
    chassis: &ChassisConfig,
    pipeline_config: Option<&str>,
) -> anyhow::Result<()> {
    switch
        .push_chassis_config(chassis)
        .context("pushing chassis config")?;

    for node in &chassis.nodes {
        let (tx, rx) = mpsc::unbounded_channel();
        switch.register_stream_message_response_writer(node.id, Arc::new(tx))?;
        let log =
            log.new(slog::o!("unit" => "packet_in", "node_id" => node.id));
        tokio::spawn(log_packets(log, rx));
    }

    let Some(path) = pipeline_config else {
        return Ok(());
    };
    let pipeline = config::load_pipeline_config(path)?;
    for node in &chassis.nodes {
        switch
            .push_forwarding_pipeline_config(node.id, &pipeline)
            .with_context(|| {
                format!("pushing pipeline to node {}", node.id)
            })?;
    }
    Ok(())
}

async fn run_stratumd(opt: Opt) -> anyhow::Result<()> {
    let config = config::build_config(&opt)?;

    let log = common::logging::init(
        "stratumd",
        &config.log_file,
        config.log_format,
    )?;
    info!(log, "stratumd config: {config:#?}");

    let sde = Arc::new(
        asic::Handle::new(&log, &config.asic_config)
            .context("initializing the SDE")?,
    );
    let switch = Switch::new(
        &log,
        sde,
        Arc::new(NullPhal),
        DEVICES,
        &config.node_settings(),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let events = switch.register_event_notify_writer(Arc::new(events_tx));
    tokio::spawn(log_events(
        log.new(slog::o!("unit" => "gnmi_events")),
        events_rx,
    ));

    match &config.chassis_config {
        Some(path) => {
            let chassis = config::load_chassis_config(path)?;
            push_startup_config(
                &log,
                &switch,
                &chassis,
                config.pipeline_config.as_deref(),
            )?;
        }
        None if config.pipeline_config.is_some() => {
            warn!(log, "ignoring pipeline config without a chassis config");
        }
        None => {}
    }

    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals = Signals::new(SIGNALS).context("installing signal handler")?;
    handle_signals(&log, signals).await;

    info!(log, "shutting down switch");
    if let Err(e) = switch.unregister_event_notify_writer(events) {
        error!(log, "failed to unregister event writer: {e}");
    }
    if let Err(e) = switch.shutdown() {
        error!(log, "shutdown failed: {e}");
    }

    info!(log, "done");
    Ok(())
}

fn verify_chassis_config(path: &str) -> anyhow::Result<()> {
    let log = common::logging::init("stratumd", &None, LogFormat::Human)?;
    let chassis = config::load_chassis_config(path)?;
    let sde = Arc::new(asic::Handle::new(&log, &Default::default())?);
    let switch = Switch::new(
        &log,
        sde,
        Arc::new(NullPhal),
        DEVICES,
        &Default::default(),
    );
    switch
        .verify_chassis_config(&chassis)
        .with_context(|| format!("verifying {path}"))?;
    info!(log, "chassis config is valid"; "path" => path);
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    match args {
        Args::Run(opt) => run_stratumd(opt).await,
        Args::Verify { chassis_config } => {
            verify_chassis_config(&chassis_config)
        }
    }
}
