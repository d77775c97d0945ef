// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `stratumd`.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::switch::NodeSettings;
use aal::DeviceConfig;
use asic::AsicConfig;
use common::chassis::ChassisConfig;
use common::logging::LogFormat;
use common::p4info::P4Info;
use common::p4rt::ForwardingPipelineConfig;

/// The Config structure captures all of the run-time settings that can be
/// set in a config file or with command-line options.
#[derive(Debug)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: LogFormat,

    /// The chassis config to push at startup.
    pub chassis_config: Option<String>,

    /// The forwarding pipeline to push at startup, once the chassis is
    /// configured.
    pub pipeline_config: Option<String>,

    /// How long to wait for the SDE to sync counter or register values.
    pub sync_timeout: Duration,

    /// Translate P4Runtime values of translated types, such as ports.
    pub p4rt_translation: bool,

    /// Return translated values padded to their full width on reads.
    pub legacy_bytestring: bool,

    /// Asic/platform-specific config settings.
    pub asic_config: AsicConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: LogFormat::Json,
            chassis_config: None,
            pipeline_config: None,
            sync_timeout: Duration::from_secs(1),
            p4rt_translation: true,
            legacy_bytestring: false,
            asic_config: AsicConfig::default(),
        }
    }
}

impl Config {
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            sync_timeout: self.sync_timeout,
            translation_enabled: self.p4rt_translation,
            legacy_bytestring: self.legacy_bytestring,
        }
    }
}

/// The settings that may appear in a config file.  Anything left out keeps
/// its default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    log_file: Option<String>,
    log_format: Option<LogFormat>,
    chassis_config: Option<String>,
    pipeline_config: Option<String>,
    sync_timeout_ms: Option<u64>,
    p4rt_translation: Option<bool>,
    legacy_bytestring: Option<bool>,
    cpu_port: Option<u32>,
}

fn update_from_file(path: &str, config: &mut Config) -> anyhow::Result<()> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path}"))?;
    let file: ConfigFile = toml::from_str(&txt)
        .with_context(|| format!("parsing config file {path}"))?;

    if let Some(log_file) = file.log_file {
        config.log_file = Some(log_file);
    }
    if let Some(log_format) = file.log_format {
        config.log_format = log_format;
    }
    if let Some(chassis_config) = file.chassis_config {
        config.chassis_config = Some(chassis_config);
    }
    if let Some(pipeline_config) = file.pipeline_config {
        config.pipeline_config = Some(pipeline_config);
    }
    if let Some(ms) = file.sync_timeout_ms {
        config.sync_timeout = Duration::from_millis(ms);
    }
    if let Some(translation) = file.p4rt_translation {
        config.p4rt_translation = translation;
    }
    if let Some(legacy) = file.legacy_bytestring {
        config.legacy_bytestring = legacy;
    }
    if let Some(cpu_port) = file.cpu_port {
        config.asic_config.cpu_port = Some(cpu_port);
    }
    Ok(())
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &crate::Opt, config: &mut Config) {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(chassis_config) = &opts.chassis_config {
        config.chassis_config = Some(chassis_config.to_string());
    }

    if let Some(pipeline_config) = &opts.pipeline_config {
        config.pipeline_config = Some(pipeline_config.to_string());
    }

    if let Some(ms) = opts.sync_timeout_ms {
        config.sync_timeout = Duration::from_millis(ms);
    }

    if let Some(translation) = opts.p4rt_translation {
        config.p4rt_translation = translation;
    }

    if let Some(legacy) = opts.legacy_bytestring {
        config.legacy_bytestring = legacy;
    }

    if let Some(cpu_port) = opts.cpu_port {
        config.asic_config.cpu_port = Some(cpu_port);
    }
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior.  The defaults are overridden by the config
/// file, if one is named, and then by any command-line options.
pub(crate) fn build_config(opts: &crate::Opt) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(path) = &opts.config {
        update_from_file(path, &mut config)?;
    }
    update_from_cli(opts, &mut config);
    Ok(config)
}

/// Read a chassis config.  Files ending in `.json` are parsed as JSON, and
/// anything else as TOML.
pub(crate) fn load_chassis_config(path: &str) -> anyhow::Result<ChassisConfig> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("reading chassis config {path}"))?;
    let is_json = Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = match is_json {
        true => serde_json::from_str(&txt)
            .with_context(|| format!("parsing chassis config {path}"))?,
        false => toml::from_str(&txt)
            .with_context(|| format!("parsing chassis config {path}"))?,
    };
    Ok(config)
}

/// A forwarding pipeline as stored on disk.
#[derive(Debug, Deserialize)]
struct PipelineFile {
    p4info: P4Info,
    device_config: DeviceConfig,
}

/// Read a forwarding pipeline from a JSON file holding the P4Info and the
/// device config.
pub(crate) fn load_pipeline_config(
    path: &str,
) -> anyhow::Result<ForwardingPipelineConfig> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config {path}"))?;
    let file: PipelineFile = serde_json::from_str(&txt)
        .with_context(|| format!("parsing pipeline config {path}"))?;
    let p4_device_config = file
        .device_config
        .to_bytes()
        .context("encoding device config")?;
    Ok(ForwardingPipelineConfig {
        p4info: Some(file.p4info),
        p4_device_config,
    })
}
