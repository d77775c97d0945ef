// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Construction of the root logger shared by the daemons in this workspace.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Logger;

/// The output format for log records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colorless output meant to be read by a person.
    Human,
    /// Bunyan-style JSON records, one per line.
    #[default]
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

fn human_drain<W>(out: W) -> slog_async::Async
where
    W: std::io::Write + Send + 'static,
{
    let decorator = slog_term::PlainDecorator::new(out);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog_async::Async::new(drain).chan_size(0x2000).build()
}

fn json_drain<W>(name: &'static str, out: W) -> slog_async::Async
where
    W: std::io::Write + Send + 'static,
{
    let drain = slog_bunyan::with_name(name, out).build().fuse();
    slog_async::Async::new(drain).chan_size(0x2000).build()
}

/// Build the root logger for the daemon `name`.  Records are written to
/// `log_file` when one is given, and to stdout otherwise.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            match log_format {
                LogFormat::Human => human_drain(file),
                LogFormat::Json => json_drain(name, file),
            }
        }
        None => match log_format {
            LogFormat::Human => human_drain(std::io::stdout()),
            LogFormat::Json => json_drain(name, std::io::stdout()),
        },
    };

    Ok(Logger::root(drain.fuse(), slog::o!("name" => name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("human".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Human.to_string(), "human");
    }
}
