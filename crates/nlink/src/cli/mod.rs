//! CLI subcommands — device listing, descriptor probing, hot-plug watching.

mod config_cmd;
mod devices;
mod probe;
mod watch;

use std::path::Path;
use std::sync::Arc;

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use nlink_lib::capability::{DeviceIdentity, EnumeratedDevice, platform_host};
pub(super) use nlink_lib::config::Config;
pub(super) use nlink_lib::devices::Devices;
pub(super) use nlink_lib::error::Result;
use nlink_lib::NlinkError;
use nlink_lib::client::BridgeClient;
use nlink_lib::engine::{EngineError, EngineFactory, EngineInit, ProtocolEngine};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

pub(super) fn hex16(value: u16) -> String {
    format!("0x{value:04X}")
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| NlinkError::Config(format!("JSON output: {e}")))?;
    println!("{text}");
    Ok(())
}

// ── Config & device manager ──

/// Load the config from `custom_path` or the platform default, logging parse warnings.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    match custom_path {
        Some(path) => {
            let (config, warnings) = Config::load_from(path);
            for w in &warnings {
                log::warn!("{w}");
            }
            config
        }
        None => Config::load(),
    }
}

/// Like [`load_config`], but refuses a config that does not validate.
pub(super) fn checked_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = load_config(custom_path);
    if let Err(errors) = config.validate() {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(NlinkError::Config(joined.join("; ")));
    }
    Ok(config)
}

/// Device manager over the platform USB host. The CLI only enumerates and
/// probes, so its engine factory refuses to build anything.
pub(super) fn manager(config: Config) -> Devices {
    let refuse: EngineFactory = Arc::new(
        |_client: BridgeClient,
         _init: &EngineInit|
         -> nlink_lib::engine::Result<Box<dyn ProtocolEngine>> {
            Err(EngineError::Protocol(
                "nlink-cli has no protocol engine".into(),
            ))
        },
    );
    Devices::new(Arc::new(platform_host()), refuse, config)
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<EnumeratedDevice>,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct WatchEventJson {
    pub event: &'static str,
    pub device: DeviceIdentity,
    pub name: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List connected calculators
    Devices,

    /// Open a calculator through the bridge and print its active configuration
    Probe {
        /// Device position as bus:address (see `devices`)
        device: DeviceIdentity,
    },

    /// Print calculators as they are plugged in and removed (Ctrl+C to stop)
    Watch,

    /// Show current configuration and file path
    Config {
        /// Write a config file with the current settings if none exists yet
        #[arg(long)]
        init: bool,
    },
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json, config_path),
        Command::Probe { device } => probe::cmd_probe(device, json, config_path),
        Command::Watch => watch::cmd_watch(json, config_path),
        Command::Config { init } => config_cmd::cmd_config(json, init, config_path),
    }
}

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn kv_width_top_only() {
        let w = kv_width(&["Short:", "Longer key:"], &[]);
        assert_eq!(w, 13);
    }

    #[test]
    fn kv_width_indent_drives_width() {
        // Indent key needs +2 for the prefix
        let w = kv_width(&["A:"], &["Very long indent key:"]);
        assert_eq!(w, 25);
    }

    #[test]
    fn kv_width_empty_both() {
        assert_eq!(kv_width(&[], &[]), 0);
    }

    #[test]
    fn values_align_across_levels() {
        let w = kv_width(&["Top:"], &["Indent:"]);
        let top = format_kv("Top:", "V", w);
        let indent = format!("  {:<width$}{}", "Indent:", "V", width = w - 2);
        assert_eq!(top.find('V'), indent.find('V'));
    }

    #[test]
    fn format_kv_overlong_key_gets_no_padding() {
        assert_eq!(format_kv("ExactWidth:", "val", 10), "ExactWidth:val");
    }

    #[test]
    fn hex16_pads() {
        assert_eq!(hex16(0x451), "0x0451");
        assert_eq!(hex16(0xE012), "0xE012");
    }
}
