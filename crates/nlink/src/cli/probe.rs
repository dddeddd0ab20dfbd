//! `probe` subcommand — read a calculator's active configuration over the bridge.

use std::path::Path;

use nlink_lib::protocol::ENDPOINT_DIR_IN;

use super::{
    DeviceIdentity, Result, checked_config, kv, kv_indent, kv_width, manager, print_json,
};

pub(super) fn cmd_probe(
    device: DeviceIdentity,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let devices = manager(checked_config(config_path)?);
    let config = devices.probe(device)?;

    if json {
        return print_json(&config);
    }

    let w = kv_width(
        &["Device:", "Configuration:"],
        &["Interface:", "Class:", "Endpoint:"],
    );
    kv("Device:", device, w);
    kv("Configuration:", config.configuration_value, w);

    for (number, alternates) in config.interfaces.iter().enumerate() {
        for alt in alternates {
            println!();
            kv_indent(
                "Interface:",
                format_args!("{number} (alt {})", alt.alternate_setting),
                w,
            );
            kv_indent(
                "Class:",
                format_args!(
                    "0x{:02X} / 0x{:02X} / 0x{:02X}",
                    alt.interface_class, alt.interface_subclass, alt.interface_protocol
                ),
                w,
            );
            for ep in &alt.endpoints {
                let dir = if ep.address & ENDPOINT_DIR_IN != 0 { "IN" } else { "OUT" };
                kv_indent(
                    "Endpoint:",
                    format_args!("0x{:02X} {dir}, {} bytes", ep.address, ep.packet_size),
                    w,
                );
            }
        }
    }
    Ok(())
}
