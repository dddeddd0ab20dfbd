//! `devices` subcommand — list connected calculators.

use std::path::Path;

use super::{DevicesOutput, Result, checked_config, hex16, manager, print_json};

pub(super) fn cmd_devices(json: bool, config_path: Option<&Path>) -> Result<()> {
    let devices = manager(checked_config(config_path)?);
    let found = devices.enumerate().unwrap_or_else(|e| {
        log::warn!("enumeration failed: {e}");
        Vec::new()
    });

    if json {
        return print_json(&DevicesOutput {
            count: found.len(),
            devices: found,
        });
    }

    if found.is_empty() {
        println!("No calculators found.");
        return Ok(());
    }

    println!(
        "Found {} calculator{}:",
        found.len(),
        if found.len() == 1 { "" } else { "s" }
    );
    println!();

    for dev in &found {
        println!(
            "  [{}] {} ({}:{})",
            dev.identity,
            dev.name,
            hex16(dev.vendor_id),
            hex16(dev.product_id)
        );
        if dev.flags.needs_drivers {
            println!("      Device not readable; check drivers or udev permissions");
        }
    }

    Ok(())
}
