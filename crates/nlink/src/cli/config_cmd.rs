//! `config` subcommand — show current configuration and file path, or write
//! a fresh config file with `--init`.

use std::path::Path;

use nlink_lib::NlinkError;

use super::{Config, ConfigOutput, Result, hex16, kv, kv_indent, kv_width, print_json};

pub(super) fn cmd_config(json: bool, init: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);

    if init {
        write_initial(&config, custom_path, config_path.as_deref())?;
    }

    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        });
    }

    let w = kv_width(
        &["Config file:"],
        &[
            "mailbox_capacity:",
            "vendor_id:",
            "product_ids:",
            "progress_interval:",
            "watch_interval_ms:",
        ],
    );

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent(
        "mailbox_capacity:",
        format_args!("{} bytes", config.mailbox_capacity),
        w,
    );
    kv_indent("vendor_id:", hex16(config.vendor_id), w);
    let products: Vec<String> = config.product_ids.iter().copied().map(hex16).collect();
    kv_indent("product_ids:", products.join(", "), w);
    kv_indent("progress_interval:", config.progress_interval, w);
    kv_indent(
        "watch_interval_ms:",
        format_args!("{} ms", config.watch_interval_ms),
        w,
    );

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}

/// Save `config` to the custom path or the platform default. An existing
/// file is never overwritten.
fn write_initial(config: &Config, custom_path: Option<&Path>, target: Option<&Path>) -> Result<()> {
    let Some(target) = target else {
        return Err(NlinkError::Config("no config directory".into()));
    };
    if target.exists() {
        return Err(NlinkError::Config(format!(
            "{} already exists",
            target.display()
        )));
    }
    match custom_path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    log::info!("wrote {}", target.display());
    Ok(())
}
