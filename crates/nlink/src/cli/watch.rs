//! `watch` subcommand — report calculators as they come and go.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use nlink_lib::registry::DeviceEvent;

use super::{
    DeviceIdentity, RUNNING, Result, WatchEventJson, checked_config, manager, print_json,
};

const TICK: Duration = Duration::from_millis(50);

pub(super) fn cmd_watch(json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = checked_config(config_path)?;
    let interval = Duration::from_millis(config.watch_interval_ms);
    let devices = manager(config);
    let events = devices.registry().subscribe();
    let mut names: BTreeMap<DeviceIdentity, String> = BTreeMap::new();

    if !json {
        println!("Watching for calculators (Ctrl+C to stop)...");
    }

    while RUNNING.load(Ordering::SeqCst) {
        if let Err(e) = devices.poll() {
            log::warn!("enumeration failed: {e}");
        }

        for event in events.try_iter() {
            let (kind, device, name) = match event {
                DeviceEvent::Added(id) => {
                    let name = devices.registry().snapshot(id).map(|s| s.name);
                    if let Some(name) = &name {
                        names.insert(id, name.clone());
                    }
                    ("added", id, name)
                }
                DeviceEvent::Removed(id) => ("removed", id, names.remove(&id)),
                _ => continue,
            };

            if json {
                print_json(&WatchEventJson {
                    event: kind,
                    device,
                    name,
                })?;
            } else {
                let sign = if kind == "added" { '+' } else { '-' };
                println!("{sign} {device} {}", name.as_deref().unwrap_or("(unknown)"));
            }
        }

        let deadline = Instant::now() + interval;
        while RUNNING.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(TICK);
        }
    }

    log::debug!("watch stopped");
    Ok(())
}
