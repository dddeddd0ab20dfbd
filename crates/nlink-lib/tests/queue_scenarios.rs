//! Integration tests: command queues driven through `Devices` with mock USB and engine.
//!
//! Every scenario opens a mock calculator, so each command travels the full
//! path: executor → engine worker → bridge client → pump → mock capability.

use std::sync::Arc;
use std::time::Duration;

use nlink_lib::capability::mock::MockHost;
use nlink_lib::capability::{DeviceIdentity, UsbHost};
use nlink_lib::config::Config;
use nlink_lib::devices::Devices;
use nlink_lib::engine::mock::MockState;
use nlink_lib::info::FileInfo;
use nlink_lib::protocol::NSPIRE_PID;
use nlink_lib::queue::{self, Action};
use nlink_lib::registry::{DeviceEvent, DeviceState, Progress};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    devices: Devices,
    state: Arc<MockState>,
    id: DeviceIdentity,
}

fn open_rig() -> Rig {
    let host: Arc<dyn UsbHost> = Arc::new(MockHost::with_calculator(5, NSPIRE_PID));
    let state = MockState::new();
    let devices = Devices::new(host, state.factory(), Config::default());
    let id = DeviceIdentity::new(1, 5);
    devices.enumerate().unwrap();
    devices.open(id).unwrap();
    Rig { devices, state, id }
}

impl Rig {
    fn wait_idle(&self) {
        let idle = self.devices.registry().wait_for(self.id, WAIT, |s| {
            s.is_some_and(|s| s.queue.is_empty() && !s.running && s.state == DeviceState::Opened)
        });
        assert!(idle, "queue did not drain");
    }

    /// Operations the engine ran, minus listings and info refreshes.
    fn mutations(&self) -> Vec<String> {
        self.state
            .ops()
            .into_iter()
            .filter(|op| !op.starts_with("listDir") && op != "updateDevice")
            .collect()
    }
}

fn create(path: &str) -> Action {
    Action::CreateDir {
        path: path.to_string(),
    }
}

// ── Ordering ──

#[test]
fn commands_run_in_order_and_failures_do_not_stop_the_queue() {
    let rig = open_rig();
    rig.state.fail("createDir /b");
    let events = rig.devices.registry().subscribe();

    let ids = rig
        .devices
        .enqueue(rig.id, vec![create("/a"), create("/b"), create("/c")])
        .unwrap();
    rig.wait_idle();

    assert_eq!(
        rig.mutations(),
        vec!["createDir /a", "createDir /b", "createDir /c"]
    );
    assert!(rig.state.exists("/a"));
    assert!(!rig.state.exists("/b"));
    assert!(rig.state.exists("/c"));

    let finished: Vec<(u64, bool)> = events
        .try_iter()
        .filter_map(|e| match e {
            DeviceEvent::CmdFinished { id, ok, .. } => Some((id, ok)),
            _ => None,
        })
        .collect();
    assert_eq!(
        finished,
        vec![(ids[0], true), (ids[1], false), (ids[2], true)]
    );
}

#[test]
fn info_is_refreshed_after_every_command() {
    let rig = open_rig();
    rig.devices
        .enqueue(rig.id, vec![create("/a"), create("/b")])
        .unwrap();
    rig.wait_idle();
    let refreshes = rig
        .state
        .ops()
        .iter()
        .filter(|op| *op == "updateDevice")
        .count();
    // one on open, one per command
    assert_eq!(refreshes, 3);
}

// ── Executor exclusivity ──

#[test]
fn at_most_one_executor_per_device() {
    let rig = open_rig();
    let hold = rig.state.hold("createDir");

    rig.devices.enqueue(rig.id, vec![create("/a")]).unwrap();
    hold.entered.recv_timeout(WAIT).unwrap();

    assert!(rig.devices.run(rig.id).is_none());
    rig.devices
        .enqueue(rig.id, vec![create("/b"), create("/c")])
        .unwrap();
    let snap = rig.devices.registry().snapshot(rig.id).unwrap();
    assert!(snap.running);
    assert_eq!(snap.queue.len(), 3);

    hold.release.send(()).unwrap();
    rig.wait_idle();
    assert_eq!(
        rig.mutations(),
        vec!["createDir /a", "createDir /b", "createDir /c"]
    );
}

#[test]
fn devices_queue_independently() {
    let host = Arc::new(MockHost::with_calculator(5, NSPIRE_PID));
    host.plug(nlink_lib::capability::mock::calculator(6, NSPIRE_PID));
    let state = MockState::new();
    let devices = Devices::new(
        Arc::clone(&host) as Arc<dyn UsbHost>,
        state.factory(),
        Config::default(),
    );
    let (a, b) = (DeviceIdentity::new(1, 5), DeviceIdentity::new(1, 6));
    devices.enumerate().unwrap();
    devices.open(a).unwrap();
    devices.open(b).unwrap();

    let hold = state.hold("createDir");
    devices.create_dir(a, "/slow").unwrap();
    hold.entered.recv_timeout(WAIT).unwrap();

    // b's queue drains while a is stuck
    devices.create_dir(b, "/fast").unwrap();
    assert!(devices.registry().wait_for(b, WAIT, |s| {
        s.is_some_and(|s| s.queue.is_empty() && !s.running)
    }));
    assert!(state.exists("/fast"));
    assert!(!state.exists("/slow"));

    hold.release.send(()).unwrap();
    assert!(devices.registry().wait_for(a, WAIT, |s| {
        s.is_some_and(|s| s.queue.is_empty() && !s.running)
    }));
    assert!(state.exists("/slow"));
}

// ── Removal ──

#[test]
fn removal_mid_run_stops_the_executor() {
    let rig = open_rig();
    let registry = rig.devices.registry();
    let hold = rig.state.hold("createDir");

    registry
        .enqueue(rig.id, vec![create("/a"), create("/b")])
        .unwrap();
    let executor = queue::run(registry, rig.id).unwrap();
    hold.entered.recv_timeout(WAIT).unwrap();

    assert!(rig.devices.close(rig.id));
    hold.release.send(()).unwrap();
    executor.join().unwrap();

    assert_eq!(rig.mutations(), vec!["createDir /a"]);
    assert!(registry.snapshot(rig.id).is_none());
}

#[test]
fn stale_executor_leaves_reinserted_device_alone() {
    let rig = open_rig();
    let registry = rig.devices.registry();
    let hold = rig.state.hold("createDir");

    registry.enqueue(rig.id, vec![create("/a")]).unwrap();
    let stale = queue::run(registry, rig.id).unwrap();
    hold.entered.recv_timeout(WAIT).unwrap();

    // same bus:address comes back while the old command is still running
    assert!(rig.devices.close(rig.id));
    rig.devices.enumerate().unwrap();
    rig.devices.create_dir(rig.id, "/b").unwrap();
    assert_eq!(registry.snapshot(rig.id).unwrap().queue.len(), 1);

    hold.release.send(()).unwrap();
    stale.join().unwrap();

    let snap = registry.snapshot(rig.id).unwrap();
    assert_eq!(snap.queue.len(), 1);
    assert!(!snap.running);
    assert_eq!(snap.state, DeviceState::Discovered);
    assert!(!rig.state.exists("/b"));

    rig.devices.open(rig.id).unwrap();
    rig.wait_idle();
    assert_eq!(rig.mutations(), vec!["createDir /a", "createDir /b"]);
    assert!(rig.state.exists("/b"));
}

// ── Delete expansion ──

#[test]
fn delete_then_create_runs_children_first() {
    let rig = open_rig();
    rig.state.add_dir("/a");
    rig.state.add_file("/a/1.tns", b"one");

    rig.devices.delete(rig.id, &[FileInfo::dir("/a")]).unwrap();
    rig.devices.create_dir(rig.id, "/b").unwrap();
    rig.wait_idle();

    assert_eq!(
        rig.mutations(),
        vec!["deleteFile /a/1.tns", "deleteDir /a", "createDir /b"]
    );
    assert!(!rig.state.exists("/a"));
    assert!(rig.state.exists("/b"));
}

// ── Progress ──

#[test]
fn progress_is_cleared_between_downloads() {
    let rig = open_rig();
    rig.state.add_file("/one.tns", &[1; 40]);
    rig.state.add_file("/two.tns", &[2; 20]);
    let dir = tempfile::tempdir().unwrap();
    let events = rig.devices.registry().subscribe();

    let ids = rig
        .devices
        .download_files(
            rig.id,
            vec![("/one.tns".into(), 40), ("/two.tns".into(), 20)],
            dir.path(),
        )
        .unwrap();
    rig.wait_idle();

    let seen: Vec<DeviceEvent> = events
        .try_iter()
        .filter(|e| {
            matches!(
                e,
                DeviceEvent::ProgressSet(..)
                    | DeviceEvent::ProgressCleared(_)
                    | DeviceEvent::CmdFinished { .. }
            )
        })
        .collect();
    let p = |remaining, total| DeviceEvent::ProgressSet(rig.id, Progress { remaining, total });
    let finished = |id| DeviceEvent::CmdFinished {
        device: rig.id,
        id,
        ok: true,
    };
    // 16-byte chunks, every sixth update forwarded plus the last
    assert_eq!(
        seen,
        vec![
            p(24, 40),
            p(0, 40),
            DeviceEvent::ProgressCleared(rig.id),
            finished(ids[0]),
            p(4, 20),
            p(0, 20),
            DeviceEvent::ProgressCleared(rig.id),
            finished(ids[1]),
        ]
    );
    assert_eq!(std::fs::read(dir.path().join("one.tns")).unwrap(), [1; 40]);
    assert_eq!(std::fs::read(dir.path().join("two.tns")).unwrap(), [2; 20]);
    assert!(rig
        .devices
        .registry()
        .snapshot(rig.id)
        .unwrap()
        .progress
        .is_none());
}

#[test]
fn failed_download_leaves_no_file() {
    let rig = open_rig();
    let dir = tempfile::tempdir().unwrap();
    rig.devices
        .download_files(rig.id, vec![("/missing.tns".into(), 10)], dir.path())
        .unwrap();
    rig.wait_idle();
    assert!(!dir.path().join("missing.tns").exists());
}
