//! Device registry: one entry per connected calculator.
//!
//! Every change goes through a named transition that updates the entry under
//! the registry mutex, wakes [`Registry::wait_for`] callers and publishes a
//! [`DeviceEvent`] to subscribers. The mutex is never held across an engine
//! call; callers get cloned handles and snapshots instead.
//!
//! Each inserted entry gets a fresh generation. Work started against one
//! entry (an open, an executor, a pump's progress callback) carries that
//! generation, and its transitions do nothing once the entry has been
//! removed, even if a device with the same identity was inserted since.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::capability::{DeviceIdentity, EnumeratedDevice, VariantFlags};
use crate::engine::EngineHandle;
use crate::info::Info;
use crate::queue::{Action, Cmd};

/// Transfer progress of the running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub remaining: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Known, no engine attached.
    Discovered,
    Opened,
    /// Opened, with an info refresh outstanding.
    Updating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(DeviceIdentity),
    Removed(DeviceIdentity),
    Opened(DeviceIdentity),
    UpdateStarted(DeviceIdentity),
    UpdateFinished { device: DeviceIdentity, ok: bool },
    ProgressSet(DeviceIdentity, Progress),
    ProgressCleared(DeviceIdentity),
    Enqueued { device: DeviceIdentity, ids: Vec<u64> },
    QueueStarted(DeviceIdentity),
    CmdFinished { device: DeviceIdentity, id: u64, ok: bool },
    QueueIdle(DeviceIdentity),
}

impl DeviceEvent {
    pub fn device(&self) -> DeviceIdentity {
        match self {
            DeviceEvent::Added(d)
            | DeviceEvent::Removed(d)
            | DeviceEvent::Opened(d)
            | DeviceEvent::UpdateStarted(d)
            | DeviceEvent::ProgressSet(d, _)
            | DeviceEvent::ProgressCleared(d)
            | DeviceEvent::QueueStarted(d)
            | DeviceEvent::QueueIdle(d) => *d,
            DeviceEvent::UpdateFinished { device, .. }
            | DeviceEvent::Enqueued { device, .. }
            | DeviceEvent::CmdFinished { device, .. } => *device,
        }
    }
}

/// Read-only view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub flags: VariantFlags,
    pub state: DeviceState,
    pub info: Option<Info>,
    pub progress: Option<Progress>,
    pub queue: Vec<Cmd>,
    pub running: bool,
}

/// What the queue executor should do next.
#[derive(Debug)]
pub enum NextCmd {
    /// The device is gone (closed or unplugged).
    Gone,
    /// The queue is empty; the running flag has been cleared.
    Idle,
    Run(Cmd, EngineHandle),
}

struct DeviceEntry {
    device: EnumeratedDevice,
    generation: u64,
    engine: Option<EngineHandle>,
    info: Option<Info>,
    progress: Option<Progress>,
    queue: VecDeque<Cmd>,
    running: bool,
    updating: bool,
    /// An open is in flight; no other open may start.
    opening: bool,
}

impl DeviceEntry {
    fn state(&self) -> DeviceState {
        match (&self.engine, self.updating) {
            (None, _) => DeviceState::Discovered,
            (Some(_), true) => DeviceState::Updating,
            (Some(_), false) => DeviceState::Opened,
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            identity: self.device.identity,
            name: self.device.name.clone(),
            vendor_id: self.device.vendor_id,
            product_id: self.device.product_id,
            flags: self.device.flags,
            state: self.state(),
            info: self.info.clone(),
            progress: self.progress,
            queue: self.queue.iter().cloned().collect(),
            running: self.running,
        }
    }
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<DeviceIdentity, DeviceEntry>,
    subscribers: Vec<Sender<DeviceEvent>>,
}

impl Inner {
    fn publish(&mut self, event: DeviceEvent) {
        log::debug!("{event:?}");
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
    changed: Condvar,
    next_cmd_id: AtomicU64,
    next_generation: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the entry for `identity`. Returns `None` if there is no entry.
    /// Publishes whatever event `f` returns and wakes waiters.
    fn transition<T>(
        &self,
        identity: DeviceIdentity,
        f: impl FnOnce(&mut DeviceEntry) -> (T, Option<DeviceEvent>),
    ) -> Option<T> {
        let mut inner = self.lock();
        let entry = inner.devices.get_mut(&identity)?;
        let (out, event) = f(entry);
        if let Some(event) = event {
            inner.publish(event);
        }
        drop(inner);
        self.changed.notify_all();
        Some(out)
    }

    /// Like [`Registry::transition`], but only for the entry of `generation`.
    fn transition_at<T>(
        &self,
        identity: DeviceIdentity,
        generation: u64,
        f: impl FnOnce(&mut DeviceEntry) -> (T, Option<DeviceEvent>),
    ) -> Option<T> {
        self.transition(identity, |e| {
            if e.generation != generation {
                return (None, None);
            }
            let (out, event) = f(e);
            (Some(out), event)
        })
        .flatten()
    }

    // ── Lifecycle ──

    /// Add a discovered device. An existing entry is left untouched.
    pub fn insert(&self, device: EnumeratedDevice) -> bool {
        let identity = device.identity;
        let mut inner = self.lock();
        if inner.devices.contains_key(&identity) {
            return false;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        inner.devices.insert(
            identity,
            DeviceEntry {
                device,
                generation,
                engine: None,
                info: None,
                progress: None,
                queue: VecDeque::new(),
                running: false,
                updating: false,
                opening: false,
            },
        );
        inner.publish(DeviceEvent::Added(identity));
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Drop the entry, its engine handle and its queue.
    pub fn remove(&self, identity: DeviceIdentity) -> bool {
        let mut inner = self.lock();
        if inner.devices.remove(&identity).is_none() {
            return false;
        }
        inner.publish(DeviceEvent::Removed(identity));
        drop(inner);
        self.changed.notify_all();
        true
    }

    pub fn contains(&self, identity: DeviceIdentity) -> bool {
        self.lock().devices.contains_key(&identity)
    }

    /// Generation of the current entry for `identity`.
    pub fn generation(&self, identity: DeviceIdentity) -> Option<u64> {
        self.lock().devices.get(&identity).map(|e| e.generation)
    }

    /// Claim the right to open the device. `None` if it is unknown, already
    /// open, or another open is in flight.
    pub fn begin_open(&self, identity: DeviceIdentity) -> Option<u64> {
        self.transition(identity, |e| {
            if e.opening || e.engine.is_some() {
                return (None, None);
            }
            e.opening = true;
            (Some(e.generation), None)
        })
        .flatten()
    }

    /// Give up an open claimed with [`Registry::begin_open`].
    pub fn abort_open(&self, identity: DeviceIdentity, generation: u64) {
        self.transition_at(identity, generation, |e| {
            e.opening = false;
            ((), None)
        });
    }

    /// Finish an open. False if the entry was removed meanwhile; the engine
    /// is dropped then.
    pub fn attach_engine(
        &self,
        identity: DeviceIdentity,
        generation: u64,
        engine: EngineHandle,
    ) -> bool {
        self.transition_at(identity, generation, |e| {
            e.opening = false;
            e.engine = Some(engine);
            ((), Some(DeviceEvent::Opened(identity)))
        })
        .is_some()
    }

    pub fn engine(&self, identity: DeviceIdentity) -> Option<EngineHandle> {
        self.lock()
            .devices
            .get(&identity)
            .and_then(|e| e.engine.clone())
    }

    /// Mark an info refresh as outstanding and hand out the engine to run it on.
    pub fn begin_update(&self, identity: DeviceIdentity, generation: u64) -> Option<EngineHandle> {
        self.transition_at(identity, generation, |e| match e.engine.clone() {
            Some(engine) => {
                e.updating = true;
                (Some(engine), Some(DeviceEvent::UpdateStarted(identity)))
            }
            None => (None, None),
        })
        .flatten()
    }

    /// End an info refresh. `None` keeps the previous snapshot.
    pub fn finish_update(&self, identity: DeviceIdentity, generation: u64, info: Option<Info>) {
        self.transition_at(identity, generation, |e| {
            e.updating = false;
            let ok = info.is_some();
            if info.is_some() {
                e.info = info;
            }
            ((), Some(DeviceEvent::UpdateFinished { device: identity, ok }))
        });
    }

    pub fn set_progress(&self, identity: DeviceIdentity, generation: u64, progress: Progress) {
        self.transition_at(identity, generation, |e| {
            e.progress = Some(progress);
            ((), Some(DeviceEvent::ProgressSet(identity, progress)))
        });
    }

    pub fn clear_progress(&self, identity: DeviceIdentity, generation: u64) {
        self.transition_at(identity, generation, |e| {
            let event = e
                .progress
                .take()
                .map(|_| DeviceEvent::ProgressCleared(identity));
            ((), event)
        });
    }

    // ── Queue ──

    /// Append actions as commands with fresh ids. `None` if the device is unknown.
    pub fn enqueue(&self, identity: DeviceIdentity, actions: Vec<Action>) -> Option<Vec<u64>> {
        self.transition(identity, |e| {
            let ids: Vec<u64> = actions
                .into_iter()
                .map(|action| {
                    let id = self.next_cmd_id.fetch_add(1, Ordering::Relaxed);
                    e.queue.push_back(Cmd { id, action });
                    id
                })
                .collect();
            let event = DeviceEvent::Enqueued {
                device: identity,
                ids: ids.clone(),
            };
            (ids, Some(event))
        })
    }

    /// Claim the executor slot and return the entry's generation. `None` if
    /// the device is missing, has no engine, or already has an executor.
    pub fn try_start(&self, identity: DeviceIdentity) -> Option<u64> {
        self.transition(identity, |e| {
            if e.running || e.engine.is_none() {
                return (None, None);
            }
            e.running = true;
            (Some(e.generation), Some(DeviceEvent::QueueStarted(identity)))
        })
        .flatten()
    }

    /// Give the executor slot back without draining the queue.
    pub fn release(&self, identity: DeviceIdentity, generation: u64) {
        self.transition_at(identity, generation, |e| {
            e.running = false;
            ((), None)
        });
    }

    /// Peek the head command without removing it. An entry of another
    /// generation counts as gone.
    pub fn next_cmd(&self, identity: DeviceIdentity, generation: u64) -> NextCmd {
        self.transition_at(identity, generation, |e| {
            let Some(engine) = e.engine.clone() else {
                e.running = false;
                return (NextCmd::Gone, None);
            };
            match e.queue.front() {
                Some(cmd) => (NextCmd::Run(cmd.clone(), engine), None),
                None => {
                    e.running = false;
                    (NextCmd::Idle, Some(DeviceEvent::QueueIdle(identity)))
                }
            }
        })
        .unwrap_or(NextCmd::Gone)
    }

    /// Remove the head command once it has finished, successfully or not.
    /// `None` if the entry of `generation` is gone.
    pub fn complete_head(
        &self,
        identity: DeviceIdentity,
        generation: u64,
        ok: bool,
    ) -> Option<Cmd> {
        self.transition_at(identity, generation, |e| match e.queue.pop_front() {
            Some(cmd) => {
                let event = DeviceEvent::CmdFinished {
                    device: identity,
                    id: cmd.id,
                    ok,
                };
                (Some(cmd), Some(event))
            }
            None => (None, None),
        })
        .flatten()
    }

    // ── Observation ──

    pub fn snapshot(&self, identity: DeviceIdentity) -> Option<DeviceSnapshot> {
        self.lock().devices.get(&identity).map(DeviceEntry::snapshot)
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.lock()
            .devices
            .values()
            .map(DeviceEntry::snapshot)
            .collect()
    }

    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.lock().devices.keys().copied().collect()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Block until `pred` holds for the device's snapshot (`None` when absent),
    /// or `timeout` passes. Returns whether `pred` held.
    pub fn wait_for(
        &self,
        identity: DeviceIdentity,
        timeout: Duration,
        mut pred: impl FnMut(Option<&DeviceSnapshot>) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let snapshot = inner.devices.get(&identity).map(DeviceEntry::snapshot);
            if pred(snapshot.as_ref()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::calculator;
    use crate::engine::spawn_worker;
    use crate::engine::mock::{MockState, sample_info};
    use crate::protocol::{NSPIRE_PID, NSPIRE_PID_CX2};
    use std::sync::Arc;

    fn id(address: u8) -> DeviceIdentity {
        DeviceIdentity::new(1, address)
    }

    /// An engine handle whose worker is never initialized; enough for registry bookkeeping.
    fn idle_engine() -> EngineHandle {
        let (tx, _rx) = mpsc::channel();
        let (handle, _join) = spawn_worker("registry-test".into(), MockState::new().factory(), tx, 6)
            .unwrap();
        handle
    }

    fn action(path: &str) -> Action {
        Action::CreateDir {
            path: path.to_string(),
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let reg = Registry::new();
        assert!(reg.insert(calculator(2, NSPIRE_PID)));
        assert!(!reg.insert(calculator(2, NSPIRE_PID_CX2)));
        let snap = reg.snapshot(id(2)).unwrap();
        assert_eq!(snap.product_id, NSPIRE_PID);
        assert_eq!(snap.state, DeviceState::Discovered);
    }

    /// Insert `1:<address>` and attach an engine to it. Returns its generation.
    fn opened(reg: &Registry, address: u8) -> u64 {
        reg.insert(calculator(address, NSPIRE_PID));
        let generation = reg.begin_open(id(address)).unwrap();
        assert!(reg.attach_engine(id(address), generation, idle_engine()));
        generation
    }

    #[test]
    fn lifecycle_states() {
        let reg = Registry::new();
        reg.insert(calculator(2, NSPIRE_PID));
        let generation = reg.generation(id(2)).unwrap();
        assert!(reg.begin_update(id(2), generation).is_none());

        let generation = reg.begin_open(id(2)).unwrap();
        reg.attach_engine(id(2), generation, idle_engine());
        assert_eq!(reg.snapshot(id(2)).unwrap().state, DeviceState::Opened);

        assert!(reg.begin_update(id(2), generation).is_some());
        assert_eq!(reg.snapshot(id(2)).unwrap().state, DeviceState::Updating);

        reg.finish_update(id(2), generation, Some(sample_info()));
        let snap = reg.snapshot(id(2)).unwrap();
        assert_eq!(snap.state, DeviceState::Opened);
        assert_eq!(snap.info, Some(sample_info()));

        // a failed refresh keeps the old snapshot
        reg.begin_update(id(2), generation);
        reg.finish_update(id(2), generation, None);
        assert_eq!(reg.snapshot(id(2)).unwrap().info, Some(sample_info()));

        assert!(reg.remove(id(2)));
        assert!(reg.snapshot(id(2)).is_none());
        assert!(!reg.remove(id(2)));
    }

    #[test]
    fn begin_open_is_exclusive() {
        let reg = Registry::new();
        assert!(reg.begin_open(id(2)).is_none());
        reg.insert(calculator(2, NSPIRE_PID));

        let generation = reg.begin_open(id(2)).unwrap();
        assert!(reg.begin_open(id(2)).is_none());
        reg.abort_open(id(2), generation);

        let generation = reg.begin_open(id(2)).unwrap();
        assert!(reg.attach_engine(id(2), generation, idle_engine()));
        assert!(reg.begin_open(id(2)).is_none());
    }

    #[test]
    fn reinserted_device_gets_a_new_generation() {
        let reg = Registry::new();
        reg.insert(calculator(2, NSPIRE_PID));
        let old = reg.begin_open(id(2)).unwrap();
        reg.remove(id(2));
        reg.insert(calculator(2, NSPIRE_PID));
        let new = reg.generation(id(2)).unwrap();
        assert_ne!(old, new);

        // an open claimed on the old entry cannot finish on the new one
        assert!(!reg.attach_engine(id(2), old, idle_engine()));
        reg.abort_open(id(2), old);
        assert_eq!(reg.snapshot(id(2)).unwrap().state, DeviceState::Discovered);
        assert_eq!(reg.begin_open(id(2)), Some(new));
    }

    #[test]
    fn command_ids_are_unique_and_ordered() {
        let reg = Registry::new();
        reg.insert(calculator(2, NSPIRE_PID));
        reg.insert(calculator(3, NSPIRE_PID));
        let a = reg.enqueue(id(2), vec![action("/a"), action("/b")]).unwrap();
        let b = reg.enqueue(id(3), vec![action("/c")]).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a[0] < a[1] && a[1] < b[0]);
        assert!(reg.enqueue(id(9), vec![action("/x")]).is_none());
    }

    #[test]
    fn try_start_needs_engine_and_is_exclusive() {
        let reg = Registry::new();
        reg.insert(calculator(2, NSPIRE_PID));
        assert!(reg.try_start(id(2)).is_none());
        let generation = reg.begin_open(id(2)).unwrap();
        reg.attach_engine(id(2), generation, idle_engine());
        assert_eq!(reg.try_start(id(2)), Some(generation));
        assert!(reg.try_start(id(2)).is_none());
        assert!(reg.try_start(id(7)).is_none());
    }

    #[test]
    fn next_cmd_peeks_until_completed() {
        let reg = Registry::new();
        opened(&reg, 2);
        let ids = reg.enqueue(id(2), vec![action("/a"), action("/b")]).unwrap();
        let generation = reg.try_start(id(2)).unwrap();

        let NextCmd::Run(first, _) = reg.next_cmd(id(2), generation) else {
            panic!("expected a command");
        };
        let NextCmd::Run(again, _) = reg.next_cmd(id(2), generation) else {
            panic!("expected a command");
        };
        assert_eq!(first.id, ids[0]);
        assert_eq!(again.id, ids[0]);

        assert_eq!(reg.complete_head(id(2), generation, true).unwrap().id, ids[0]);
        assert_eq!(reg.complete_head(id(2), generation, false).unwrap().id, ids[1]);
        assert!(matches!(reg.next_cmd(id(2), generation), NextCmd::Idle));
        assert!(!reg.snapshot(id(2)).unwrap().running);
        assert!(matches!(reg.next_cmd(id(5), generation), NextCmd::Gone));
    }

    #[test]
    fn stale_generation_leaves_new_entry_alone() {
        let reg = Registry::new();
        let old = opened(&reg, 2);
        reg.enqueue(id(2), vec![action("/a")]).unwrap();
        assert_eq!(reg.try_start(id(2)), Some(old));
        reg.remove(id(2));

        let new = opened(&reg, 2);
        let ids = reg.enqueue(id(2), vec![action("/b")]).unwrap();
        let p = Progress {
            remaining: 1,
            total: 2,
        };
        let stale = Progress {
            remaining: 0,
            total: 2,
        };
        reg.set_progress(id(2), new, p);

        assert!(matches!(reg.next_cmd(id(2), old), NextCmd::Gone));
        reg.set_progress(id(2), old, stale);
        reg.clear_progress(id(2), old);
        assert!(reg.complete_head(id(2), old, true).is_none());
        assert!(reg.begin_update(id(2), old).is_none());
        reg.release(id(2), old);

        let snap = reg.snapshot(id(2)).unwrap();
        assert_eq!(snap.queue.len(), 1);
        assert_eq!(snap.queue[0].id, ids[0]);
        assert_eq!(snap.progress, Some(p));
        assert_eq!(snap.state, DeviceState::Opened);
        assert_eq!(reg.try_start(id(2)), Some(new));
    }

    #[test]
    fn progress_set_and_cleared() {
        let reg = Registry::new();
        reg.insert(calculator(2, NSPIRE_PID));
        let generation = reg.generation(id(2)).unwrap();
        let events = reg.subscribe();
        let p = Progress {
            remaining: 5,
            total: 10,
        };
        reg.set_progress(id(2), generation, p);
        assert_eq!(reg.snapshot(id(2)).unwrap().progress, Some(p));
        reg.clear_progress(id(2), generation);
        reg.clear_progress(id(2), generation);
        assert!(reg.snapshot(id(2)).unwrap().progress.is_none());

        let got: Vec<_> = events.try_iter().collect();
        assert_eq!(
            got,
            vec![
                DeviceEvent::ProgressSet(id(2), p),
                DeviceEvent::ProgressCleared(id(2))
            ]
        );
    }

    #[test]
    fn subscribers_see_lifecycle_events() {
        let reg = Registry::new();
        let events = reg.subscribe();
        opened(&reg, 4);
        reg.remove(id(4));
        let got: Vec<_> = events.try_iter().collect();
        assert_eq!(
            got,
            vec![
                DeviceEvent::Added(id(4)),
                DeviceEvent::Opened(id(4)),
                DeviceEvent::Removed(id(4))
            ]
        );
        assert!(got.iter().all(|e| e.device() == id(4)));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let reg = Registry::new();
        drop(reg.subscribe());
        reg.insert(calculator(4, NSPIRE_PID));
        assert!(reg.lock().subscribers.is_empty());
    }

    #[test]
    fn wait_for_wakes_on_transition() {
        let reg = Arc::new(Registry::new());
        reg.insert(calculator(2, NSPIRE_PID));
        let remover = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                reg.remove(id(2));
            })
        };
        assert!(reg.wait_for(id(2), Duration::from_secs(5), |s| s.is_none()));
        remover.join().unwrap();
    }

    #[test]
    fn wait_for_times_out() {
        let reg = Registry::new();
        assert!(!reg.wait_for(id(2), Duration::from_millis(20), |s| s.is_some()));
    }

    #[test]
    fn snapshot_serializes_state_lowercase() {
        let reg = Registry::new();
        reg.insert(calculator(2, NSPIRE_PID_CX2));
        let json = serde_json::to_value(reg.snapshots()).unwrap();
        assert_eq!(json[0]["state"], "discovered");
        assert_eq!(json[0]["flags"]["is_cx_ii"], true);
    }
}
