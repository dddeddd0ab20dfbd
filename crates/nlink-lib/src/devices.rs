//! Device manager: the primary-context API.
//!
//! Opening a device wires up its bridge: the capability goes into a
//! [`Transport`] owned by a fresh pump thread, an engine worker is started
//! and initialized against the device's mailbox, and the engine handle is
//! attached to the registry entry. Closing removes the entry; the worker,
//! pump and capability then wind down on their own.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::capability::{DeviceIdentity, EnumeratedDevice, UsbHost};
use crate::client::{BridgeClient, UsbIo};
use crate::config::Config;
use crate::engine::{EngineFactory, EngineHandle, EngineInit, spawn_worker};
use crate::error::{NlinkError, Result};
use crate::info::FileInfo;
use crate::mailbox::Mailbox;
use crate::queue::{self, Action, Source};
use crate::registry::{DeviceSnapshot, Registry};
use crate::transfer::UsbConfiguration;
use crate::transport::{Transport, spawn_pump};

/// Devices that appeared and disappeared since the last poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HotplugChanges {
    pub arrived: Vec<DeviceIdentity>,
    pub left: Vec<DeviceIdentity>,
}

pub struct Devices {
    host: Arc<dyn UsbHost>,
    registry: Arc<Registry>,
    factory: EngineFactory,
    config: Config,
}

impl Devices {
    pub fn new(host: Arc<dyn UsbHost>, factory: EngineFactory, config: Config) -> Self {
        Self {
            host,
            registry: Arc::new(Registry::new()),
            factory,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Discovery ──

    /// List matching devices and add any new ones to the registry.
    pub fn enumerate(&self) -> Result<Vec<EnumeratedDevice>> {
        let found = self.host.enumerate(&self.config.device_filter())?;
        for device in &found {
            self.registry.insert(device.clone());
        }
        Ok(found)
    }

    /// Compare enumeration against the registry and apply arrivals and departures.
    pub fn poll(&self) -> Result<HotplugChanges> {
        let found = self.host.enumerate(&self.config.device_filter())?;
        let present: BTreeSet<DeviceIdentity> = found.iter().map(|d| d.identity).collect();

        let mut changes = HotplugChanges::default();
        for device in found {
            let identity = device.identity;
            if self.device_arrived(device) {
                changes.arrived.push(identity);
            }
        }
        for identity in self.registry.identities() {
            if !present.contains(&identity) && self.device_left(identity) {
                changes.left.push(identity);
            }
        }
        Ok(changes)
    }

    /// Hot-plug arrival. Devices outside the configured filter are ignored.
    pub fn device_arrived(&self, device: EnumeratedDevice) -> bool {
        if !self
            .config
            .device_filter()
            .matches(device.vendor_id, device.product_id)
        {
            return false;
        }
        let identity = device.identity;
        let added = self.registry.insert(device);
        if added {
            log::info!("{identity}: connected");
        }
        added
    }

    /// Hot-plug departure. Same effect as [`Devices::close`].
    pub fn device_left(&self, identity: DeviceIdentity) -> bool {
        let removed = self.registry.remove(identity);
        if removed {
            log::info!("{identity}: disconnected");
        }
        removed
    }

    // ── Lifecycle ──

    /// Open a discovered device and initialize its engine. Opening a device
    /// that is already open, or being opened by another caller, does nothing.
    pub fn open(&self, identity: DeviceIdentity) -> Result<()> {
        let snapshot = self
            .registry
            .snapshot(identity)
            .ok_or(NlinkError::UnknownDevice(identity))?;
        let Some(generation) = self.registry.begin_open(identity) else {
            if self.registry.contains(identity) {
                return Ok(());
            }
            return Err(NlinkError::UnknownDevice(identity));
        };

        let engine = match self.start_engine(&snapshot, generation) {
            Ok(engine) => engine,
            Err(e) => {
                self.registry.abort_open(identity, generation);
                return Err(e);
            }
        };
        if !self.registry.attach_engine(identity, generation, engine) {
            return Err(NlinkError::UnknownDevice(identity));
        }
        log::info!("{identity}: opened");

        if let Err(e) = queue::refresh_info(&self.registry, identity, generation) {
            log::warn!("{identity}: initial info refresh failed: {e}");
        }
        if self
            .registry
            .snapshot(identity)
            .is_some_and(|s| !s.queue.is_empty())
        {
            self.run(identity);
        }
        Ok(())
    }

    /// Build the bridge for one device and initialize an engine over it.
    fn start_engine(&self, device: &DeviceSnapshot, generation: u64) -> Result<EngineHandle> {
        let identity = device.identity;
        let capability = self.host.open(identity)?;
        let mailbox = Arc::new(Mailbox::new(self.config.mailbox_capacity)?);
        let mut transport = Transport::new(Arc::clone(&mailbox));
        let handle = transport.add_device(capability);

        let (outbox, inbox) = mpsc::channel();
        let registry = Arc::clone(&self.registry);
        spawn_pump(identity.to_string(), transport, inbox, move |progress| {
            registry.set_progress(identity, generation, progress)
        })?;
        let (engine, _worker) = spawn_worker(
            identity.to_string(),
            Arc::clone(&self.factory),
            outbox,
            self.config.progress_interval,
        )?;

        // on failure the dropped handle stops the worker, and with it the pump
        engine.init(EngineInit {
            device: handle,
            mailbox,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
        })?;
        log::debug!("{identity}: engine initialized on handle {handle}");
        Ok(engine)
    }

    /// Forget the device. Its executor stops before the next command.
    pub fn close(&self, identity: DeviceIdentity) -> bool {
        let removed = self.registry.remove(identity);
        if removed {
            log::info!("{identity}: closed");
        }
        removed
    }

    /// Refresh the cached info snapshot.
    pub fn update(&self, identity: DeviceIdentity) -> Result<()> {
        let generation = self
            .registry
            .generation(identity)
            .ok_or(NlinkError::UnknownDevice(identity))?;
        queue::refresh_info(&self.registry, identity, generation)
    }

    /// Open the device just long enough to read its active configuration over the bridge.
    pub fn probe(&self, identity: DeviceIdentity) -> Result<UsbConfiguration> {
        let capability = self.host.open(identity)?;
        let mailbox = Arc::new(Mailbox::new(self.config.mailbox_capacity)?);
        let mut transport = Transport::new(Arc::clone(&mailbox));
        let handle = transport.add_device(capability);
        let (outbox, inbox) = mpsc::channel();
        let pump = spawn_pump(format!("probe {identity}"), transport, inbox, |_| {})?;

        let mut client = BridgeClient::new(handle, mailbox, outbox);
        let configuration = client.active_config_descriptor();
        drop(client);
        if pump.join().is_err() {
            log::warn!("{identity}: probe pump panicked");
        }
        Ok(configuration?)
    }

    // ── Engine queries ──

    fn opened(&self, identity: DeviceIdentity) -> Option<EngineHandle> {
        self.registry.engine(identity)
    }

    /// List a device directory. A device that is not open lists as empty.
    pub fn list_dir(&self, identity: DeviceIdentity, path: &str) -> Result<Vec<FileInfo>> {
        match self.opened(identity) {
            Some(engine) => Ok(engine.list_dir(path)?),
            None => Ok(Vec::new()),
        }
    }

    // ── Queue ──

    /// Append actions to the device's queue and start its executor if idle.
    pub fn enqueue(&self, identity: DeviceIdentity, actions: Vec<Action>) -> Result<Vec<u64>> {
        let ids = self
            .registry
            .enqueue(identity, actions)
            .ok_or(NlinkError::UnknownDevice(identity))?;
        self.run(identity);
        Ok(ids)
    }

    /// Start the executor unless it is already running. Returns its thread.
    pub fn run(&self, identity: DeviceIdentity) -> Option<JoinHandle<()>> {
        queue::run(&self.registry, identity)
    }

    pub fn upload_files(
        &self,
        identity: DeviceIdentity,
        path: &str,
        sources: Vec<Source>,
    ) -> Result<Vec<u64>> {
        let actions = sources
            .into_iter()
            .map(|source| Action::Upload {
                path: path.to_string(),
                source,
            })
            .collect();
        self.enqueue(identity, actions)
    }

    pub fn upload_os_file(&self, identity: DeviceIdentity, source: Source) -> Result<Vec<u64>> {
        self.enqueue(identity, vec![Action::UploadOs { source }])
    }

    /// Queue downloads of `(path, size)` pairs into the host directory `dest`.
    pub fn download_files(
        &self,
        identity: DeviceIdentity,
        files: Vec<(String, u64)>,
        dest: &Path,
    ) -> Result<Vec<u64>> {
        let actions = files
            .into_iter()
            .map(|(path, size)| Action::Download {
                path,
                size,
                dest: dest.to_path_buf(),
            })
            .collect();
        self.enqueue(identity, actions)
    }

    /// Queue deletion of `files`, expanding directories so their contents go first.
    pub fn delete(&self, identity: DeviceIdentity, files: &[FileInfo]) -> Result<Vec<u64>> {
        let Some(engine) = self.opened(identity) else {
            return Ok(Vec::new());
        };
        let actions = files
            .iter()
            .flat_map(|file| list_all(&engine, file))
            .map(|file| {
                if file.is_dir {
                    Action::DeleteDir { path: file.path }
                } else {
                    Action::DeleteFile { path: file.path }
                }
            })
            .collect();
        drop(engine);
        self.enqueue(identity, actions)
    }

    pub fn create_dir(&self, identity: DeviceIdentity, path: &str) -> Result<Vec<u64>> {
        self.enqueue(
            identity,
            vec![Action::CreateDir {
                path: path.to_string(),
            }],
        )
    }

    pub fn copy_file(&self, identity: DeviceIdentity, src: &str, dest: &str) -> Result<Vec<u64>> {
        self.enqueue(
            identity,
            vec![Action::Copy {
                src: src.to_string(),
                dest: dest.to_string(),
            }],
        )
    }

    pub fn move_file(&self, identity: DeviceIdentity, src: &str, dest: &str) -> Result<Vec<u64>> {
        self.enqueue(
            identity,
            vec![Action::Move {
                src: src.to_string(),
                dest: dest.to_string(),
            }],
        )
    }
}

/// Depth-first expansion of `file`: a directory's contents, then the directory.
/// A directory that cannot be listed contributes nothing.
pub fn list_all(engine: &EngineHandle, file: &FileInfo) -> Vec<FileInfo> {
    if !file.is_dir {
        return vec![file.clone()];
    }
    match engine.list_dir(&file.path) {
        Ok(children) => {
            let mut parts: Vec<FileInfo> = children
                .iter()
                .flat_map(|child| list_all(engine, &child.under(&file.path)))
                .collect();
            parts.push(file.clone());
            parts
        }
        Err(e) => {
            log::error!("listing {} failed: {e}", file.path);
            Vec::new()
        }
    }
}
