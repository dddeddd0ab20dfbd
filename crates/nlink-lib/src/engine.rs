//! Background context: the engine worker and the protocol engine seam.
//!
//! Each opened device gets one worker thread. The worker owns the device's
//! [`ProtocolEngine`] (built on `Init` from an [`EngineFactory`]) and answers
//! the method vocabulary below. Replies and progress updates go back through
//! the device's pump, never directly, so the pump sees them in the order the
//! worker produced them.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::thread::JoinHandle;

use crate::client::{BridgeClient, BridgeError};
use crate::info::{FileInfo, Info};
use crate::mailbox::Mailbox;
use crate::registry::Progress;
use crate::transport::WorkerMessage;

// ── Errors ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A method was called before `init`.
    NotInitialized,
    Bridge(BridgeError),
    /// The engine rejected the operation.
    Protocol(String),
    /// The worker is gone.
    Disconnected,
    UnexpectedResponse(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotInitialized => write!(f, "Engine not initialized"),
            EngineError::Bridge(e) => write!(f, "{e}"),
            EngineError::Protocol(e) => write!(f, "Protocol error: {e}"),
            EngineError::Disconnected => write!(f, "Engine worker stopped"),
            EngineError::UnexpectedResponse(kind) => {
                write!(f, "Unexpected {kind} response from engine")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Bridge(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BridgeError> for EngineError {
    fn from(e: BridgeError) -> Self {
        EngineError::Bridge(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ── Vocabulary ──

/// Everything an engine needs to reach its device.
#[derive(Debug, Clone)]
pub struct EngineInit {
    pub device: u32,
    pub mailbox: Arc<Mailbox>,
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone)]
pub enum EngineRequest {
    Init(EngineInit),
    UpdateDevice,
    DownloadFile { path: String, size: u64 },
    UploadFile { path: String, data: Vec<u8> },
    UploadOs { data: Vec<u8> },
    DeleteFile { path: String },
    DeleteDir { path: String },
    CreateDir { path: String },
    Move { src: String, dest: String },
    Copy { src: String, dest: String },
    ListDir { path: String },
}

impl EngineRequest {
    pub fn method(&self) -> &'static str {
        match self {
            EngineRequest::Init(_) => "init",
            EngineRequest::UpdateDevice => "updateDevice",
            EngineRequest::DownloadFile { .. } => "downloadFile",
            EngineRequest::UploadFile { .. } => "uploadFile",
            EngineRequest::UploadOs { .. } => "uploadOs",
            EngineRequest::DeleteFile { .. } => "deleteFile",
            EngineRequest::DeleteDir { .. } => "deleteDir",
            EngineRequest::CreateDir { .. } => "createDir",
            EngineRequest::Move { .. } => "move",
            EngineRequest::Copy { .. } => "copy",
            EngineRequest::ListDir { .. } => "listDir",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineResponse {
    Unit,
    Info(Box<Info>),
    Bytes(Vec<u8>),
    Listing(Vec<FileInfo>),
}

impl EngineResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineResponse::Unit => "unit",
            EngineResponse::Info(_) => "info",
            EngineResponse::Bytes(_) => "bytes",
            EngineResponse::Listing(_) => "listing",
        }
    }
}

pub type EngineResult = Result<EngineResponse>;

// ── Engine seam ──

/// The calculator protocol, driven synchronously over a [`BridgeClient`].
///
/// `progress` callbacks receive the number of bytes still to transfer.
pub trait ProtocolEngine: Send {
    fn info(&mut self) -> Result<Info>;
    fn read_file(&mut self, path: &str, size: u64, progress: &mut dyn FnMut(u64))
    -> Result<Vec<u8>>;
    fn write_file(&mut self, path: &str, data: &[u8], progress: &mut dyn FnMut(u64))
    -> Result<()>;
    fn send_os(&mut self, data: &[u8], progress: &mut dyn FnMut(u64)) -> Result<()>;
    fn delete_file(&mut self, path: &str) -> Result<()>;
    fn delete_dir(&mut self, path: &str) -> Result<()>;
    fn create_dir(&mut self, path: &str) -> Result<()>;
    fn move_file(&mut self, src: &str, dest: &str) -> Result<()>;
    fn copy_file(&mut self, src: &str, dest: &str) -> Result<()>;
    fn list_dir(&mut self, path: &str) -> Result<Vec<FileInfo>>;
}

/// Builds an engine for a freshly initialized device.
pub type EngineFactory =
    Arc<dyn Fn(BridgeClient, &EngineInit) -> Result<Box<dyn ProtocolEngine>> + Send + Sync>;

// ── Progress ──

/// Forwards a throttled stream of progress updates to the pump.
///
/// The first update of every `interval` is sent, and the final
/// `remaining == 0` update always is.
pub struct ProgressSender {
    outbox: Sender<WorkerMessage>,
    total: u64,
    interval: u32,
    count: u32,
}

impl ProgressSender {
    pub fn new(outbox: Sender<WorkerMessage>, total: u64, interval: u32) -> Self {
        Self {
            outbox,
            total,
            interval: interval.max(1),
            count: 0,
        }
    }

    pub fn update(&mut self, remaining: u64) {
        if self.count >= self.interval {
            self.count = 0;
        }
        if self.count == 0 || remaining == 0 {
            let progress = Progress {
                remaining,
                total: self.total,
            };
            // pump gone means the device is closing
            let _ = self.outbox.send(WorkerMessage::Progress(progress));
        }
        self.count += 1;
    }
}

// ── Worker ──

pub struct EngineCall {
    pub request: EngineRequest,
    pub reply: Sender<EngineResult>,
}

/// Channel into one device's engine worker.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<EngineCall>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Send `request` and block until the worker answers.
    pub fn call(&self, request: EngineRequest) -> EngineResult {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(EngineCall { request, reply })
            .map_err(|_| EngineError::Disconnected)?;
        rx.recv().map_err(|_| EngineError::Disconnected)?
    }

    fn call_unit(&self, request: EngineRequest) -> Result<()> {
        match self.call(request)? {
            EngineResponse::Unit => Ok(()),
            other => Err(EngineError::UnexpectedResponse(other.kind())),
        }
    }

    pub fn init(&self, init: EngineInit) -> Result<()> {
        self.call_unit(EngineRequest::Init(init))
    }

    pub fn update_device(&self) -> Result<Info> {
        match self.call(EngineRequest::UpdateDevice)? {
            EngineResponse::Info(info) => Ok(*info),
            other => Err(EngineError::UnexpectedResponse(other.kind())),
        }
    }

    pub fn download_file(&self, path: &str, size: u64) -> Result<Vec<u8>> {
        match self.call(EngineRequest::DownloadFile {
            path: path.to_string(),
            size,
        })? {
            EngineResponse::Bytes(data) => Ok(data),
            other => Err(EngineError::UnexpectedResponse(other.kind())),
        }
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        match self.call(EngineRequest::ListDir {
            path: path.to_string(),
        })? {
            EngineResponse::Listing(files) => Ok(files),
            other => Err(EngineError::UnexpectedResponse(other.kind())),
        }
    }

    /// Any request whose only outcome is success or failure.
    pub fn run(&self, request: EngineRequest) -> Result<()> {
        self.call_unit(request)
    }
}

struct Worker {
    factory: EngineFactory,
    outbox: Sender<WorkerMessage>,
    progress_interval: u32,
    engine: Option<Box<dyn ProtocolEngine>>,
}

impl Worker {
    fn engine(&mut self) -> Result<&mut Box<dyn ProtocolEngine>> {
        self.engine.as_mut().ok_or(EngineError::NotInitialized)
    }

    fn progress(&self, total: u64) -> ProgressSender {
        ProgressSender::new(self.outbox.clone(), total, self.progress_interval)
    }

    fn dispatch(&mut self, request: EngineRequest) -> EngineResult {
        match request {
            EngineRequest::Init(init) => {
                // previous engine and its bridge client go first
                self.engine = None;
                let client = BridgeClient::new(
                    init.device,
                    Arc::clone(&init.mailbox),
                    self.outbox.clone(),
                );
                self.engine = Some((self.factory)(client, &init)?);
                Ok(EngineResponse::Unit)
            }
            EngineRequest::UpdateDevice => {
                let info = self.engine()?.info()?;
                Ok(EngineResponse::Info(Box::new(info)))
            }
            EngineRequest::DownloadFile { path, size } => {
                let mut progress = self.progress(size);
                let data = self
                    .engine()?
                    .read_file(&path, size, &mut |r| progress.update(r))?;
                Ok(EngineResponse::Bytes(data))
            }
            EngineRequest::UploadFile { path, data } => {
                let mut progress = self.progress(data.len() as u64);
                self.engine()?
                    .write_file(&path, &data, &mut |r| progress.update(r))?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::UploadOs { data } => {
                let mut progress = self.progress(data.len() as u64);
                self.engine()?.send_os(&data, &mut |r| progress.update(r))?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::DeleteFile { path } => {
                self.engine()?.delete_file(&path)?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::DeleteDir { path } => {
                self.engine()?.delete_dir(&path)?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::CreateDir { path } => {
                self.engine()?.create_dir(&path)?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::Move { src, dest } => {
                self.engine()?.move_file(&src, &dest)?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::Copy { src, dest } => {
                self.engine()?.copy_file(&src, &dest)?;
                Ok(EngineResponse::Unit)
            }
            EngineRequest::ListDir { path } => {
                let files = self.engine()?.list_dir(&path)?;
                Ok(EngineResponse::Listing(files))
            }
        }
    }

    fn serve(mut self, name: &str, calls: Receiver<EngineCall>) {
        while let Ok(EngineCall { request, reply }) = calls.recv() {
            let method = request.method();
            let result = self.dispatch(request);
            if let Err(e) = &result {
                log::debug!("engine {name}: {method} failed: {e}");
            }
            // route through the pump so earlier progress lands first
            if let Err(SendError(WorkerMessage::Reply { reply, result })) =
                self.outbox.send(WorkerMessage::Reply { reply, result })
            {
                let _ = reply.send(result);
            }
        }
        log::info!("engine {name} stopped");
    }
}

/// Start an engine worker. It runs until every [`EngineHandle`] is dropped.
pub fn spawn_worker(
    name: String,
    factory: EngineFactory,
    outbox: Sender<WorkerMessage>,
    progress_interval: u32,
) -> std::io::Result<(EngineHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let worker = Worker {
        factory,
        outbox,
        progress_interval,
        engine: None,
    };
    let join = std::thread::Builder::new()
        .name(format!("engine {name}"))
        .spawn(move || worker.serve(&name, rx))?;
    Ok((EngineHandle { tx }, join))
}

// ── Mock engine for testing ──

/// In-memory protocol engine for unit and integration tests.
///
/// Keeps a small file tree, records every operation, and can fail or pause
/// chosen operations. Every operation also pushes one bulk transfer through
/// the bridge so tests exercise the full round trip.
///
/// Always compiled, hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    use crate::client::UsbIo;
    use crate::info::{Battery, HardwareType, Lcd, RunLevel, Version};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Node {
        Dir,
        File(Vec<u8>),
    }

    pub fn sample_info() -> Info {
        Info {
            free_storage: 90_000_000,
            total_storage: 100_000_000,
            free_ram: 50_000_000,
            total_ram: 64_000_000,
            version: Version {
                major: 5,
                minor: 4,
                patch: 0,
                build: 259,
            },
            boot1_version: Version {
                major: 4,
                minor: 0,
                patch: 1,
                build: 52,
            },
            boot2_version: Version {
                major: 5,
                minor: 4,
                patch: 0,
                build: 98,
            },
            hw_type: HardwareType::CasCx,
            clock_speed: 156,
            lcd: Lcd {
                width: 320,
                height: 240,
                bpp: 16,
                sample_mode: 0,
            },
            os_extension: "tcc2".into(),
            file_extension: "tns".into(),
            name: "Mock Nspire".into(),
            id: "1000000000000000".into(),
            run_level: RunLevel::Os,
            battery: Battery::Ok,
            is_charging: false,
        }
    }

    /// Pauses one operation until the test lets it continue.
    pub struct Hold {
        /// Receives once the held operation has started.
        pub entered: Receiver<()>,
        /// Send (or drop) to let it finish.
        pub release: Sender<()>,
    }

    struct Gate {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    pub struct MockState {
        pub fs: Mutex<BTreeMap<String, Node>>,
        /// Performed operations, e.g. `"deleteFile /a/1.tns"`.
        pub ops: Mutex<Vec<String>>,
        /// Operation names or full operation strings that fail.
        pub failures: Mutex<BTreeSet<String>>,
        pub info: Mutex<Info>,
        /// Bytes per progress step for file transfers.
        pub chunk_size: AtomicUsize,
        /// Number of engines currently alive.
        pub live: AtomicUsize,
        /// Number of engines built so far.
        pub built: AtomicUsize,
        holds: Mutex<HashMap<String, Gate>>,
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                fs: Mutex::new(BTreeMap::new()),
                ops: Mutex::new(Vec::new()),
                failures: Mutex::new(BTreeSet::new()),
                info: Mutex::new(sample_info()),
                chunk_size: AtomicUsize::new(16),
                live: AtomicUsize::new(0),
                built: AtomicUsize::new(0),
                holds: Mutex::new(HashMap::new()),
            }
        }
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parent_of(path: &str) -> &str {
        path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
    }

    impl MockState {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Factory building a [`MockEngine`] over this state.
        pub fn factory(self: &Arc<Self>) -> EngineFactory {
            let state = Arc::clone(self);
            Arc::new(
                move |client: BridgeClient, _init: &EngineInit| -> Result<Box<dyn ProtocolEngine>> {
                    Ok(Box::new(MockEngine::new(client, Arc::clone(&state))?))
                },
            )
        }

        pub fn add_dir(&self, path: &str) {
            lock(&self.fs).insert(path.to_string(), Node::Dir);
        }

        pub fn add_file(&self, path: &str, data: &[u8]) {
            lock(&self.fs).insert(path.to_string(), Node::File(data.to_vec()));
        }

        pub fn file(&self, path: &str) -> Option<Vec<u8>> {
            match lock(&self.fs).get(path) {
                Some(Node::File(data)) => Some(data.clone()),
                _ => None,
            }
        }

        pub fn exists(&self, path: &str) -> bool {
            lock(&self.fs).contains_key(path)
        }

        pub fn ops(&self) -> Vec<String> {
            lock(&self.ops).clone()
        }

        /// Fail an operation by name (`"deleteFile"`) or by full string (`"deleteFile /a"`).
        pub fn fail(&self, op: &str) {
            lock(&self.failures).insert(op.to_string());
        }

        /// Pause the next operation named `op` until the returned hold is released.
        pub fn hold(&self, op: &str) -> Hold {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            lock(&self.holds).insert(
                op.to_string(),
                Gate {
                    entered: entered_tx,
                    release: release_rx,
                },
            );
            Hold {
                entered: entered_rx,
                release: release_tx,
            }
        }

        fn begin(&self, op: &str, arg: &str) -> Result<()> {
            let line = if arg.is_empty() {
                op.to_string()
            } else {
                format!("{op} {arg}")
            };
            let gate = lock(&self.holds).remove(op);
            if let Some(gate) = gate {
                let _ = gate.entered.send(());
                let _ = gate.release.recv();
            }
            lock(&self.ops).push(line.clone());
            let failures = lock(&self.failures);
            if failures.contains(op) || failures.contains(&line) {
                return Err(EngineError::Protocol(format!("mock: {line} failed")));
            }
            Ok(())
        }
    }

    pub struct MockEngine {
        client: BridgeClient,
        state: Arc<MockState>,
    }

    impl MockEngine {
        pub fn new(mut client: BridgeClient, state: Arc<MockState>) -> Result<Self> {
            client.select_configuration(1)?;
            client.claim_interface(0)?;
            state.built.fetch_add(1, Ordering::SeqCst);
            state.live.fetch_add(1, Ordering::SeqCst);
            Ok(Self { client, state })
        }

        fn packet(&mut self, op: &str) -> Result<()> {
            self.client.bulk_transfer_out(0x01, op.as_bytes())?;
            Ok(())
        }

        fn chunk(&self) -> usize {
            self.state.chunk_size.load(Ordering::SeqCst).max(1)
        }

        fn stream(&mut self, len: usize, progress: &mut dyn FnMut(u64)) -> Result<()> {
            let chunk = self.chunk();
            let mut remaining = len;
            while remaining > 0 {
                let step = remaining.min(chunk);
                self.client.bulk_transfer_in(0x81, step)?;
                remaining -= step;
                progress(remaining as u64);
            }
            if len == 0 {
                progress(0);
            }
            Ok(())
        }
    }

    impl Drop for MockEngine {
        fn drop(&mut self) {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ProtocolEngine for MockEngine {
        fn info(&mut self) -> Result<Info> {
            self.state.begin("updateDevice", "")?;
            self.packet("updateDevice")?;
            Ok(lock(&self.state.info).clone())
        }

        fn read_file(
            &mut self,
            path: &str,
            _size: u64,
            progress: &mut dyn FnMut(u64),
        ) -> Result<Vec<u8>> {
            self.state.begin("downloadFile", path)?;
            let data = self
                .state
                .file(path)
                .ok_or_else(|| EngineError::Protocol(format!("no such file: {path}")))?;
            self.packet("downloadFile")?;
            self.stream(data.len(), progress)?;
            Ok(data)
        }

        fn write_file(
            &mut self,
            path: &str,
            data: &[u8],
            progress: &mut dyn FnMut(u64),
        ) -> Result<()> {
            self.state.begin("uploadFile", path)?;
            self.packet("uploadFile")?;
            self.stream(data.len(), progress)?;
            self.state.add_file(path, data);
            Ok(())
        }

        fn send_os(&mut self, data: &[u8], progress: &mut dyn FnMut(u64)) -> Result<()> {
            self.state.begin("uploadOs", &data.len().to_string())?;
            self.packet("uploadOs")?;
            self.stream(data.len(), progress)
        }

        fn delete_file(&mut self, path: &str) -> Result<()> {
            self.state.begin("deleteFile", path)?;
            self.packet("deleteFile")?;
            match lock(&self.state.fs).remove(path) {
                Some(Node::File(_)) => Ok(()),
                _ => Err(EngineError::Protocol(format!("no such file: {path}"))),
            }
        }

        fn delete_dir(&mut self, path: &str) -> Result<()> {
            self.state.begin("deleteDir", path)?;
            self.packet("deleteDir")?;
            let mut fs = lock(&self.state.fs);
            if fs.keys().any(|k| parent_of(k) == path) {
                return Err(EngineError::Protocol(format!("directory not empty: {path}")));
            }
            match fs.remove(path) {
                Some(Node::Dir) => Ok(()),
                _ => Err(EngineError::Protocol(format!("no such directory: {path}"))),
            }
        }

        fn create_dir(&mut self, path: &str) -> Result<()> {
            self.state.begin("createDir", path)?;
            self.packet("createDir")?;
            let mut fs = lock(&self.state.fs);
            if fs.contains_key(path) {
                return Err(EngineError::Protocol(format!("already exists: {path}")));
            }
            fs.insert(path.to_string(), Node::Dir);
            Ok(())
        }

        fn move_file(&mut self, src: &str, dest: &str) -> Result<()> {
            self.state.begin("move", &format!("{src} {dest}"))?;
            self.packet("move")?;
            let mut fs = lock(&self.state.fs);
            let moved: Vec<String> = fs
                .keys()
                .filter(|k| *k == src || k.starts_with(&format!("{src}/")))
                .cloned()
                .collect();
            if moved.is_empty() {
                return Err(EngineError::Protocol(format!("no such file: {src}")));
            }
            for key in moved {
                if let Some(node) = fs.remove(&key) {
                    fs.insert(format!("{dest}{}", &key[src.len()..]), node);
                }
            }
            Ok(())
        }

        fn copy_file(&mut self, src: &str, dest: &str) -> Result<()> {
            self.state.begin("copy", &format!("{src} {dest}"))?;
            self.packet("copy")?;
            let data = self
                .state
                .file(src)
                .ok_or_else(|| EngineError::Protocol(format!("no such file: {src}")))?;
            self.state.add_file(dest, &data);
            Ok(())
        }

        fn list_dir(&mut self, path: &str) -> Result<Vec<FileInfo>> {
            self.state.begin("listDir", path)?;
            self.packet("listDir")?;
            let dir = if path == "/" { "" } else { path };
            let fs = lock(&self.state.fs);
            if !dir.is_empty() && fs.get(dir) != Some(&Node::Dir) {
                return Err(EngineError::Protocol(format!("no such directory: {path}")));
            }
            Ok(fs
                .iter()
                .filter(|(k, _)| parent_of(k) == dir)
                .map(|(k, node)| {
                    let name = &k[dir.len() + 1..];
                    match node {
                        Node::Dir => FileInfo::dir(name),
                        Node::File(data) => FileInfo::file(name, data.len() as u64),
                    }
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::capability::mock::{MockCapability, MockUsbState};
    use crate::transport::{Transport, spawn_pump};
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    struct Harness {
        engine: EngineHandle,
        usb: Arc<MockUsbState>,
        state: Arc<MockState>,
        progress: Arc<Mutex<Vec<Progress>>>,
        init: EngineInit,
        threads: Vec<JoinHandle<()>>,
    }

    impl Harness {
        fn new(interval: u32) -> Self {
            let usb = Arc::new(MockUsbState::default());
            let state = MockState::new();
            let mailbox = Arc::new(Mailbox::new(4096).unwrap());
            let mut transport = Transport::new(Arc::clone(&mailbox));
            let device = transport.add_device(Box::new(MockCapability::new(Arc::clone(&usb))));
            let progress = Arc::new(Mutex::new(Vec::new()));
            let (tx, rx) = mpsc::channel();
            let pump = {
                let progress = Arc::clone(&progress);
                spawn_pump("engine-test".into(), transport, rx, move |p| {
                    progress.lock().unwrap().push(p)
                })
                .unwrap()
            };
            let (engine, worker) =
                spawn_worker("engine-test".into(), state.factory(), tx, interval).unwrap();
            let init = EngineInit {
                device,
                mailbox,
                vendor_id: 0x0451,
                product_id: 0xE012,
            };
            Self {
                engine,
                usb,
                state,
                progress,
                init,
                threads: vec![pump, worker],
            }
        }

        fn initialized(interval: u32) -> Self {
            let h = Self::new(interval);
            h.engine.init(h.init.clone()).unwrap();
            h
        }

        fn shutdown(self) {
            drop(self.engine);
            for t in self.threads {
                t.join().unwrap();
            }
        }
    }

    // ── Worker ──

    #[test]
    fn call_before_init_fails() {
        let h = Harness::new(6);
        assert_eq!(
            h.engine.update_device().unwrap_err(),
            EngineError::NotInitialized
        );
        assert!(h.usb.calls().is_empty());
        h.shutdown();
    }

    #[test]
    fn init_opens_device_over_bridge() {
        let h = Harness::initialized(6);
        assert_eq!(
            h.usb.calls(),
            vec!["selectConfiguration 1", "claimInterface 0"]
        );
        assert_eq!(h.engine.update_device().unwrap(), sample_info());
        h.shutdown();
    }

    #[test]
    fn reinit_replaces_engine() {
        let h = Harness::initialized(6);
        h.engine.init(h.init.clone()).unwrap();
        assert_eq!(h.state.built.load(Ordering::SeqCst), 2);
        assert_eq!(h.state.live.load(Ordering::SeqCst), 1);
        let state = Arc::clone(&h.state);
        h.shutdown();
        assert_eq!(state.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_init_leaves_engine_unset() {
        let h = Harness::new(6);
        h.usb.fail("claimInterface", "SecurityError");
        assert!(matches!(
            h.engine.init(h.init.clone()).unwrap_err(),
            EngineError::Bridge(_)
        ));
        assert_eq!(
            h.engine.list_dir("/").unwrap_err(),
            EngineError::NotInitialized
        );
        h.shutdown();
    }

    #[test]
    fn file_operations_dispatch() {
        let h = Harness::initialized(6);
        h.state.add_dir("/docs");
        h.state.add_file("/docs/a.tns", b"abc");

        h.engine
            .run(EngineRequest::CreateDir {
                path: "/new".into(),
            })
            .unwrap();
        h.engine
            .run(EngineRequest::Copy {
                src: "/docs/a.tns".into(),
                dest: "/new/b.tns".into(),
            })
            .unwrap();
        h.engine
            .run(EngineRequest::Move {
                src: "/docs".into(),
                dest: "/old".into(),
            })
            .unwrap();

        assert!(h.state.exists("/old/a.tns"));
        assert_eq!(h.state.file("/new/b.tns").unwrap(), b"abc");
        let listing = h.engine.list_dir("/").unwrap();
        let names: Vec<_> = listing.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, vec!["new", "old"]);
        assert_eq!(
            h.state.ops(),
            vec![
                "createDir /new",
                "copy /docs/a.tns /new/b.tns",
                "move /docs /old",
                "listDir /"
            ]
        );
        h.shutdown();
    }

    #[test]
    fn engine_failure_is_reported() {
        let h = Harness::initialized(6);
        h.state.add_file("/x.tns", b"x");
        h.state.fail("deleteFile /x.tns");
        let err = h
            .engine
            .run(EngineRequest::DeleteFile {
                path: "/x.tns".into(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert!(h.state.exists("/x.tns"));
        h.shutdown();
    }

    #[test]
    fn download_progress_is_throttled() {
        let h = Harness::initialized(6);
        h.state.chunk_size.store(10, Ordering::SeqCst);
        h.state.add_file("/big.tns", &[7u8; 100]);

        let data = h.engine.download_file("/big.tns", 100).unwrap();
        assert_eq!(data.len(), 100);

        // 10 updates (90, 80, .., 0): the 1st, the 7th, and the final one
        let seen = h.progress.lock().unwrap().clone();
        let remaining: Vec<u64> = seen.iter().map(|p| p.remaining).collect();
        assert_eq!(remaining, vec![90, 30, 0]);
        assert!(seen.iter().all(|p| p.total == 100));
        h.shutdown();
    }

    #[test]
    fn upload_stores_file() {
        let h = Harness::initialized(1);
        h.engine
            .run(EngineRequest::UploadFile {
                path: "/a.tns".into(),
                data: vec![1; 40],
            })
            .unwrap();
        assert_eq!(h.state.file("/a.tns").unwrap(), vec![1; 40]);
        // interval 1 forwards every update
        assert_eq!(h.progress.lock().unwrap().len(), 3);
        h.shutdown();
    }

    #[test]
    fn dropping_handle_stops_worker_and_pump() {
        let h = Harness::initialized(6);
        let state = Arc::clone(&h.state);
        h.shutdown();
        assert_eq!(state.live.load(Ordering::SeqCst), 0);
    }

    // ── ProgressSender ──

    #[test]
    fn progress_sender_forwards_first_of_each_interval() {
        let (tx, rx) = mpsc::channel();
        let mut sender = ProgressSender::new(tx, 13, 6);
        for remaining in (0..13).rev() {
            sender.update(remaining);
        }
        drop(sender);
        let sent: Vec<u64> = rx
            .iter()
            .map(|m| match m {
                WorkerMessage::Progress(p) => p.remaining,
                other => panic!("unexpected message: {other:?}"),
            })
            .collect();
        assert_eq!(sent, vec![12, 6, 0]);
    }

    #[test]
    fn progress_sender_always_sends_final() {
        let (tx, rx) = mpsc::channel();
        let mut sender = ProgressSender::new(tx, 2, 6);
        sender.update(1);
        sender.update(0);
        drop(sender);
        assert_eq!(rx.iter().count(), 2);
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            EngineError::NotInitialized.to_string(),
            "Engine not initialized"
        );
        assert_eq!(
            EngineError::Protocol("busy".into()).to_string(),
            "Protocol error: busy"
        );
    }
}
