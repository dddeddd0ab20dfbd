//! Per-device command queue and its executor.
//!
//! Commands run strictly in enqueue order, one at a time per device. A
//! command stays at the head of the queue until it has finished; a failure
//! is logged and counts as finished. The executor stops quietly when the
//! device disappears underneath it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::Serialize;

use crate::capability::DeviceIdentity;
use crate::engine::{EngineHandle, EngineRequest};
use crate::error::{NlinkError, Result};
use crate::registry::{NextCmd, Registry};

/// Where upload data comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    /// A file on the host, read when the command runs.
    File(PathBuf),
    Memory {
        name: String,
        #[serde(skip)]
        data: Vec<u8>,
    },
}

impl Source {
    /// Name the uploaded file gets on the device.
    pub fn name(&self) -> String {
        match self {
            Source::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Source::Memory { name, .. } => name.clone(),
        }
    }

    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Source::File(path) => std::fs::read(path),
            Source::Memory { data, .. } => Ok(data.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    /// Copy a device file into the host directory `dest`.
    Download { path: String, size: u64, dest: PathBuf },
    /// Upload `source` into the device directory `path`.
    Upload { path: String, source: Source },
    UploadOs { source: Source },
    DeleteFile { path: String },
    DeleteDir { path: String },
    CreateDir { path: String },
    Move { src: String, dest: String },
    Copy { src: String, dest: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Download { .. } => "download",
            Action::Upload { .. } => "upload",
            Action::UploadOs { .. } => "uploadOs",
            Action::DeleteFile { .. } => "deleteFile",
            Action::DeleteDir { .. } => "deleteDir",
            Action::CreateDir { .. } => "createDir",
            Action::Move { .. } => "move",
            Action::Copy { .. } => "copy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Download { path, dest, .. } => {
                write!(f, "download {path} -> {}", dest.display())
            }
            Action::Upload { path, source } => write!(f, "upload {} -> {path}", source.name()),
            Action::UploadOs { source } => write!(f, "uploadOs {}", source.name()),
            Action::DeleteFile { path }
            | Action::DeleteDir { path }
            | Action::CreateDir { path } => write!(f, "{} {path}", self.name()),
            Action::Move { src, dest } | Action::Copy { src, dest } => {
                write!(f, "{} {src} -> {dest}", self.name())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cmd {
    pub id: u64,
    #[serde(flatten)]
    pub action: Action,
}

/// Last component of a device path.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Host path a download of `path` lands at.
pub fn download_target(path: &str, dest: &Path) -> PathBuf {
    dest.join(basename(path))
}

/// Perform one action against the device's engine.
pub fn execute(engine: &EngineHandle, action: &Action) -> Result<()> {
    match action {
        Action::Download { path, size, dest } => {
            let data = engine.download_file(path, *size)?;
            std::fs::write(download_target(path, dest), data)?;
        }
        Action::Upload { path, source } => {
            let data = source.read()?;
            engine.run(EngineRequest::UploadFile {
                path: format!("{path}/{}", source.name()),
                data,
            })?;
        }
        Action::UploadOs { source } => {
            let data = source.read()?;
            engine.run(EngineRequest::UploadOs { data })?;
        }
        Action::DeleteFile { path } => {
            engine.run(EngineRequest::DeleteFile { path: path.clone() })?;
        }
        Action::DeleteDir { path } => {
            engine.run(EngineRequest::DeleteDir { path: path.clone() })?;
        }
        Action::CreateDir { path } => {
            engine.run(EngineRequest::CreateDir { path: path.clone() })?;
        }
        Action::Move { src, dest } => {
            engine.run(EngineRequest::Move {
                src: src.clone(),
                dest: dest.clone(),
            })?;
        }
        Action::Copy { src, dest } => {
            engine.run(EngineRequest::Copy {
                src: src.clone(),
                dest: dest.clone(),
            })?;
        }
    }
    Ok(())
}

/// Refresh the cached info snapshot of the entry of `generation`. Failures
/// are logged and keep the old snapshot.
pub fn refresh_info(registry: &Registry, identity: DeviceIdentity, generation: u64) -> Result<()> {
    let Some(engine) = registry.begin_update(identity, generation) else {
        return Err(NlinkError::NotOpened(identity));
    };
    match engine.update_device() {
        Ok(info) => {
            registry.finish_update(identity, generation, Some(info));
            Ok(())
        }
        Err(e) => {
            registry.finish_update(identity, generation, None);
            Err(e.into())
        }
    }
}

/// Start the executor for `identity` unless one is already running, the
/// device is unknown, or it has no engine. Returns the executor thread.
pub fn run(registry: &Arc<Registry>, identity: DeviceIdentity) -> Option<JoinHandle<()>> {
    let generation = registry.try_start(identity)?;
    let reg = Arc::clone(registry);
    let spawned = std::thread::Builder::new()
        .name(format!("queue {identity}"))
        .spawn(move || drain(&reg, identity, generation));
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("{identity}: cannot start queue executor: {e}");
            registry.release(identity, generation);
            None
        }
    }
}

fn drain(registry: &Registry, identity: DeviceIdentity, generation: u64) {
    loop {
        let (cmd, engine) = match registry.next_cmd(identity, generation) {
            NextCmd::Run(cmd, engine) => (cmd, engine),
            NextCmd::Idle => return,
            NextCmd::Gone => break,
        };

        log::info!("{identity}: #{} {}", cmd.id, cmd.action);
        let result = execute(&engine, &cmd.action);
        if let Err(e) = &result {
            log::error!("{identity}: #{} {} failed: {e}", cmd.id, cmd.action.name());
        }
        drop(engine);
        registry.clear_progress(identity, generation);
        if registry.complete_head(identity, generation, result.is_ok()).is_none() {
            break;
        }

        match refresh_info(registry, identity, generation) {
            Ok(()) | Err(NlinkError::NotOpened(_)) => {}
            Err(e) => log::warn!("{identity}: info refresh failed: {e}"),
        }
    }
    log::debug!("{identity}: device gone, queue stopped");
}
