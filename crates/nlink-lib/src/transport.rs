//! Primary side of the bridge.
//!
//! A [`Transport`] owns the live capabilities, keyed by the handles it hands
//! out, and the mailbox replies are written into. [`spawn_pump`] runs the
//! loop that services everything an engine worker posts, in arrival order:
//! transfer requests, progress updates and RPC replies share one channel so
//! progress is always applied before the completion that follows it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;

use crate::capability::UsbCapability;
use crate::engine::EngineResult;
use crate::mailbox::{Mailbox, MailboxError};
use crate::protocol::endpoint_number;
use crate::registry::Progress;
use crate::transfer::{
    CodecError, ReplyPayload, TransferReply, TransferRequest, UsbError, decode_request,
    encode_reply,
};

/// Process-wide source of device handles.
static NEXT_HANDLE: AtomicU32 = AtomicU32::new(0);

/// Everything the background context posts to the primary side.
pub enum WorkerMessage {
    /// An encoded [`TransferRequest`].
    Transfer(Vec<u8>),
    Progress(Progress),
    /// An engine call finished; hand the result to whoever is waiting on it.
    Reply {
        reply: Sender<EngineResult>,
        result: EngineResult,
    },
}

impl fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMessage::Transfer(bytes) => write!(f, "Transfer({} bytes)", bytes.len()),
            WorkerMessage::Progress(p) => write!(f, "Progress({p:?})"),
            WorkerMessage::Reply { result, .. } => write!(f, "Reply(ok={})", result.is_ok()),
        }
    }
}

/// A reply could not be delivered. The waiting client will never wake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Mailbox(MailboxError),
    Codec(CodecError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Mailbox(e) => write!(f, "reply not delivered: {e}"),
            TransportError::Codec(e) => write!(f, "reply not encoded: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Mailbox(e) => Some(e),
            TransportError::Codec(e) => Some(e),
        }
    }
}

impl From<MailboxError> for TransportError {
    fn from(e: MailboxError) -> Self {
        TransportError::Mailbox(e)
    }
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::Codec(e)
    }
}

pub struct Transport {
    devices: BTreeMap<u32, Box<dyn UsbCapability>>,
    mailbox: Arc<Mailbox>,
}

impl Transport {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self {
            devices: BTreeMap::new(),
            mailbox,
        }
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Register a capability and return its handle. Handles are never reused.
    pub fn add_device(&mut self, capability: Box<dyn UsbCapability>) -> u32 {
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        self.devices.insert(handle, capability);
        handle
    }

    /// Drop the capability behind `handle`. Later requests for it get `NotFound`.
    pub fn remove_device(&mut self, handle: u32) -> bool {
        self.devices.remove(&handle).is_some()
    }

    /// Run the restricted operation matching `request` and build its reply.
    pub fn perform(&mut self, request: &TransferRequest) -> TransferReply {
        let handle = request.device();
        let Some(cap) = self.devices.get_mut(&handle) else {
            log::warn!("{} for unknown device handle {handle}", request.kind());
            return Err(UsbError::NotFound);
        };

        let result = match request {
            TransferRequest::BulkTransferOut { endpoint, data, .. } => cap
                .transfer_out(endpoint_number(*endpoint), data)
                .map(ReplyPayload::Written),
            TransferRequest::BulkTransferIn {
                endpoint, length, ..
            } => cap
                .transfer_in(endpoint_number(*endpoint), *length)
                .map(ReplyPayload::Data),
            TransferRequest::SelectConfiguration { config, .. } => cap
                .select_configuration(*config)
                .map(|()| ReplyPayload::Null),
            TransferRequest::ClaimInterface { number, .. } => {
                cap.claim_interface(*number).map(|()| ReplyPayload::Null)
            }
            TransferRequest::ReleaseInterface { number, .. } => {
                cap.release_interface(*number).map(|()| ReplyPayload::Null)
            }
            TransferRequest::ResetDevice { .. } => cap.reset().map(|()| ReplyPayload::Null),
            TransferRequest::ActiveConfigDescriptor { .. } => {
                cap.configuration().map(ReplyPayload::Configuration)
            }
        };

        result.map_err(|e| {
            log::debug!("{} on handle {handle} failed: {e}", request.kind());
            e.usb_error()
        })
    }

    /// Perform `request`, then encode the outcome into the mailbox and wake the client.
    pub fn process_request(&mut self, request: &TransferRequest) -> Result<(), TransportError> {
        log::debug!("{} on handle {}", request.kind(), request.device());
        let reply = self.perform(request);
        self.write_reply(&reply)
    }

    /// Decode and process a posted request. Undecodable bytes get an `Unknown`
    /// error reply so the client is not left waiting.
    pub fn process_encoded(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match decode_request(bytes) {
            Ok(request) => self.process_request(&request),
            Err(e) => {
                log::warn!("dropping malformed transfer request: {e}");
                self.write_reply(&Err(UsbError::Unknown))
            }
        }
    }

    fn write_reply(&self, reply: &TransferReply) -> Result<(), TransportError> {
        let bytes = encode_reply(reply)?;
        self.mailbox.write(&bytes)?;
        Ok(())
    }
}

/// Start the primary pump for one device.
///
/// The pump runs until every sender of `inbox` is gone, then drops the
/// transport and with it the capability.
pub fn spawn_pump<F>(
    name: String,
    mut transport: Transport,
    inbox: Receiver<WorkerMessage>,
    mut on_progress: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(Progress) + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("pump {name}"))
        .spawn(move || {
            while let Ok(msg) = inbox.recv() {
                match msg {
                    WorkerMessage::Transfer(bytes) => {
                        if let Err(e) = transport.process_encoded(&bytes) {
                            log::error!("pump {name}: {e}");
                        }
                    }
                    WorkerMessage::Progress(progress) => on_progress(progress),
                    WorkerMessage::Reply { reply, result } => {
                        // caller may have given up waiting
                        let _ = reply.send(result);
                    }
                }
            }
            log::info!("pump {name} stopped");
        })
}
