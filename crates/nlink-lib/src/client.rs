//! Engine side of the bridge: synchronous USB calls over the mailbox.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use crate::mailbox::Mailbox;
use crate::transfer::{
    CodecError, ReplyPayload, TransferRequest, UsbConfiguration, UsbError, decode_reply,
    encode_request,
};
use crate::transport::WorkerMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The host reported a failure.
    Usb(UsbError),
    Codec(CodecError),
    /// The primary side is gone.
    Disconnected,
    /// The reply payload does not fit the request that was sent.
    UnexpectedReply(&'static str),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Usb(e) => write!(f, "USB error: {e}"),
            BridgeError::Codec(e) => write!(f, "Bridge codec error: {e}"),
            BridgeError::Disconnected => write!(f, "Bridge disconnected"),
            BridgeError::UnexpectedReply(kind) => write!(f, "Unexpected {kind} reply"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Usb(e) => Some(e),
            BridgeError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<UsbError> for BridgeError {
    fn from(e: UsbError) -> Self {
        BridgeError::Usb(e)
    }
}

impl From<CodecError> for BridgeError {
    fn from(e: CodecError) -> Self {
        BridgeError::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Blocking USB I/O as a protocol engine sees it.
///
/// Endpoint arguments are full endpoint addresses; the primary side strips
/// the direction bit.
pub trait UsbIo {
    fn bulk_transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize>;
    fn bulk_transfer_in(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>>;
    fn select_configuration(&mut self, config: u8) -> Result<()>;
    fn claim_interface(&mut self, number: u8) -> Result<()>;
    fn release_interface(&mut self, number: u8) -> Result<()>;
    fn reset_device(&mut self) -> Result<()>;
    fn active_config_descriptor(&mut self) -> Result<UsbConfiguration>;
}

/// One device's bridge endpoint on the engine thread.
///
/// `call` takes `&mut self`, so a client can never have two requests in flight.
pub struct BridgeClient {
    device: u32,
    mailbox: Arc<Mailbox>,
    outbox: Sender<WorkerMessage>,
}

impl BridgeClient {
    pub fn new(device: u32, mailbox: Arc<Mailbox>, outbox: Sender<WorkerMessage>) -> Self {
        Self {
            device,
            mailbox,
            outbox,
        }
    }

    /// Handle of the device this client talks to.
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Post `request` and block until the primary side answers.
    ///
    /// There is no timeout: a primary side that never replies blocks the
    /// calling thread forever.
    pub fn call(&mut self, request: &TransferRequest) -> Result<ReplyPayload> {
        let bytes = encode_request(request)?;
        self.outbox
            .send(WorkerMessage::Transfer(bytes))
            .map_err(|_| BridgeError::Disconnected)?;
        let reply = decode_reply(&self.mailbox.wait())?;
        Ok(reply?)
    }

    fn call_null(&mut self, request: TransferRequest) -> Result<()> {
        match self.call(&request)? {
            ReplyPayload::Null => Ok(()),
            other => Err(BridgeError::UnexpectedReply(other.kind())),
        }
    }
}

impl UsbIo for BridgeClient {
    fn bulk_transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let request = TransferRequest::BulkTransferOut {
            device: self.device,
            endpoint,
            data: data.to_vec(),
        };
        match self.call(&request)? {
            ReplyPayload::Written(n) => Ok(n),
            other => Err(BridgeError::UnexpectedReply(other.kind())),
        }
    }

    fn bulk_transfer_in(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>> {
        let request = TransferRequest::BulkTransferIn {
            device: self.device,
            endpoint,
            length,
        };
        match self.call(&request)? {
            ReplyPayload::Data(data) => Ok(data),
            other => Err(BridgeError::UnexpectedReply(other.kind())),
        }
    }

    fn select_configuration(&mut self, config: u8) -> Result<()> {
        self.call_null(TransferRequest::SelectConfiguration {
            device: self.device,
            config,
        })
    }

    fn claim_interface(&mut self, number: u8) -> Result<()> {
        self.call_null(TransferRequest::ClaimInterface {
            device: self.device,
            number,
        })
    }

    fn release_interface(&mut self, number: u8) -> Result<()> {
        self.call_null(TransferRequest::ReleaseInterface {
            device: self.device,
            number,
        })
    }

    fn reset_device(&mut self) -> Result<()> {
        self.call_null(TransferRequest::ResetDevice {
            device: self.device,
        })
    }

    fn active_config_descriptor(&mut self) -> Result<UsbConfiguration> {
        let request = TransferRequest::ActiveConfigDescriptor {
            device: self.device,
        };
        match self.call(&request)? {
            ReplyPayload::Configuration(config) => Ok(config),
            other => Err(BridgeError::UnexpectedReply(other.kind())),
        }
    }
}
