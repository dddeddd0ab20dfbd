//! Transfer vocabulary and codec for the bridge.
//!
//! A [`TransferRequest`] is posted by the engine side; a [`TransferReply`] is
//! written back by the primary side into the mailbox. Both are encoded as
//! MessagePack with named fields so either side can decode a frame without
//! knowing the other's memory layout. Byte payloads use `serde_bytes` so a
//! bulk read costs one byte per byte plus a small envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Error enumeration ──

/// Closed set of failures a restricted USB operation can report across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbError {
    NotFound,
    Security,
    Network,
    Abort,
    InvalidState,
    InvalidAccess,
    Unknown,
}

/// Host failure names and the error each one maps to.
pub const HOST_ERROR_NAMES: &[(&str, UsbError)] = &[
    ("NotFoundError", UsbError::NotFound),
    ("SecurityError", UsbError::Security),
    ("NetworkError", UsbError::Network),
    ("AbortError", UsbError::Abort),
    ("InvalidStateError", UsbError::InvalidState),
    ("InvalidAccessError", UsbError::InvalidAccess),
];

impl UsbError {
    /// Map a host failure name (e.g. `"NotFoundError"`) to the closed enumeration.
    /// Names outside [`HOST_ERROR_NAMES`] map to [`UsbError::Unknown`].
    pub fn from_host_name(name: &str) -> Self {
        HOST_ERROR_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, e)| *e)
            .unwrap_or(UsbError::Unknown)
    }

    /// The host failure name this error is reported under.
    pub fn host_name(self) -> &'static str {
        HOST_ERROR_NAMES
            .iter()
            .find(|(_, e)| *e == self)
            .map(|(n, _)| *n)
            .unwrap_or("UnknownError")
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UsbError::NotFound => "device or resource not found",
            UsbError::Security => "access denied",
            UsbError::Network => "transfer failed",
            UsbError::Abort => "transfer aborted",
            UsbError::InvalidState => "device in invalid state",
            UsbError::InvalidAccess => "invalid access",
            UsbError::Unknown => "unknown USB error",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for UsbError {}

// ── Requests ──

/// One low-level transfer the engine asks the primary side to perform.
///
/// `device` is the handle the primary side assigned when the capability was
/// registered, not a real device object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferRequest {
    BulkTransferOut {
        device: u32,
        endpoint: u8,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    BulkTransferIn {
        device: u32,
        endpoint: u8,
        length: usize,
    },
    SelectConfiguration {
        device: u32,
        config: u8,
    },
    ClaimInterface {
        device: u32,
        number: u8,
    },
    ReleaseInterface {
        device: u32,
        number: u8,
    },
    ResetDevice {
        device: u32,
    },
    ActiveConfigDescriptor {
        device: u32,
    },
}

impl TransferRequest {
    /// Device handle the request targets.
    pub fn device(&self) -> u32 {
        match self {
            TransferRequest::BulkTransferOut { device, .. }
            | TransferRequest::BulkTransferIn { device, .. }
            | TransferRequest::SelectConfiguration { device, .. }
            | TransferRequest::ClaimInterface { device, .. }
            | TransferRequest::ReleaseInterface { device, .. }
            | TransferRequest::ResetDevice { device }
            | TransferRequest::ActiveConfigDescriptor { device } => *device,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferRequest::BulkTransferOut { .. } => "bulkTransferOut",
            TransferRequest::BulkTransferIn { .. } => "bulkTransferIn",
            TransferRequest::SelectConfiguration { .. } => "selectConfiguration",
            TransferRequest::ClaimInterface { .. } => "claimInterface",
            TransferRequest::ReleaseInterface { .. } => "releaseInterface",
            TransferRequest::ResetDevice { .. } => "resetDevice",
            TransferRequest::ActiveConfigDescriptor { .. } => "activeConfigDescriptor",
        }
    }
}

// ── Replies ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbEndpoint {
    /// Endpoint address including the direction bit.
    pub address: u8,
    pub packet_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbAlternateInterface {
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub endpoints: Vec<UsbEndpoint>,
}

/// The device's active configuration, one list of alternate settings per interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbConfiguration {
    pub configuration_value: u8,
    pub interfaces: Vec<Vec<UsbAlternateInterface>>,
}

/// Success payload of a transfer. The shape depends on the request variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyPayload {
    /// Bytes accepted by a bulk OUT transfer.
    Written(usize),
    /// Bytes received by a bulk IN transfer.
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Operations without a result.
    Null,
    Configuration(UsbConfiguration),
}

impl ReplyPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplyPayload::Written(_) => "written",
            ReplyPayload::Data(_) => "data",
            ReplyPayload::Null => "null",
            ReplyPayload::Configuration(_) => "configuration",
        }
    }
}

/// Result of one transfer as it crosses the mailbox.
pub type TransferReply = std::result::Result<ReplyPayload, UsbError>;

// ── Codec ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode failed: {e}"),
            CodecError::Decode(e) => write!(f, "decode failed: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

pub fn encode_request(request: &TransferRequest) -> Result<Vec<u8>, CodecError> {
    encode(request)
}

pub fn decode_request(bytes: &[u8]) -> Result<TransferRequest, CodecError> {
    decode(bytes)
}

pub fn encode_reply(reply: &TransferReply) -> Result<Vec<u8>, CodecError> {
    encode(reply)
}

pub fn decode_reply(bytes: &[u8]) -> Result<TransferReply, CodecError> {
    decode(bytes)
}
