//! Unified error type for the nlink-lib crate.
//!
//! [`NlinkError`] wraps the per-module errors (mailbox, codec, bridge,
//! engine, host) so `?` propagates across module boundaries.

use std::fmt;

use crate::capability::{DeviceIdentity, HostError};
use crate::client::BridgeError;
use crate::engine::EngineError;
use crate::mailbox::MailboxError;
use crate::transfer::CodecError;

#[derive(Debug)]
pub enum NlinkError {
    Mailbox(MailboxError),
    Codec(CodecError),
    Bridge(BridgeError),
    Engine(EngineError),
    /// The host USB stack refused an operation.
    Host(HostError),
    /// No registry entry for this device.
    UnknownDevice(DeviceIdentity),
    /// The device is known but has not been opened.
    NotOpened(DeviceIdentity),
    Io(std::io::Error),
    /// Configuration validation error.
    Config(String),
}

impl fmt::Display for NlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NlinkError::Mailbox(e) => write!(f, "Mailbox error: {e}"),
            NlinkError::Codec(e) => write!(f, "Codec error: {e}"),
            NlinkError::Bridge(e) => write!(f, "{e}"),
            NlinkError::Engine(e) => write!(f, "{e}"),
            NlinkError::Host(e) => write!(f, "USB host error: {e}"),
            NlinkError::UnknownDevice(id) => write!(f, "No device at {id}"),
            NlinkError::NotOpened(id) => write!(f, "Device {id} is not open"),
            NlinkError::Io(e) => write!(f, "I/O error: {e}"),
            NlinkError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for NlinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NlinkError::Mailbox(e) => Some(e),
            NlinkError::Codec(e) => Some(e),
            NlinkError::Bridge(e) => Some(e),
            NlinkError::Engine(e) => Some(e),
            NlinkError::Host(e) => Some(e),
            NlinkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MailboxError> for NlinkError {
    fn from(e: MailboxError) -> Self {
        NlinkError::Mailbox(e)
    }
}

impl From<CodecError> for NlinkError {
    fn from(e: CodecError) -> Self {
        NlinkError::Codec(e)
    }
}

impl From<BridgeError> for NlinkError {
    fn from(e: BridgeError) -> Self {
        NlinkError::Bridge(e)
    }
}

impl From<EngineError> for NlinkError {
    fn from(e: EngineError) -> Self {
        NlinkError::Engine(e)
    }
}

impl From<HostError> for NlinkError {
    fn from(e: HostError) -> Self {
        NlinkError::Host(e)
    }
}

impl From<std::io::Error> for NlinkError {
    fn from(e: std::io::Error) -> Self {
        NlinkError::Io(e)
    }
}

/// Crate-level Result alias using [`NlinkError`].
pub type Result<T> = std::result::Result<T, NlinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::UsbError;

    #[test]
    fn from_engine_error() {
        let e: NlinkError = EngineError::NotInitialized.into();
        assert!(matches!(e, NlinkError::Engine(EngineError::NotInitialized)));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: NlinkError = io_err.into();
        assert!(matches!(e, NlinkError::Io(_)));
    }

    #[test]
    fn display_unknown_device() {
        let e = NlinkError::UnknownDevice(DeviceIdentity::new(2, 9));
        assert_eq!(e.to_string(), "No device at 2:9");
    }

    #[test]
    fn display_config_error() {
        let e = NlinkError::Config("invalid input".into());
        assert_eq!(e.to_string(), "Config error: invalid input");
    }

    #[test]
    fn display_mailbox_error() {
        let e = NlinkError::Mailbox(MailboxError::CapacityTooSmall(2));
        assert_eq!(
            e.to_string(),
            "Mailbox error: mailbox capacity 2 cannot hold a reply"
        );
    }

    #[test]
    fn source_chains_bridge_error() {
        let e = NlinkError::Bridge(BridgeError::Usb(UsbError::Network));
        let source = std::error::Error::source(&e).unwrap();
        assert!(source.to_string().contains("transfer failed"));
    }

    #[test]
    fn source_none_for_identity_variants() {
        let e = NlinkError::NotOpened(DeviceIdentity::new(1, 1));
        assert!(std::error::Error::source(&e).is_none());
    }

    #[test]
    fn question_mark_propagation_host_to_nlink() {
        fn inner() -> crate::capability::HostResult<()> {
            Err(HostError::of(UsbError::Security, "denied"))
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        let err = outer().unwrap_err();
        assert!(matches!(err, NlinkError::Host(_)));
        assert_eq!(err.to_string(), "USB host error: SecurityError: denied");
    }
}
