//! nlink — synchronous USB bridge and per-device command queue for TI-Nspire calculators.
//!
//! The primary context owns the USB capabilities ([`capability`]) and services
//! transfer requests in a per-device pump ([`transport`]). A protocol engine
//! runs on its own worker thread ([`engine`]) and reaches the device only
//! through a blocking [`client::BridgeClient`] whose replies land in a shared
//! [`mailbox::Mailbox`]. [`devices::Devices`] ties this together with the
//! [`registry`] and the per-device command [`queue`].

pub mod capability;
pub mod client;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod info;
pub mod mailbox;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod transfer;
pub mod transport;

pub use error::NlinkError;
