//! USB identifiers and bridge constants for TI-Nspire calculators.
//!
//! The vendor/product pairs come from the calculators' device descriptors.
//! The bridge constants describe the shared mailbox frame (see [`crate::mailbox`]).

// ── USB identifiers ──

/// Texas Instruments vendor ID, shared by every Nspire model.
pub const NSPIRE_VID: u16 = 0x0451;

/// Product ID of the non-CX and original CX calculators.
pub const NSPIRE_PID: u16 = 0xE012;

/// Product ID of the CX II calculators.
pub const NSPIRE_PID_CX2: u16 = 0xE022;

/// Endpoint address bit marking an IN (device-to-host) endpoint.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Strip the direction bit from an endpoint address, leaving the endpoint number.
pub fn endpoint_number(address: u8) -> u8 {
    address & !ENDPOINT_DIR_IN
}

// ── Mailbox frame ──

/// Size of the length word at offset 0 of every mailbox frame.
pub const MAILBOX_HEADER_SIZE: usize = 4;

/// Default mailbox capacity in bytes (header included).
///
/// Must exceed the largest single bulk read the engine issues plus the
/// MessagePack envelope around it.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10_000;

/// Smallest capacity a configuration may request: the header plus room for
/// a bulk packet of the largest Nspire endpoint size and its envelope.
pub const MIN_MAILBOX_CAPACITY: usize = MAILBOX_HEADER_SIZE + 1024 + 64;

// ── Progress reporting ──

/// Forward one progress update out of this many (the final update is always sent).
pub const DEFAULT_PROGRESS_INTERVAL: u32 = 6;
