//! USB host access: the restricted capability the primary pump owns.
//!
//! [`UsbCapability`] mirrors the shape of a browser-style USB device object:
//! every call can fail with a named host error that is later mapped onto
//! [`UsbError`]. [`UsbHost`] enumerates matching calculators and opens them.
//! Linux gets a `nusb` backend; other platforms a stub that finds nothing.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::protocol::{NSPIRE_PID, NSPIRE_PID_CX2, NSPIRE_VID};
use crate::transfer::{UsbConfiguration, UsbError};

// ── Host errors ──

/// A failure reported by the host USB stack, identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    /// Host failure name, e.g. `"NetworkError"`.
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build an error under the host name of `kind`.
    pub fn of(kind: UsbError, message: impl Into<String>) -> Self {
        Self::new(kind.host_name(), message)
    }

    pub fn usb_error(&self) -> UsbError {
        UsbError::from_host_name(&self.name)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HostError {}

pub type HostResult<T> = std::result::Result<T, HostError>;

// ── Identity ──

/// Position of a device on the host bus. Stable for as long as it stays plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceIdentity {
    pub bus_number: u8,
    pub address: u8,
}

impl DeviceIdentity {
    pub fn new(bus_number: u8, address: u8) -> Self {
        Self {
            bus_number,
            address,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus_number, self.address)
    }
}

impl FromStr for DeviceIdentity {
    type Err = String;

    /// Parse `"bus:address"`, both decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, addr) = s
            .split_once(':')
            .ok_or_else(|| format!("expected bus:address, got '{s}'"))?;
        let bus_number = bus
            .trim()
            .parse::<u8>()
            .map_err(|e| format!("invalid bus number '{bus}': {e}"))?;
        let address = addr
            .trim()
            .parse::<u8>()
            .map_err(|e| format!("invalid address '{addr}': {e}"))?;
        Ok(Self::new(bus_number, address))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VariantFlags {
    pub is_cx_ii: bool,
    /// The host could not access the device without extra drivers or permissions.
    pub needs_drivers: bool,
}

/// One matching device found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumeratedDevice {
    pub identity: DeviceIdentity,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub flags: VariantFlags,
}

impl EnumeratedDevice {
    /// Build a record, falling back to the model name when the product string is missing.
    pub fn new(
        identity: DeviceIdentity,
        vendor_id: u16,
        product_id: u16,
        product_string: Option<&str>,
    ) -> Self {
        let needs_drivers = product_string.is_none();
        let name = product_string
            .map(str::to_string)
            .unwrap_or_else(|| default_name(product_id).to_string());
        Self {
            identity,
            name,
            vendor_id,
            product_id,
            flags: VariantFlags {
                is_cx_ii: product_id == NSPIRE_PID_CX2,
                needs_drivers,
            },
        }
    }
}

/// Display name used when the device does not report one.
pub fn default_name(product_id: u16) -> &'static str {
    if product_id == NSPIRE_PID_CX2 {
        "TI-Nspire CX II"
    } else {
        "TI-Nspire"
    }
}

/// Which vendor/product pairs count as calculators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_ids: Vec<u16>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vendor_id: NSPIRE_VID,
            product_ids: vec![NSPIRE_PID, NSPIRE_PID_CX2],
        }
    }
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        vendor_id == self.vendor_id && self.product_ids.contains(&product_id)
    }
}

// ── Traits ──

/// Restricted operations on one opened device.
///
/// Endpoint arguments are endpoint *numbers*, without the direction bit.
pub trait UsbCapability: Send {
    /// Bulk OUT transfer. Returns the number of bytes written.
    fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> HostResult<usize>;
    /// Bulk IN transfer of up to `length` bytes.
    fn transfer_in(&mut self, endpoint: u8, length: usize) -> HostResult<Vec<u8>>;
    fn select_configuration(&mut self, value: u8) -> HostResult<()>;
    fn claim_interface(&mut self, number: u8) -> HostResult<()>;
    fn release_interface(&mut self, number: u8) -> HostResult<()>;
    fn reset(&mut self) -> HostResult<()>;
    /// The active configuration descriptor.
    fn configuration(&self) -> HostResult<UsbConfiguration>;
}

/// Host-level enumeration and open.
pub trait UsbHost: Send + Sync {
    fn enumerate(&self, filter: &DeviceFilter) -> HostResult<Vec<EnumeratedDevice>>;
    fn open(&self, identity: DeviceIdentity) -> HostResult<Box<dyn UsbCapability>>;
}

// ── Linux implementation ──

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::collections::BTreeMap;

    use nusb::transfer::{RequestBuffer, TransferError};

    use crate::protocol::ENDPOINT_DIR_IN;
    use crate::transfer::{UsbAlternateInterface, UsbEndpoint};

    fn io_error(context: &str, e: std::io::Error) -> HostError {
        use std::io::ErrorKind;
        let kind = match e.kind() {
            ErrorKind::NotFound => UsbError::NotFound,
            ErrorKind::PermissionDenied => UsbError::Security,
            ErrorKind::ResourceBusy => UsbError::InvalidState,
            ErrorKind::InvalidInput => UsbError::InvalidAccess,
            _ => UsbError::Network,
        };
        HostError::of(kind, format!("{context}: {e}"))
    }

    fn transfer_error(context: &str, e: TransferError) -> HostError {
        let kind = match e {
            TransferError::Cancelled => UsbError::Abort,
            TransferError::Disconnected => UsbError::NotFound,
            _ => UsbError::Network,
        };
        HostError::of(kind, format!("{context}: {e}"))
    }

    /// Bulk transfers go through the lowest-numbered claimed interface.
    pub struct NusbCapability {
        device: nusb::Device,
        interfaces: BTreeMap<u8, nusb::Interface>,
    }

    impl NusbCapability {
        fn bulk_interface(&self) -> HostResult<&nusb::Interface> {
            self.interfaces
                .values()
                .next()
                .ok_or_else(|| HostError::of(UsbError::InvalidState, "no interface claimed"))
        }
    }

    impl UsbCapability for NusbCapability {
        fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> HostResult<usize> {
            let iface = self.bulk_interface()?;
            let completion = pollster::block_on(iface.bulk_out(endpoint, data.to_vec()));
            let written = completion
                .into_result()
                .map_err(|e| transfer_error("bulk out", e))?;
            Ok(written.actual_length())
        }

        fn transfer_in(&mut self, endpoint: u8, length: usize) -> HostResult<Vec<u8>> {
            let iface = self.bulk_interface()?;
            let completion = pollster::block_on(
                iface.bulk_in(endpoint | ENDPOINT_DIR_IN, RequestBuffer::new(length)),
            );
            completion
                .into_result()
                .map_err(|e| transfer_error("bulk in", e))
        }

        fn select_configuration(&mut self, value: u8) -> HostResult<()> {
            self.device
                .set_configuration(value)
                .map_err(|e| io_error("set configuration", e))
        }

        fn claim_interface(&mut self, number: u8) -> HostResult<()> {
            if self.interfaces.contains_key(&number) {
                return Ok(());
            }
            let iface = self
                .device
                .claim_interface(number)
                .map_err(|e| io_error(&format!("claim interface {number}"), e))?;
            self.interfaces.insert(number, iface);
            Ok(())
        }

        fn release_interface(&mut self, number: u8) -> HostResult<()> {
            // nusb releases the interface when the handle drops
            match self.interfaces.remove(&number) {
                Some(_) => Ok(()),
                None => Err(HostError::of(
                    UsbError::InvalidState,
                    format!("interface {number} is not claimed"),
                )),
            }
        }

        fn reset(&mut self) -> HostResult<()> {
            self.interfaces.clear();
            self.device.reset().map_err(|e| io_error("reset", e))
        }

        fn configuration(&self) -> HostResult<UsbConfiguration> {
            let config = self.device.active_configuration().map_err(|e| {
                HostError::of(UsbError::InvalidState, format!("active configuration: {e}"))
            })?;
            let interfaces = config
                .interfaces()
                .map(|group| {
                    group
                        .alt_settings()
                        .map(|alt| UsbAlternateInterface {
                            alternate_setting: alt.alternate_setting(),
                            interface_class: alt.class(),
                            interface_subclass: alt.subclass(),
                            interface_protocol: alt.protocol(),
                            endpoints: alt
                                .endpoints()
                                .map(|ep| UsbEndpoint {
                                    address: ep.address(),
                                    packet_size: u16::try_from(ep.max_packet_size())
                                        .unwrap_or(u16::MAX),
                                })
                                .collect(),
                        })
                        .collect()
                })
                .collect();
            Ok(UsbConfiguration {
                configuration_value: config.configuration_value(),
                interfaces,
            })
        }
    }

    /// Enumerates and opens devices through `nusb`.
    pub struct NusbHost;

    impl UsbHost for NusbHost {
        fn enumerate(&self, filter: &DeviceFilter) -> HostResult<Vec<EnumeratedDevice>> {
            let devices =
                nusb::list_devices().map_err(|e| io_error("USB enumeration", e))?;
            Ok(devices
                .filter(|dev| filter.matches(dev.vendor_id(), dev.product_id()))
                .map(|dev| {
                    EnumeratedDevice::new(
                        DeviceIdentity::new(dev.bus_number(), dev.device_address()),
                        dev.vendor_id(),
                        dev.product_id(),
                        dev.product_string(),
                    )
                })
                .collect())
        }

        fn open(&self, identity: DeviceIdentity) -> HostResult<Box<dyn UsbCapability>> {
            let info = nusb::list_devices()
                .map_err(|e| io_error("USB enumeration", e))?
                .find(|dev| {
                    dev.bus_number() == identity.bus_number
                        && dev.device_address() == identity.address
                })
                .ok_or_else(|| {
                    HostError::of(UsbError::NotFound, format!("no device at {identity}"))
                })?;
            let device = info
                .open()
                .map_err(|e| io_error(&format!("USB open {identity}"), e))?;
            Ok(Box::new(NusbCapability {
                device,
                interfaces: BTreeMap::new(),
            }))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{NusbCapability, NusbHost};

// ── Stub host for unsupported platforms ──

/// Host that never finds a device.
/// Enables compilation and `cargo test` on unsupported hosts.
#[cfg(not(target_os = "linux"))]
pub struct StubHost;

#[cfg(not(target_os = "linux"))]
impl UsbHost for StubHost {
    fn enumerate(&self, _filter: &DeviceFilter) -> HostResult<Vec<EnumeratedDevice>> {
        Ok(Vec::new())
    }

    fn open(&self, identity: DeviceIdentity) -> HostResult<Box<dyn UsbCapability>> {
        Err(HostError::of(
            UsbError::NotFound,
            format!("no USB backend for this platform ({identity})"),
        ))
    }
}

/// Concrete host type for the current platform.
#[cfg(target_os = "linux")]
pub type PlatformHost = NusbHost;
#[cfg(not(target_os = "linux"))]
pub type PlatformHost = StubHost;

/// The host backend for the current platform.
pub fn platform_host() -> PlatformHost {
    #[cfg(target_os = "linux")]
    {
        NusbHost
    }
    #[cfg(not(target_os = "linux"))]
    {
        StubHost
    }
}

// ── Mock host for testing ──

/// In-memory USB host for unit and integration tests.
///
/// Always compiled, hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use crate::transfer::{UsbAlternateInterface, UsbEndpoint};

    /// State shared between a [`MockHost`] and every capability it opened.
    #[derive(Default)]
    pub struct MockUsbState {
        /// Recorded operations, e.g. `"transferOut 1 4"`.
        pub calls: Mutex<Vec<String>>,
        /// Operation name → host error name to fail with.
        pub failures: Mutex<BTreeMap<String, String>>,
        /// Queued replies for `transfer_in`; when empty, a patterned buffer is returned.
        pub in_data: Mutex<VecDeque<Vec<u8>>>,
        /// Every call fails with `NotFoundError` once set.
        pub unplugged: AtomicBool,
        pub claimed: Mutex<BTreeSet<u8>>,
        pub configuration: Mutex<Option<u8>>,
    }

    impl MockUsbState {
        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Make `op` fail with the given host error name until cleared.
        pub fn fail(&self, op: &str, host_name: &str) {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(op.to_string(), host_name.to_string());
        }

        pub fn clear_failures(&self) {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        pub fn push_in_data(&self, data: Vec<u8>) {
            self.in_data
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(data);
        }

        pub fn unplug(&self) {
            self.unplugged.store(true, Ordering::SeqCst);
        }

        fn record(&self, op: &str, call: String) -> HostResult<()> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
            if self.unplugged.load(Ordering::SeqCst) {
                return Err(HostError::of(UsbError::NotFound, "device unplugged"));
            }
            let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            match failures.get(op) {
                Some(name) => Err(HostError::new(name.clone(), format!("mock: {op} failure"))),
                None => Ok(()),
            }
        }
    }

    /// Configuration descriptor of a calculator: one vendor interface, one bulk pair.
    pub fn nspire_configuration() -> UsbConfiguration {
        UsbConfiguration {
            configuration_value: 1,
            interfaces: vec![vec![UsbAlternateInterface {
                alternate_setting: 0,
                interface_class: 0xFF,
                interface_subclass: 0,
                interface_protocol: 0,
                endpoints: vec![
                    UsbEndpoint {
                        address: 0x81,
                        packet_size: 64,
                    },
                    UsbEndpoint {
                        address: 0x01,
                        packet_size: 64,
                    },
                ],
            }]],
        }
    }

    pub struct MockCapability {
        pub state: Arc<MockUsbState>,
    }

    impl MockCapability {
        pub fn new(state: Arc<MockUsbState>) -> Self {
            Self { state }
        }
    }

    impl UsbCapability for MockCapability {
        fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> HostResult<usize> {
            self.state.record(
                "transferOut",
                format!("transferOut {endpoint} {}", data.len()),
            )?;
            Ok(data.len())
        }

        fn transfer_in(&mut self, endpoint: u8, length: usize) -> HostResult<Vec<u8>> {
            self.state
                .record("transferIn", format!("transferIn {endpoint} {length}"))?;
            let queued = self
                .state
                .in_data
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            Ok(queued.unwrap_or_else(|| (0..length).map(|i| i as u8).collect()))
        }

        fn select_configuration(&mut self, value: u8) -> HostResult<()> {
            self.state.record(
                "selectConfiguration",
                format!("selectConfiguration {value}"),
            )?;
            *self
                .state
                .configuration
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(value);
            Ok(())
        }

        fn claim_interface(&mut self, number: u8) -> HostResult<()> {
            self.state
                .record("claimInterface", format!("claimInterface {number}"))?;
            self.state
                .claimed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(number);
            Ok(())
        }

        fn release_interface(&mut self, number: u8) -> HostResult<()> {
            self.state
                .record("releaseInterface", format!("releaseInterface {number}"))?;
            let removed = self
                .state
                .claimed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&number);
            if removed {
                Ok(())
            } else {
                Err(HostError::of(
                    UsbError::InvalidState,
                    format!("interface {number} is not claimed"),
                ))
            }
        }

        fn reset(&mut self) -> HostResult<()> {
            self.state.record("reset", "reset".to_string())
        }

        fn configuration(&self) -> HostResult<UsbConfiguration> {
            self.state
                .record("configuration", "configuration".to_string())?;
            Ok(nspire_configuration())
        }
    }

    /// Host with a fixed, editable device list. Every opened capability shares `state`.
    #[derive(Default)]
    pub struct MockHost {
        pub devices: Mutex<Vec<EnumeratedDevice>>,
        pub state: Arc<MockUsbState>,
    }

    impl MockHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// A host with one calculator plugged in at `1:<address>`.
        pub fn with_calculator(address: u8, product_id: u16) -> Self {
            let host = Self::new();
            host.plug(calculator(address, product_id));
            host
        }

        pub fn plug(&self, device: EnumeratedDevice) {
            self.devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(device);
        }

        pub fn unplug(&self, identity: DeviceIdentity) {
            self.devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|d| d.identity != identity);
        }
    }

    /// Enumeration record of a calculator on bus 1.
    pub fn calculator(address: u8, product_id: u16) -> EnumeratedDevice {
        EnumeratedDevice::new(
            DeviceIdentity::new(1, address),
            NSPIRE_VID,
            product_id,
            Some(default_name(product_id)),
        )
    }

    impl UsbHost for MockHost {
        fn enumerate(&self, filter: &DeviceFilter) -> HostResult<Vec<EnumeratedDevice>> {
            Ok(self
                .devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|d| filter.matches(d.vendor_id, d.product_id))
                .cloned()
                .collect())
        }

        fn open(&self, identity: DeviceIdentity) -> HostResult<Box<dyn UsbCapability>> {
            let present = self
                .devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|d| d.identity == identity);
            if !present {
                return Err(HostError::of(
                    UsbError::NotFound,
                    format!("no device at {identity}"),
                ));
            }
            self.state.record("open", format!("open {identity}"))?;
            Ok(Box::new(MockCapability::new(Arc::clone(&self.state))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    // ── Identity ──

    #[test]
    fn identity_display_and_parse() {
        let id = DeviceIdentity::new(3, 17);
        assert_eq!(id.to_string(), "3:17");
        assert_eq!("3:17".parse::<DeviceIdentity>().unwrap(), id);
        assert_eq!(" 3 : 17 ".parse::<DeviceIdentity>().unwrap(), id);
    }

    #[test]
    fn identity_parse_rejects_garbage() {
        assert!("317".parse::<DeviceIdentity>().is_err());
        assert!("3:".parse::<DeviceIdentity>().is_err());
        assert!("x:1".parse::<DeviceIdentity>().is_err());
        assert!("1:300".parse::<DeviceIdentity>().is_err());
    }

    #[test]
    fn identity_orders_by_bus_then_address() {
        let mut ids = vec![
            DeviceIdentity::new(2, 1),
            DeviceIdentity::new(1, 9),
            DeviceIdentity::new(1, 2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                DeviceIdentity::new(1, 2),
                DeviceIdentity::new(1, 9),
                DeviceIdentity::new(2, 1)
            ]
        );
    }

    // ── Enumeration records ──

    #[test]
    fn cx_ii_flag_follows_product_id() {
        let cx2 = EnumeratedDevice::new(DeviceIdentity::new(1, 1), NSPIRE_VID, NSPIRE_PID_CX2, None);
        assert!(cx2.flags.is_cx_ii);
        let cx = EnumeratedDevice::new(DeviceIdentity::new(1, 2), NSPIRE_VID, NSPIRE_PID, None);
        assert!(!cx.flags.is_cx_ii);
    }

    #[test]
    fn missing_product_string_uses_model_name() {
        let d = EnumeratedDevice::new(DeviceIdentity::new(1, 1), NSPIRE_VID, NSPIRE_PID_CX2, None);
        assert_eq!(d.name, "TI-Nspire CX II");
        assert!(d.flags.needs_drivers);

        let d = EnumeratedDevice::new(
            DeviceIdentity::new(1, 1),
            NSPIRE_VID,
            NSPIRE_PID,
            Some("TI-Nspire CX"),
        );
        assert_eq!(d.name, "TI-Nspire CX");
        assert!(!d.flags.needs_drivers);
    }

    #[test]
    fn default_filter_matches_both_models() {
        let f = DeviceFilter::default();
        assert!(f.matches(NSPIRE_VID, NSPIRE_PID));
        assert!(f.matches(NSPIRE_VID, NSPIRE_PID_CX2));
        assert!(!f.matches(NSPIRE_VID, 0x1234));
        assert!(!f.matches(0x1235, NSPIRE_PID));
    }

    // ── Host errors ──

    #[test]
    fn host_error_maps_by_name() {
        assert_eq!(
            HostError::new("SecurityError", "denied").usb_error(),
            UsbError::Security
        );
        assert_eq!(
            HostError::new("WeirdError", "?").usb_error(),
            UsbError::Unknown
        );
        assert_eq!(
            HostError::of(UsbError::Abort, "x").usb_error(),
            UsbError::Abort
        );
    }

    #[test]
    fn host_error_display() {
        let e = HostError::new("NetworkError", "stall");
        assert_eq!(e.to_string(), "NetworkError: stall");
    }

    // ── Mock ──

    #[test]
    fn mock_host_filters_and_opens() {
        let host = MockHost::with_calculator(4, NSPIRE_PID);
        host.plug(calculator(5, 0x9999));

        let found = host.enumerate(&DeviceFilter::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity, DeviceIdentity::new(1, 4));

        assert!(host.open(DeviceIdentity::new(1, 4)).is_ok());
        let err = host.open(DeviceIdentity::new(1, 6)).err().unwrap();
        assert_eq!(err.usb_error(), UsbError::NotFound);
    }

    #[test]
    fn mock_capability_records_and_fails() {
        let host = MockHost::with_calculator(4, NSPIRE_PID);
        let mut cap = host.open(DeviceIdentity::new(1, 4)).unwrap();
        assert_eq!(cap.transfer_out(1, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(cap.transfer_in(1, 4).unwrap(), vec![0, 1, 2, 3]);

        host.state.fail("transferIn", "AbortError");
        let err = cap.transfer_in(1, 4).unwrap_err();
        assert_eq!(err.usb_error(), UsbError::Abort);

        assert_eq!(
            host.state.calls(),
            vec!["open 1:4", "transferOut 1 3", "transferIn 1 4", "transferIn 1 4"]
        );
    }

    #[test]
    fn mock_release_requires_claim() {
        let state = std::sync::Arc::new(MockUsbState::default());
        let mut cap = MockCapability::new(state);
        assert!(cap.release_interface(0).is_err());
        cap.claim_interface(0).unwrap();
        cap.release_interface(0).unwrap();
    }

    #[test]
    fn unplugged_mock_reports_not_found() {
        let state = std::sync::Arc::new(MockUsbState::default());
        let mut cap = MockCapability::new(std::sync::Arc::clone(&state));
        state.unplug();
        assert_eq!(cap.reset().unwrap_err().usb_error(), UsbError::NotFound);
    }
}
