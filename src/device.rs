use super::*;
use crate::usbip_protocol::BUSID_LEN;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of endpoint numbers a USB device can use
pub const MAX_ENDPOINTS: usize = 16;

/// Flags shared between the session driver and the device executor.
///
/// The executor sets them, the session reads them and resets them when a
/// connection ends. Stores use release ordering and loads acquire ordering
/// so that a reader on another worker sees everything the writer did before
/// flipping a flag.
#[derive(Debug, Default)]
pub struct DeviceState {
    busy: AtomicBool,
    pending: [AtomicBool; MAX_ENDPOINTS],
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a client has imported the device
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Marks a transfer in flight on endpoint number `ep`
    pub fn mark_pending(&self, ep: u32) {
        if let Some(flag) = self.pending.get(ep as usize) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn clear_pending(&self, ep: u32) {
        if let Some(flag) = self.pending.get(ep as usize) {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn is_pending(&self, ep: u32) -> bool {
        self.pending
            .get(ep as usize)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn any_pending(&self) -> bool {
        self.pending.iter().any(|flag| flag.load(Ordering::Acquire))
    }

    /// Clears the busy flag and every pending flag. Safe to call repeatedly.
    pub fn reset(&self) {
        self.busy.store(false, Ordering::Release);
        for flag in &self.pending {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Interface triple reported in OP_REP_DEVLIST
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportedInterface {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

/// The device record sent in OP_REP_DEVLIST and OP_REP_IMPORT
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportedDevice {
    pub path: String,
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_bcd: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<ExportedInterface>,
}

impl ExportedDevice {
    /// Size of the record without interface triples
    pub const RECORD_LEN: usize = 312;

    const PATH_LEN: usize = 256;

    /// Encodes the 312 byte device record
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(Self::RECORD_LEN);
        result.extend_from_slice(&fixed_string(&self.path, Self::PATH_LEN));
        result.extend_from_slice(&fixed_string(&self.bus_id, BUSID_LEN));
        result.extend_from_slice(&self.bus_num.to_be_bytes());
        result.extend_from_slice(&self.dev_num.to_be_bytes());
        result.extend_from_slice(&self.speed.to_be_bytes());
        result.extend_from_slice(&self.vendor_id.to_be_bytes());
        result.extend_from_slice(&self.product_id.to_be_bytes());
        result.extend_from_slice(&self.device_bcd.to_be_bytes());
        result.push(self.device_class);
        result.push(self.device_subclass);
        result.push(self.device_protocol);
        result.push(self.configuration_value);
        result.push(self.num_configurations);
        result.push(self.interfaces.len() as u8);
        result
    }

    /// Encodes the record followed by one 4 byte entry per interface
    pub fn to_bytes_with_interfaces(&self) -> Vec<u8> {
        let mut result = self.to_bytes();
        result.reserve(self.interfaces.len() * 4);
        for intf in &self.interfaces {
            result.push(intf.interface_class);
            result.push(intf.interface_subclass);
            result.push(intf.interface_protocol);
            // padding
            result.push(0);
        }
        result
    }

    /// Whether an OP_REQ_IMPORT bus id names this device
    pub fn matches_busid(&self, busid: &[u8; BUSID_LEN]) -> bool {
        fixed_string(&self.bus_id, BUSID_LEN).as_slice() == busid
    }
}

/// NUL padded (and truncated) fixed-length string field
fn fixed_string(s: &str, len: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    if bytes.len() > len {
        warn!("Truncating {:?} to {} bytes", s, len);
    }
    bytes.resize(len, 0);
    bytes
}

#[cfg(test)]
mod tests {
    use crate::{usbip_protocol::busid_bytes, util::tests::*};

    use super::*;

    fn example_device() -> ExportedDevice {
        ExportedDevice {
            path: "/sys/bus/usb/devices/1-1".to_string(),
            bus_id: "1-1".to_string(),
            bus_num: 1,
            dev_num: 2,
            speed: 3,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_bcd: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![ExportedInterface {
                interface_class: 0x03,
                interface_subclass: 0x01,
                interface_protocol: 0x02,
            }],
        }
    }

    #[test]
    fn device_record_layout() {
        setup_test_logger();
        let device = example_device();
        let bytes = device.to_bytes();
        assert_eq!(bytes.len(), ExportedDevice::RECORD_LEN);
        assert_eq!(&bytes[..24], b"/sys/bus/usb/devices/1-1");
        assert_eq!(&bytes[256..259], b"1-1");
        assert_eq!(&bytes[288..292], &[0, 0, 0, 1]); // busnum
        assert_eq!(&bytes[292..296], &[0, 0, 0, 2]); // devnum
        assert_eq!(&bytes[296..300], &[0, 0, 0, 3]); // speed
        assert_eq!(&bytes[300..302], &[0x12, 0x34]); // idVendor
        assert_eq!(&bytes[302..304], &[0x56, 0x78]); // idProduct
        assert_eq!(bytes[311], 1); // bNumInterfaces

        let with_interfaces = device.to_bytes_with_interfaces();
        assert_eq!(with_interfaces.len(), ExportedDevice::RECORD_LEN + 4);
        assert_eq!(&with_interfaces[312..], &[0x03, 0x01, 0x02, 0x00]);
    }

    #[test]
    fn busid_matching() {
        setup_test_logger();
        let device = example_device();
        assert!(device.matches_busid(&busid_bytes("1-1")));
        assert!(!device.matches_busid(&busid_bytes("1-1.1")));
        assert!(!device.matches_busid(&busid_bytes("")));
    }

    #[test]
    fn reset_is_idempotent() {
        setup_test_logger();
        let state = DeviceState::new();
        state.set_busy(true);
        state.mark_pending(1);
        state.mark_pending(2);
        assert!(state.is_busy());
        assert!(state.is_pending(1) && state.is_pending(2));

        state.reset();
        state.reset();
        assert!(!state.is_busy());
        assert!(!state.any_pending());
    }

    #[test]
    fn out_of_range_endpoints_are_ignored() {
        setup_test_logger();
        let state = DeviceState::new();
        state.mark_pending(99);
        assert!(!state.is_pending(99));
        assert!(!state.any_pending());
        state.clear_pending(99);
    }
}
