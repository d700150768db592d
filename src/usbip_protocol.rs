//! USB/IP protocol structs
//!
//! This module contains the fixed headers and bodies the bridge understands,
//! with functions to decode them from byte slices and encode them back.
//! Nothing in here performs I/O: the session driver reads the bytes and hands
//! slices of known length to these decoders.
//!
//! All multi-byte fields are big-endian on the wire. The layouts follow the
//! [Linux kernel documentation](https://docs.kernel.org/usb/usbip_protocol.html).

use crate::{device::ExportedDevice, error::WireError};

/// USB/IP protocol version sent by the Linux `usbip` tools
pub const USBIP_VERSION: u16 = 0x0111;

/// Command code: Retrieve the list of exported USB devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Command code: import a remote USB device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply code: The list of exported USB devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Reply code: Reply to import
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Command code: Submit an URB
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
/// Command code: Unlink an URB
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
/// Reply code: Reply for submitting an URB
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
/// Reply code: Reply for URB unlink
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// Size of [CommonHeader] on the wire
pub const COMMON_HEADER_LEN: usize = 4;
/// Size of [UsbIpHeaderBasic] on the wire
pub const URB_HEADER_LEN: usize = 20;
/// Size of the parameter block following a CMD_SUBMIT header
pub const SUBMIT_PARAMS_LEN: usize = 28;
/// Size of the parameter block following a CMD_UNLINK header
pub const UNLINK_PARAMS_LEN: usize = 28;
/// Size of a RET_UNLINK frame
pub const UNLINK_REPLY_LEN: usize = 48;
/// Size of a RET_SUBMIT frame without transfer buffer and iso descriptors
pub const RET_SUBMIT_HEADER_LEN: usize = 48;
/// Body of OP_REQ_DEVLIST after the common header
pub const DEVLIST_BODY_LEN: usize = 4;
/// Body of OP_REQ_IMPORT after the common header
pub const IMPORT_BODY_LEN: usize = 4 + BUSID_LEN;
/// Fixed length of a bus id string
pub const BUSID_LEN: usize = 32;
/// One isochronous packet descriptor
pub const ISO_DESCRIPTOR_LEN: usize = 16;
/// Transfer buffer bound used by the reference device
pub const DEFAULT_MAX_TRANSFER: usize = 1024;

fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), WireError> {
    if bytes.len() < needed {
        Err(WireError::MalformedHeader {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Every command the bridge tells apart.
///
/// Control commands come from a [CommonHeader] (16-bit code), URB commands
/// from a [UsbIpHeaderBasic] (32-bit code). Both are classified once here so
/// the session driver matches on variants instead of raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    DeviceList,
    Import,
    Submit,
    Unlink,
    Unknown(u32),
}

impl Command {
    /// Classify the command code of a [CommonHeader]
    pub fn from_op_code(code: u16) -> Self {
        match code {
            OP_REQ_DEVLIST => Command::DeviceList,
            OP_REQ_IMPORT => Command::Import,
            other => Command::Unknown(other.into()),
        }
    }

    /// Classify the command field of a [UsbIpHeaderBasic]
    pub fn from_urb_command(command: u32) -> Self {
        match command {
            USBIP_CMD_SUBMIT => Command::Submit,
            USBIP_CMD_UNLINK => Command::Unlink,
            other => Command::Unknown(other),
        }
    }
}

/// Header of the device list / import control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u16,
    pub command: u16,
}

impl CommonHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, COMMON_HEADER_LEN)?;
        Ok(CommonHeader {
            version: be_u16(bytes, 0),
            command: be_u16(bytes, 2),
        })
    }

    pub fn to_bytes(&self) -> [u8; COMMON_HEADER_LEN] {
        let mut result = [0u8; COMMON_HEADER_LEN];
        result[0..2].copy_from_slice(&self.version.to_be_bytes());
        result[2..4].copy_from_slice(&self.command.to_be_bytes());
        result
    }
}

/// Common header for all context sensitive packets
///
/// All commands/responses which rely on a device being attached
/// to a client use this header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIpHeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    /// 0 for OUT (host to device), anything else for IN
    pub direction: u32,
    pub ep: u32,
}

impl UsbIpHeaderBasic {
    /// Converts a byte slice into a [UsbIpHeaderBasic].
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, URB_HEADER_LEN)?;
        Ok(UsbIpHeaderBasic {
            command: be_u32(bytes, 0),
            seqnum: be_u32(bytes, 4),
            devid: be_u32(bytes, 8),
            direction: be_u32(bytes, 12),
            ep: be_u32(bytes, 16),
        })
    }

    /// Converts the [UsbIpHeaderBasic] into a byte array.
    pub fn to_bytes(&self) -> [u8; URB_HEADER_LEN] {
        let mut result = [0u8; URB_HEADER_LEN];
        result[0..4].copy_from_slice(&self.command.to_be_bytes());
        result[4..8].copy_from_slice(&self.seqnum.to_be_bytes());
        result[8..12].copy_from_slice(&self.devid.to_be_bytes());
        result[12..16].copy_from_slice(&self.direction.to_be_bytes());
        result[16..20].copy_from_slice(&self.ep.to_be_bytes());
        result
    }

    /// Header of a reply frame; devid, direction and ep are zero on replies.
    pub fn reply(command: u32, seqnum: u32) -> Self {
        UsbIpHeaderBasic {
            command,
            seqnum,
            devid: 0,
            direction: 0,
            ep: 0,
        }
    }

    pub fn is_out(&self) -> bool {
        self.direction == 0
    }
}

/// Parameter block of a CMD_SUBMIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitParams {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl SubmitParams {
    /// Reads the fields without checking any declared length.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, SUBMIT_PARAMS_LEN)?;
        let mut setup = [0u8; 8];
        setup.copy_from_slice(&bytes[20..28]);
        Ok(SubmitParams {
            transfer_flags: be_u32(bytes, 0),
            transfer_buffer_length: be_u32(bytes, 4),
            start_frame: be_u32(bytes, 8),
            number_of_packets: be_u32(bytes, 12),
            interval: be_u32(bytes, 16),
            setup,
        })
    }

    /// Reads the fields and rejects declared lengths above `max`.
    pub fn decode(bytes: &[u8], max: usize) -> Result<Self, WireError> {
        let params = Self::parse(bytes)?;
        params.check_bounds(max)?;
        Ok(params)
    }

    pub fn check_bounds(&self, max: usize) -> Result<(), WireError> {
        let declared = u64::from(self.transfer_buffer_length);
        if declared > max as u64 {
            return Err(WireError::PayloadTooLarge { declared, max });
        }
        let iso = self.iso_descriptor_len();
        if iso > max as u64 {
            return Err(WireError::PayloadTooLarge { declared: iso, max });
        }
        Ok(())
    }

    /// Bytes of isochronous packet descriptors following the payload.
    ///
    /// The kernel docs say non-ISO transfers carry 0xFFFFFFFF here, the
    /// kernel itself sends 0; both mean "none".
    pub fn iso_descriptor_len(&self) -> u64 {
        if self.number_of_packets == 0 || self.number_of_packets == 0xFFFF_FFFF {
            0
        } else {
            u64::from(self.number_of_packets) * ISO_DESCRIPTOR_LEN as u64
        }
    }

    /// Payload bytes present on the wire for a submit with this header
    pub fn payload_len(&self, header: &UsbIpHeaderBasic) -> u64 {
        if header.is_out() {
            u64::from(self.transfer_buffer_length)
        } else {
            0
        }
    }

    pub fn to_bytes(&self) -> [u8; SUBMIT_PARAMS_LEN] {
        let mut result = [0u8; SUBMIT_PARAMS_LEN];
        result[0..4].copy_from_slice(&self.transfer_flags.to_be_bytes());
        result[4..8].copy_from_slice(&self.transfer_buffer_length.to_be_bytes());
        result[8..12].copy_from_slice(&self.start_frame.to_be_bytes());
        result[12..16].copy_from_slice(&self.number_of_packets.to_be_bytes());
        result[16..20].copy_from_slice(&self.interval.to_be_bytes());
        result[20..28].copy_from_slice(&self.setup);
        result
    }
}

/// A fully assembled CMD_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommand {
    pub header: UsbIpHeaderBasic,
    pub params: SubmitParams,
    /// OUT payload, empty for IN transfers
    pub data: Vec<u8>,
    pub iso_packet_descriptor: Vec<u8>,
}

impl SubmitCommand {
    /// Decodes a complete CMD_SUBMIT frame held in one slice.
    pub fn decode(bytes: &[u8], max: usize) -> Result<Self, WireError> {
        let header = UsbIpHeaderBasic::decode(bytes)?;
        let params = SubmitParams::decode(&bytes[URB_HEADER_LEN..], max)?;

        let start = URB_HEADER_LEN + SUBMIT_PARAMS_LEN;
        // bounded by `max` above, so these fit in usize
        let payload_len = params.payload_len(&header) as usize;
        let iso_len = params.iso_descriptor_len() as usize;
        let expected = start + payload_len + iso_len;
        if bytes.len() < expected {
            return Err(WireError::TruncatedPayload {
                expected,
                available: bytes.len(),
            });
        }

        Ok(SubmitCommand {
            header,
            params,
            data: bytes[start..start + payload_len].to_vec(),
            iso_packet_descriptor: bytes[start + payload_len..expected].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(
            URB_HEADER_LEN + SUBMIT_PARAMS_LEN + self.data.len() + self.iso_packet_descriptor.len(),
        );
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.params.to_bytes());
        result.extend_from_slice(&self.data);
        result.extend_from_slice(&self.iso_packet_descriptor);
        result
    }
}

/// Parameter block of a CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkParams {
    pub unlink_seqnum: u32,
}

impl UnlinkParams {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, UNLINK_PARAMS_LEN)?;
        Ok(UnlinkParams {
            unlink_seqnum: be_u32(bytes, 0),
        })
    }
}

/// A complete CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkCommand {
    pub header: UsbIpHeaderBasic,
    pub unlink_seqnum: u32,
}

impl UnlinkCommand {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = UsbIpHeaderBasic::decode(bytes)?;
        ensure_len(bytes, URB_HEADER_LEN + UNLINK_PARAMS_LEN)?;
        let params = UnlinkParams::decode(&bytes[URB_HEADER_LEN..])?;
        Ok(UnlinkCommand {
            header,
            unlink_seqnum: params.unlink_seqnum,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(URB_HEADER_LEN + UNLINK_PARAMS_LEN);
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.unlink_seqnum.to_be_bytes());
        result.extend_from_slice(&[0; 24]);
        result
    }
}

/// RET_UNLINK acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkReply {
    pub header: UsbIpHeaderBasic,
    pub status: u32,
}

impl UnlinkReply {
    /// Acknowledges the CMD_UNLINK carrying `seqnum`
    pub fn new(seqnum: u32, status: u32) -> Self {
        UnlinkReply {
            header: UsbIpHeaderBasic::reply(USBIP_RET_UNLINK, seqnum),
            status,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, UNLINK_REPLY_LEN)?;
        Ok(UnlinkReply {
            header: UsbIpHeaderBasic::decode(bytes)?,
            status: be_u32(bytes, URB_HEADER_LEN),
        })
    }

    pub fn to_bytes(&self) -> [u8; UNLINK_REPLY_LEN] {
        let mut result = [0u8; UNLINK_REPLY_LEN];
        result[0..URB_HEADER_LEN].copy_from_slice(&self.header.to_bytes());
        result[URB_HEADER_LEN..URB_HEADER_LEN + 4].copy_from_slice(&self.status.to_be_bytes());
        // remaining 24 bytes stay zero
        result
    }
}

/// Body of OP_REQ_IMPORT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRequest {
    pub status: u32,
    pub busid: [u8; BUSID_LEN],
}

impl ImportRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, IMPORT_BODY_LEN)?;
        let mut busid = [0u8; BUSID_LEN];
        busid.copy_from_slice(&bytes[4..IMPORT_BODY_LEN]);
        Ok(ImportRequest {
            status: be_u32(bytes, 0),
            busid,
        })
    }

    /// Builds the full request, common header included
    pub fn to_bytes(&self, version: u16) -> Vec<u8> {
        let mut result = Vec::with_capacity(COMMON_HEADER_LEN + IMPORT_BODY_LEN);
        result.extend_from_slice(
            &CommonHeader {
                version,
                command: OP_REQ_IMPORT,
            }
            .to_bytes(),
        );
        result.extend_from_slice(&self.status.to_be_bytes());
        result.extend_from_slice(&self.busid);
        result
    }

    /// The bus id up to its first NUL
    pub fn busid_str(&self) -> String {
        let end = self.busid.iter().position(|&b| b == 0).unwrap_or(BUSID_LEN);
        String::from_utf8_lossy(&self.busid[..end]).into_owned()
    }
}

/// Pads a bus id into its fixed wire form; longer ids are truncated.
pub fn busid_bytes(busid: &str) -> [u8; BUSID_LEN] {
    let mut result = [0u8; BUSID_LEN];
    let len = busid.len().min(BUSID_LEN);
    result[..len].copy_from_slice(&busid.as_bytes()[..len]);
    result
}

/// Server side responses written by the device executor
#[derive(Clone, Debug)]
pub enum UsbIpResponse {
    OpRepDevlist {
        version: u16,
        status: u32,
        devices: Vec<ExportedDevice>,
    },
    OpRepImport {
        version: u16,
        status: u32,
        device: Option<ExportedDevice>,
    },
    UsbIpRetSubmit {
        header: UsbIpHeaderBasic,
        status: u32,
        actual_length: u32,
        start_frame: u32,
        number_of_packets: u32,
        error_count: u32,
        transfer_buffer: Vec<u8>,
        iso_packet_descriptor: Vec<u8>,
    },
}

impl UsbIpResponse {
    /// Converts the [UsbIpResponse] into a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Self::OpRepDevlist {
                version,
                status,
                ref devices,
            } => {
                let mut result = Vec::with_capacity(
                    12 + devices
                        .iter()
                        .map(|d| ExportedDevice::RECORD_LEN + d.interfaces.len() * 4)
                        .sum::<usize>(),
                );
                result.extend_from_slice(&version.to_be_bytes());
                result.extend_from_slice(&OP_REP_DEVLIST.to_be_bytes());
                result.extend_from_slice(&status.to_be_bytes());
                result.extend_from_slice(&(devices.len() as u32).to_be_bytes());
                for dev in devices {
                    result.extend_from_slice(&dev.to_bytes_with_interfaces());
                }
                result
            }
            Self::OpRepImport {
                version,
                status,
                ref device,
            } => {
                let mut result = Vec::with_capacity(8 + ExportedDevice::RECORD_LEN);
                result.extend_from_slice(&version.to_be_bytes());
                result.extend_from_slice(&OP_REP_IMPORT.to_be_bytes());
                result.extend_from_slice(&status.to_be_bytes());
                if let Some(device) = device {
                    result.extend_from_slice(&device.to_bytes());
                }
                result
            }
            Self::UsbIpRetSubmit {
                ref header,
                status,
                actual_length,
                start_frame,
                number_of_packets,
                error_count,
                ref transfer_buffer,
                ref iso_packet_descriptor,
            } => {
                let mut result = Vec::with_capacity(
                    RET_SUBMIT_HEADER_LEN + transfer_buffer.len() + iso_packet_descriptor.len(),
                );

                debug_assert!(header.command == USBIP_RET_SUBMIT);

                result.extend_from_slice(&header.to_bytes());
                result.extend_from_slice(&status.to_be_bytes());
                result.extend_from_slice(&actual_length.to_be_bytes());
                result.extend_from_slice(&start_frame.to_be_bytes());
                result.extend_from_slice(&number_of_packets.to_be_bytes());
                result.extend_from_slice(&error_count.to_be_bytes());
                result.extend_from_slice(&[0; 8]);
                result.extend_from_slice(transfer_buffer);
                result.extend_from_slice(iso_packet_descriptor);
                result
            }
        }
    }

    /// Constructs a OP_REP_DEVLIST response
    pub fn op_rep_devlist(version: u16, devices: &[ExportedDevice]) -> Self {
        Self::OpRepDevlist {
            version,
            status: 0,
            devices: devices.to_vec(),
        }
    }

    /// Constructs a successful OP_REP_IMPORT response
    pub fn op_rep_import_success(version: u16, device: &ExportedDevice) -> Self {
        Self::OpRepImport {
            version,
            status: 0,
            device: Some(device.clone()),
        }
    }

    /// Constructs a failed OP_REP_IMPORT response
    pub fn op_rep_import_fail(version: u16) -> Self {
        Self::OpRepImport {
            version,
            status: 1,
            device: None,
        }
    }

    /// RET_SUBMIT for a completed transfer.
    ///
    /// `actual_length` is the length of `transfer_buffer` for IN transfers
    /// and the number of bytes written for OUT transfers.
    pub fn usbip_ret_submit_success(
        seqnum: u32,
        actual_length: u32,
        transfer_buffer: Vec<u8>,
    ) -> Self {
        Self::UsbIpRetSubmit {
            header: UsbIpHeaderBasic::reply(USBIP_RET_SUBMIT, seqnum),
            status: 0,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            transfer_buffer,
            iso_packet_descriptor: vec![],
        }
    }

    /// RET_SUBMIT for a failed transfer, `errno` is a positive errno value
    pub fn usbip_ret_submit_fail(seqnum: u32, errno: i32) -> Self {
        Self::UsbIpRetSubmit {
            header: UsbIpHeaderBasic::reply(USBIP_RET_SUBMIT, seqnum),
            status: (-errno) as u32,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            transfer_buffer: vec![],
            iso_packet_descriptor: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::util::tests::*;

    use super::*;

    #[test]
    fn classify_commands() {
        setup_test_logger();
        assert_eq!(Command::from_op_code(0x8005), Command::DeviceList);
        assert_eq!(Command::from_op_code(0x8003), Command::Import);
        assert_eq!(Command::from_op_code(0x1005), Command::Unknown(0x1005));
        assert_eq!(Command::from_urb_command(1), Command::Submit);
        assert_eq!(Command::from_urb_command(2), Command::Unlink);
        assert_eq!(Command::from_urb_command(3), Command::Unknown(3));
    }

    #[test]
    fn decode_common_header() {
        setup_test_logger();
        let header = CommonHeader::decode(&[0x01, 0x11, 0x80, 0x03]).unwrap();
        assert_eq!(header.version, 0x0111);
        assert_eq!(header.command, OP_REQ_IMPORT);
        assert_eq!(header.to_bytes(), [0x01, 0x11, 0x80, 0x03]);
    }

    #[test]
    fn short_buffers_are_malformed() {
        setup_test_logger();
        let bytes = [0xAAu8; 64];
        for len in 0..COMMON_HEADER_LEN {
            assert_eq!(
                CommonHeader::decode(&bytes[..len]),
                Err(WireError::MalformedHeader {
                    needed: COMMON_HEADER_LEN,
                    available: len
                })
            );
        }
        for len in 0..URB_HEADER_LEN {
            assert!(matches!(
                UsbIpHeaderBasic::decode(&bytes[..len]),
                Err(WireError::MalformedHeader { .. })
            ));
            assert!(matches!(
                SubmitCommand::decode(&bytes[..len], DEFAULT_MAX_TRANSFER),
                Err(WireError::MalformedHeader { .. })
            ));
            assert!(matches!(
                UnlinkCommand::decode(&bytes[..len]),
                Err(WireError::MalformedHeader { .. })
            ));
        }
        // a complete basic header but a truncated parameter block
        assert!(matches!(
            UnlinkCommand::decode(&bytes[..URB_HEADER_LEN + 10]),
            Err(WireError::MalformedHeader { needed: 48, .. })
        ));
        assert!(matches!(
            SubmitParams::parse(&bytes[..SUBMIT_PARAMS_LEN - 1]),
            Err(WireError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn decode_usbip_cmd_submit() {
        setup_test_logger();
        let bytes = [
            0x00, 0x00, 0x00, 0x01, // command
            0x00, 0x00, 0x00, 0x02, // seqnum
            0x00, 0x00, 0x00, 0x03, // devid
            0x00, 0x00, 0x00, 0x00, // direction
            0x00, 0x00, 0x00, 0x05, // ep
            0x00, 0x00, 0x00, 0x00, // transfer_flags
            0x00, 0x00, 0x00, 0x04, // transfer_buffer_length
            0x00, 0x00, 0x00, 0x06, // start_frame
            0x00, 0x00, 0x00, 0x00, // number_of_packets
            0x00, 0x00, 0x00, 0x07, // interval
            0x80, 0x06, 0x00, 0x01, // setup
            0x00, 0x00, 0x40, 0x00, //
            0xDE, 0xAD, 0xBE, 0xEF, // data
        ];
        let cmd = SubmitCommand::decode(&bytes, DEFAULT_MAX_TRANSFER).unwrap();
        assert_eq!(cmd.header.seqnum, 2);
        assert_eq!(cmd.header.devid, 3);
        assert!(cmd.header.is_out());
        assert_eq!(cmd.header.ep, 5);
        assert_eq!(cmd.params.transfer_buffer_length, 4);
        assert_eq!(cmd.params.start_frame, 6);
        assert_eq!(cmd.params.interval, 7);
        assert_eq!(cmd.params.setup, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(cmd.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(cmd.iso_packet_descriptor.is_empty());
        assert_eq!(cmd.to_bytes(), bytes.to_vec());
    }

    #[test]
    fn in_submit_carries_no_payload() {
        setup_test_logger();
        let cmd = SubmitCommand {
            header: UsbIpHeaderBasic {
                command: USBIP_CMD_SUBMIT,
                seqnum: 9,
                devid: 0,
                direction: 1,
                ep: 1,
            },
            params: SubmitParams {
                transfer_buffer_length: 512,
                ..SubmitParams::default()
            },
            data: vec![],
            iso_packet_descriptor: vec![],
        };
        let bytes = cmd.to_bytes();
        assert_eq!(bytes.len(), URB_HEADER_LEN + SUBMIT_PARAMS_LEN);
        assert_eq!(SubmitCommand::decode(&bytes, DEFAULT_MAX_TRANSFER).unwrap(), cmd);
    }

    #[test]
    fn oversized_submit_is_rejected() {
        setup_test_logger();
        let mut bytes = SubmitCommand {
            header: UsbIpHeaderBasic {
                command: USBIP_CMD_SUBMIT,
                seqnum: 1,
                devid: 0,
                direction: 0,
                ep: 2,
            },
            params: SubmitParams {
                transfer_buffer_length: 2000,
                ..SubmitParams::default()
            },
            data: vec![],
            iso_packet_descriptor: vec![],
        }
        .to_bytes();
        bytes.extend(vec![0x55; 2000]);

        assert_eq!(
            SubmitCommand::decode(&bytes, DEFAULT_MAX_TRANSFER),
            Err(WireError::PayloadTooLarge {
                declared: 2000,
                max: DEFAULT_MAX_TRANSFER
            })
        );
        // exactly at the bound is fine
        let params = SubmitParams {
            transfer_buffer_length: DEFAULT_MAX_TRANSFER as u32,
            ..SubmitParams::default()
        };
        assert!(params.check_bounds(DEFAULT_MAX_TRANSFER).is_ok());
    }

    #[test]
    fn iso_descriptor_count_is_bounded() {
        setup_test_logger();
        let params = SubmitParams {
            number_of_packets: 0xFFFF_FFFF,
            ..SubmitParams::default()
        };
        assert_eq!(params.iso_descriptor_len(), 0);

        let params = SubmitParams {
            number_of_packets: 2,
            ..SubmitParams::default()
        };
        assert_eq!(params.iso_descriptor_len(), 32);

        let params = SubmitParams {
            number_of_packets: 0x1000_0000,
            ..SubmitParams::default()
        };
        assert!(matches!(
            params.check_bounds(DEFAULT_MAX_TRANSFER),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_reported() {
        setup_test_logger();
        let mut bytes = SubmitCommand {
            header: UsbIpHeaderBasic {
                command: USBIP_CMD_SUBMIT,
                seqnum: 1,
                devid: 0,
                direction: 0,
                ep: 2,
            },
            params: SubmitParams {
                transfer_buffer_length: 8,
                ..SubmitParams::default()
            },
            data: vec![],
            iso_packet_descriptor: vec![],
        }
        .to_bytes();
        bytes.extend([1, 2, 3]);
        assert_eq!(
            SubmitCommand::decode(&bytes, DEFAULT_MAX_TRANSFER),
            Err(WireError::TruncatedPayload {
                expected: 56,
                available: 51
            })
        );
    }

    #[test]
    fn decode_usbip_cmd_unlink() {
        setup_test_logger();
        let bytes = [
            0x00, 0x00, 0x00, 0x02, // command
            0x00, 0x00, 0x00, 0x2B, // seqnum
            0x00, 0x00, 0x00, 0x02, // devid
            0x00, 0x00, 0x00, 0x00, // direction
            0x00, 0x00, 0x00, 0x04, // ep
            0x00, 0x00, 0x00, 0x2A, // unlink_seqnum
            0x00, 0x00, 0x00, 0x00, // padding
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
        ];
        let cmd = UnlinkCommand::decode(&bytes).unwrap();
        assert_eq!(cmd.header.command, USBIP_CMD_UNLINK);
        assert_eq!(cmd.header.seqnum, 43);
        assert_eq!(cmd.unlink_seqnum, 42);
        assert_eq!(cmd.to_bytes(), bytes.to_vec());
    }

    #[test]
    fn byte_serialize_usbip_ret_unlink() {
        setup_test_logger();
        let reply = UnlinkReply::new(7, 0);
        let bytes = reply.to_bytes();
        assert_eq!(
            bytes.to_vec(),
            vec![
                0x00, 0x00, 0x00, 0x04, // command
                0x00, 0x00, 0x00, 0x07, // seqnum
                0x00, 0x00, 0x00, 0x00, // devid
                0x00, 0x00, 0x00, 0x00, // direction
                0x00, 0x00, 0x00, 0x00, // ep
                0x00, 0x00, 0x00, 0x00, // status
                0x00, 0x00, 0x00, 0x00, // padding
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
            ]
        );
    }

    #[test]
    fn unlink_reply_keeps_status_and_zero_padding() {
        setup_test_logger();
        let reply = UnlinkReply::new(0x0102_0304, 0xFFFF_FF98);
        let bytes = reply.to_bytes();
        let decoded = UnlinkReply::decode(&bytes).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.status, 0xFFFF_FF98);
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_import_request() {
        setup_test_logger();
        let req = ImportRequest {
            status: 0,
            busid: busid_bytes("1-1"),
        };
        let bytes = req.to_bytes(USBIP_VERSION);
        assert_eq!(bytes.len(), COMMON_HEADER_LEN + IMPORT_BODY_LEN);
        assert_eq!(&bytes[..4], &[0x01, 0x11, 0x80, 0x03]);
        let decoded = ImportRequest::decode(&bytes[COMMON_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.busid_str(), "1-1");
    }

    #[test]
    fn byte_serialize_usbip_ret_submit() {
        setup_test_logger();
        let res = UsbIpResponse::usbip_ret_submit_success(2, 4, vec![0xFF; 4]);
        assert_eq!(
            res.to_bytes(),
            vec![
                0x00, 0x00, 0x00, 0x03, // command
                0x00, 0x00, 0x00, 0x02, // seqnum
                0x00, 0x00, 0x00, 0x00, // devid
                0x00, 0x00, 0x00, 0x00, // direction
                0x00, 0x00, 0x00, 0x00, // ep
                0x00, 0x00, 0x00, 0x00, // status
                0x00, 0x00, 0x00, 0x04, // actual_length
                0x00, 0x00, 0x00, 0x00, // start_frame
                0x00, 0x00, 0x00, 0x00, // number_of_packets
                0x00, 0x00, 0x00, 0x00, // error_count
                0x00, 0x00, 0x00, 0x00, // padding
                0x00, 0x00, 0x00, 0x00, //
                0xFF, 0xFF, 0xFF, 0xFF, // transfer_buffer
            ]
        );

        let res = UsbIpResponse::usbip_ret_submit_fail(5, 32);
        let bytes = res.to_bytes();
        assert_eq!(bytes.len(), RET_SUBMIT_HEADER_LEN);
        // -EPIPE
        assert_eq!(&bytes[20..24], &[0xFF, 0xFF, 0xFF, 0xE0]);
    }

    #[test]
    fn byte_serialize_op_rep_import() {
        setup_test_logger();
        let device = ExportedDevice::default();
        let res = UsbIpResponse::op_rep_import_success(USBIP_VERSION, &device);
        assert_eq!(
            res.to_bytes(),
            [
                vec![0x01, 0x11],             // version
                vec![0x00, 0x03],             // command
                vec![0x00, 0x00, 0x00, 0x00], // status
                device.to_bytes(),
            ]
            .concat()
        );

        let res = UsbIpResponse::op_rep_import_fail(USBIP_VERSION);
        assert_eq!(
            res.to_bytes(),
            vec![
                0x01, 0x11, // version
                0x00, 0x03, // command
                0x00, 0x00, 0x00, 0x01, // status
            ]
        );
    }

    #[test]
    fn byte_serialize_op_rep_devlist() {
        setup_test_logger();
        let device = ExportedDevice::default();
        let res = UsbIpResponse::op_rep_devlist(USBIP_VERSION, &[device.clone()]);
        assert_eq!(
            res.to_bytes(),
            [
                vec![0x01, 0x11],             // version
                vec![0x00, 0x05],             // command
                vec![0x00, 0x00, 0x00, 0x00], // status
                vec![0x00, 0x00, 0x00, 0x01], // device_count
                device.to_bytes_with_interfaces(),
            ]
            .concat()
        );
    }
}
