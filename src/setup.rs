/// Parse the SETUP packet of control transfers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Parse a [SetupPacket] from the raw setup bytes of a CMD_SUBMIT.
    ///
    /// Unlike the USB/IP headers around it, the setup packet is little-endian.
    pub fn parse(setup: &[u8; 8]) -> SetupPacket {
        SetupPacket {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_le_bytes([setup[2], setup[3]]),
            index: u16::from_le_bytes([setup[4], setup[5]]),
            length: u16::from_le_bytes([setup[6], setup[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get_device_descriptor() {
        let setup = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, 6);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 18);
    }

    #[test]
    fn parse_set_configuration() {
        let setup = SetupPacket::parse(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(setup.request_type, 0);
        assert_eq!(setup.value, 1);
    }
}
