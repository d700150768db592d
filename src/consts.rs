use num_derive::FromPrimitive;

/// USB speeds as numbered in the USB/IP device record
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsbSpeed {
    Unknown = 0x0,
    Low,
    Full,
    High,
    Wireless,
    Super,
    SuperPlus,
}

impl From<rusb::Speed> for UsbSpeed {
    fn from(speed: rusb::Speed) -> Self {
        match speed {
            rusb::Speed::Low => UsbSpeed::Low,
            rusb::Speed::Full => UsbSpeed::Full,
            rusb::Speed::High => UsbSpeed::High,
            rusb::Speed::Super => UsbSpeed::Super,
            rusb::Speed::SuperPlus => UsbSpeed::SuperPlus,
            _ => UsbSpeed::Unknown,
        }
    }
}

/// Endpoint transfer types, the low two bits of bmAttributes
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum EndpointAttributes {
    Control = 0,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Direction bit of an endpoint address
pub const ENDPOINT_DIR_IN: u8 = 0x80;

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn speed_numbering() {
        // USB/IP skips 4 for wireless, libusb does not
        assert_eq!(UsbSpeed::from(rusb::Speed::Super) as u32, 5);
        assert_eq!(UsbSpeed::from(rusb::Speed::High) as u32, 3);
        assert_eq!(UsbSpeed::from(rusb::Speed::Unknown) as u32, 0);
    }

    #[test]
    fn endpoint_attributes_from_bm_attributes() {
        assert_eq!(
            EndpointAttributes::from_u8(0x02),
            Some(EndpointAttributes::Bulk)
        );
        assert_eq!(
            EndpointAttributes::from_u8(0x03),
            Some(EndpointAttributes::Interrupt)
        );
        assert_eq!(EndpointAttributes::from_u8(0x04), None);
    }
}
