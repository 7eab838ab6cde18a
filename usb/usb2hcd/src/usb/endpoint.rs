use plain::Plain;

/// The descriptor for a USB Endpoint.
///
/// Each endpoint of an interface has its own descriptor, returned as part of
/// the configuration descriptor stream; it cannot be requested individually.
///
/// See USB2 9.6.6; field offsets are described in USB2 Table 9-13.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

/// Mask that is ANDed with [EndpointDescriptor].attributes to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

/// Set in [EndpointDescriptor].address for IN endpoints.
pub const ENDP_ADDR_DIR_BIT: u8 = 1 << 7;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            3 => EndpointTy::Interrupt,
            _ => unreachable!(),
        }
    }
    pub fn is_in(&self) -> bool {
        self.address & ENDP_ADDR_DIR_BIT != 0
    }
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
    /// wMaxPacketSize bits 10..0; the upper bits only matter for
    /// high-speed high-bandwidth endpoints.
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }
}
