use super::{DescriptorKind, FEATURE_DEVICE_REMOTE_WAKEUP, FEATURE_ENDPOINT_HALT};

/// The 8-byte SETUP packet that opens every control transfer (USB2 9.3).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;

impl Setup {
    /// True when the data stage, if any, moves device-to-host.
    pub const fn is_device_to_host(&self) -> bool {
        self.kind & USB_SETUP_DIR_BIT != 0
    }
    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }
    pub const fn req_recipient(&self) -> u8 {
        self.kind & USB_SETUP_RECIPIENT_MASK
    }

    /// The packet as it goes over the wire, multi-byte fields little-endian.
    pub fn to_bytes(&self) -> [u8; 8] {
        [
            self.kind,
            self.request,
            self.value as u8,
            (self.value >> 8) as u8,
            self.index as u8,
            (self.index >> 8) as u8,
            self.length as u8,
            (self.length >> 8) as u8,
        ]
    }

    pub const fn get_status() -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetStatus as u8,
            value: 0,
            index: 0,
            length: 2,
        }
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::ClearFeature as u8,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) addressed to one endpoint, used to recover
    /// a stalled pipe (USB2 9.4.5).
    pub const fn clear_endpoint_halt(endpoint_address: u8) -> Self {
        Self {
            kind: 0b0000_0010,
            request: SetupReq::ClearFeature as u8,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint_address as u16,
            length: 0,
        }
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetFeature as u8,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    /// SET_FEATURE(DEVICE_REMOTE_WAKEUP), issued before suspending so the
    /// device may signal resume on its own.
    pub const fn enable_remote_wakeup() -> Self {
        Self::set_feature(FEATURE_DEVICE_REMOTE_WAKEUP)
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetAddress as u8,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn get_configuration() -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetConfiguration as u8,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetConfiguration as u8,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: 0b0000_0001,
            request: SetupReq::SetInterface as u8,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }
}

/// A setup packet plus the host-side transfer policy that goes with it.
///
/// `incomplete_read` asks the control engine to stop the IN data stage after a
/// single packet no matter what `setup.length` says. The enumeration machine
/// uses this for the very first GET_DESCRIPTOR, when the control pipe is still
/// configured with a guessed maximum packet size.
#[derive(Clone, Copy, Debug)]
pub struct SetupRequest {
    pub setup: Setup,
    pub incomplete_read: bool,
}

impl SetupRequest {
    pub const fn new(setup: Setup) -> Self {
        Self {
            setup,
            incomplete_read: false,
        }
    }

    /// The truncated device-descriptor fetch that opens enumeration: ask for a
    /// full descriptor, read one packet.
    pub const fn get_device_descriptor_head() -> Self {
        Self {
            setup: Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18),
            incomplete_read: true,
        }
    }
}

impl From<Setup> for SetupRequest {
    fn from(setup: Setup) -> Self {
        Self::new(setup)
    }
}
