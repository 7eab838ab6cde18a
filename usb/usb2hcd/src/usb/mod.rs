//! The Universal Serial Bus (USB) wire formats.
//!
//! The types in this module describe the standard chapter-9 structures a USB 2.0
//! host exchanges with an attached device during enumeration: setup packets and
//! the device/configuration/interface/endpoint descriptors.
//!
//! The [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! is the document that informs this implementation; references of the form
//! "USB2 9.x" point into it.
pub use self::config::ConfigDescriptor;
pub use self::device::{DeviceDescriptor, DeviceDescriptorHead};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ADDR_DIR_BIT, ENDP_ATTR_TY_MASK};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{Setup, SetupReq, SetupRequest};

/// Enumerates the descriptor kinds a USB 2.0 device can report to the host.
/// (See USB2 Table 9-5)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    /// A Device Descriptor. See [DeviceDescriptor]
    Device = 1,
    /// A Configuration Descriptor. See [ConfigDescriptor]
    Configuration = 2,
    /// A String Descriptor (USB2 9.6.7). Index 0 is the LANGID table.
    String = 3,
    /// An Interface Descriptor. See [InterfaceDescriptor]
    Interface = 4,
    /// An Endpoint Descriptor. See [EndpointDescriptor]
    Endpoint = 5,
    /// A Device Qualifier (USB2 9.6.2).
    DeviceQualifier = 6,
    /// The "Other Speed Configuration" descriptor (USB2 9.6.4).
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
}

/// Standard feature selectors used with SET_FEATURE/CLEAR_FEATURE.
/// (USB2 Table 9-6)
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod interface;
pub(crate) mod setup;
