//! Implements the "Device" USB Descriptor.
//!
//! This descriptor is described in USB2 section 9.6.1

use plain::Plain;

/// A USB Device Descriptor.
///
/// This "provides information that applies globally to the device and all the
/// device's configurations" (USB2 9.6.1). A given device will only have one
/// device descriptor.
///
/// USB2 Table 9-8 describes the USB packet offsets of the fields described by
/// this structure.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// The length of this descriptor in bytes.
    pub length: u8,
    /// The descriptor type. See [super::DescriptorKind]
    pub kind: u8,
    /// The USB standard version in binary-coded decimal; USB 2.0 is 200H.
    pub usb: u16,
    /// The USB Class Code, assigned by USB-IF.
    ///
    /// A value of FFH indicates a vendor-specific class. A value of 0 indicates
    /// that each interface in a configuration provides its own class
    /// information.
    pub class: u8,
    /// The USB Sub Class Code, qualifying `class`.
    pub sub_class: u8,
    /// The USB Protocol code, qualified by `class` and `sub_class`.
    pub protocol: u8,
    /// The maximum packet size for endpoint zero, in bytes (8, 16, 32 or 64).
    pub packet_size: u8,
    /// The USB Vendor ID.
    pub vendor: u16,
    /// The USB Product ID.
    pub product: u16,
    /// The device release number in binary-coded decimal.
    pub release: u16,
    /// Index of the String Descriptor describing the device manufacturer.
    pub manufacturer_str: u8,
    /// Index of the String Descriptor describing the product.
    pub product_str: u8,
    /// Index of the String Descriptor holding the device's serial number.
    pub serial_str: u8,
    /// The number of configurations this device offers.
    pub configurations: u8,
}

unsafe impl Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub fn major_version(&self) -> u8 {
        ((self.usb & 0xFF00) >> 8) as u8
    }
    pub fn minor_version(&self) -> u8 {
        self.usb as u8
    }
}

/// The head of the device descriptor, as fetched by the very first
/// GET_DESCRIPTOR of an enumeration pass.
///
/// Until bMaxPacketSize0 is known the host may only rely on the first 8 bytes
/// of the device descriptor arriving in one packet (USB2 5.5.3), so the first
/// fetch is truncated and only this prefix is decoded from it.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptorHead {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// The maximum packet size for endpoint zero.
    pub packet_size: u8,
}

unsafe impl Plain for DeviceDescriptorHead {}
