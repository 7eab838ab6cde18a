use plain::Plain;

/// A USB Configuration Descriptor (USB2 9.6.3).
///
/// Fetching a configuration returns this header followed by every interface
/// and endpoint descriptor of the configuration in one byte stream;
/// `total_length` covers the whole stream.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl Plain for ConfigDescriptor {}

/// Set in `attributes` when the device can signal remote wakeup (USB2 Table 9-10).
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 1 << 5;

impl ConfigDescriptor {
    pub fn supports_remote_wakeup(&self) -> bool {
        self.attributes & CONFIG_ATTR_REMOTE_WAKEUP != 0
    }
}
