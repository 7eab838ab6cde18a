//! Application-supplied device and class tables.
//!
//! The enumeration machine consults these tables to decide whether an
//! attached device is one the application wants: an optional strict VID/PID
//! allow-list and a class/subclass/protocol table selecting which interfaces
//! get pipes. Both are TOML-loadable; a built-in table is embedded in the
//! crate as `devices.toml`.

use lazy_static::lazy_static;
use serde::Deserialize;

/// One vendor's worth of allowed products.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceEntry {
    pub vendor: u16,
    pub products: Vec<u16>,
}

/// One interface class the application supports.
#[derive(Clone, Debug, Deserialize)]
pub struct ClassEntry {
    pub name: String,
    pub class: u8,
    // The subclass/protocol may be meaningless for some classes, hence
    // negative values (and values above 255) mean "match any".
    #[serde(default = "any_code")]
    pub subclass: i16,
    #[serde(default = "any_code")]
    pub protocol: i16,
}

fn any_code() -> i16 {
    -1
}

fn enabled() -> bool {
    true
}

impl ClassEntry {
    pub fn subclass(&self) -> Option<u8> {
        u8::try_from(self.subclass).ok()
    }
    pub fn protocol(&self) -> Option<u8> {
        u8::try_from(self.protocol).ok()
    }

    pub fn matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class == class
            && self.subclass().map(|s| s == subclass).unwrap_or(true)
            && self.protocol().map(|p| p == protocol).unwrap_or(true)
    }
}

/// The complete matching policy for one host controller.
#[derive(Clone, Debug, Deserialize)]
pub struct DevicePolicy {
    /// Reject devices whose VID/PID is not listed in `devices`.
    #[serde(default)]
    pub strict_vid_pid: bool,
    /// Restart enumeration from `Unattached` after a terminal error.
    #[serde(default)]
    pub error_restart: bool,
    /// Allocate and configure a hardware pipe for every endpoint of a matched
    /// interface during enumeration. When disabled the interface table is
    /// still filled, but without endpoint bindings.
    #[serde(default = "enabled")]
    pub auto_config_endpoints: bool,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub classes: Vec<ClassEntry>,
}

impl DevicePolicy {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        Ok(toml::from_str::<DevicePolicy>(s)?.normalized())
    }

    /// Sort the device groups so `contains_vid_pid` can binary-search them.
    fn normalized(mut self) -> Self {
        self.devices.sort_by_key(|d| d.vendor);
        self
    }

    pub fn contains_vid_pid(&self, vendor: u16, product: u16) -> bool {
        self.devices
            .binary_search_by_key(&vendor, |d| d.vendor)
            .map(|i| self.devices[i].products.contains(&product))
            .unwrap_or(false)
    }

    pub fn matching_class(&self, class: u8, subclass: u8, protocol: u8) -> Option<&ClassEntry> {
        self.classes
            .iter()
            .find(|entry| entry.matches(class, subclass, protocol))
    }
}

lazy_static! {
    static ref DEFAULT_POLICY: DevicePolicy = {
        const TOML: &str = include_str!("../../devices.toml");

        DevicePolicy::from_toml_str(TOML).expect("Failed to parse internally embedded device table")
    };
}

impl Default for DevicePolicy {
    fn default() -> Self {
        DEFAULT_POLICY.clone()
    }
}
